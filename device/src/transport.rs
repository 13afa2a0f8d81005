//! Remote command transport
//!
//! The telescope controller is driven by shell commands on its host. The
//! production transport keeps an OpenSSH ControlMaster session open and
//! multiplexes every command over it.

use crate::error::{DeviceError, DeviceResult};
use crate::protocol::{PROBE_COMMAND, PROBE_REPLY};
use crate::retry::{retry, RetryError, RetryPolicy};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Output of one remote command
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Stdout lines joined with a space and trimmed
    pub fn text(&self) -> String {
        self.stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// A session able to run controller commands
#[async_trait]
pub trait Transport: Send + Sync {
    /// Run one command and return its raw output
    async fn exec(&self, command: &str) -> DeviceResult<CommandOutput>;

    /// Re-establish the remote session
    async fn reconnect(&self) -> DeviceResult<()>;

    /// Human readable name for logs
    fn describe(&self) -> String;

    /// Check that the session still answers
    async fn probe(&self) -> bool {
        match self.exec(PROBE_COMMAND).await {
            Ok(output) => output.success() && output.stdout.contains(PROBE_REPLY),
            Err(_) => false,
        }
    }
}

/// SSH session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub host: String,
    pub username: String,
    pub port: u16,
    /// ControlMaster socket path
    pub control_path: PathBuf,
    /// Timeout for establishing the master session
    pub connect_timeout_secs: u64,
    /// Timeout for a single command; exposures can take many minutes
    pub command_timeout_secs: u64,
    /// Backoff used when re-establishing the session
    pub reconnect: RetryPolicy,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: "telescope.local".to_string(),
            username: "queue".to_string(),
            port: 22,
            control_path: std::env::temp_dir().join("atlas-telescope.sock"),
            connect_timeout_secs: 30,
            command_timeout_secs: 3600,
            reconnect: RetryPolicy {
                max_attempts: 5,
                delay_ms: 1000,
                backoff_multiplier: 2.0,
                max_delay_ms: 30_000,
                use_jitter: true,
            },
        }
    }
}

impl SshConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }
}

/// Transport over a multiplexed OpenSSH session
pub struct SshTransport {
    config: SshConfig,
    /// Serializes master (re)creation
    master: Mutex<()>,
}

impl SshTransport {
    pub fn new(config: SshConfig) -> Self {
        Self {
            config,
            master: Mutex::new(()),
        }
    }

    /// Open the master session
    pub async fn connect(&self) -> DeviceResult<()> {
        let _guard = self.master.lock().await;
        self.start_master().await
    }

    fn base_command(&self) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-S")
            .arg(&self.config.control_path)
            .arg("-p")
            .arg(self.config.port.to_string())
            .arg("-o")
            .arg("BatchMode=yes")
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    async fn start_master(&self) -> DeviceResult<()> {
        let destination = self.config.destination();
        info!("Opening SSH session to {}", destination);

        let mut cmd = self.base_command();
        cmd.arg("-M")
            .arg("-f")
            .arg("-N")
            .arg("-o")
            .arg("ControlPersist=yes")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.config.connect_timeout_secs))
            .arg(&destination);

        let output = match timeout(self.config.connect_timeout(), cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(DeviceError::ReconnectionFailed {
                    host: self.config.host.clone(),
                    message: format!("failed to spawn ssh: {}", e),
                })
            }
            Err(_) => {
                return Err(DeviceError::ReconnectionFailed {
                    host: self.config.host.clone(),
                    message: format!(
                        "timed out after {:?}",
                        self.config.connect_timeout()
                    ),
                })
            }
        };

        if !output.status.success() {
            return Err(DeviceError::ReconnectionFailed {
                host: self.config.host.clone(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        info!("SSH session to {} established", destination);
        Ok(())
    }

    async fn stop_master(&self) {
        let mut cmd = self.base_command();
        cmd.arg("-O").arg("exit").arg(self.config.destination());
        if let Err(e) = cmd.output().await {
            debug!("Closing stale SSH master failed: {}", e);
        }
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn exec(&self, command: &str) -> DeviceResult<CommandOutput> {
        debug!("ssh {} -- {}", self.config.host, command);

        let mut cmd = self.base_command();
        cmd.arg(self.config.destination()).arg("--").arg(command);

        match timeout(self.config.command_timeout(), cmd.output()).await {
            Ok(Ok(output)) => Ok(CommandOutput {
                // ssh reports a signal-killed remote as no code
                status: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }),
            Ok(Err(e)) => Err(DeviceError::transport(command, e.to_string())),
            Err(_) => Err(DeviceError::transport(
                command,
                format!("timed out after {:?}", self.config.command_timeout()),
            )),
        }
    }

    async fn reconnect(&self) -> DeviceResult<()> {
        let _guard = self.master.lock().await;
        self.stop_master().await;

        let result = retry(
            &self.config.reconnect,
            "SSH reconnect",
            DeviceError::is_retryable,
            |attempt| {
                info!(
                    "Reconnecting to {} (attempt {}/{})",
                    self.config.host, attempt, self.config.reconnect.max_attempts
                );
                self.start_master()
            },
        )
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(RetryError::Aborted(e)) => Err(e),
            Err(RetryError::Exhausted {
                attempts,
                last_error,
            }) => {
                warn!(
                    "Giving up on {} after {} reconnection attempts",
                    self.config.host, attempts
                );
                Err(DeviceError::ReconnectionFailed {
                    host: self.config.host.clone(),
                    message: last_error.to_string(),
                })
            }
        }
    }

    fn describe(&self) -> String {
        format!("ssh://{}:{}", self.config.destination(), self.config.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_text_joins_lines() {
        let output = CommandOutput::ok("  slit=open \n\n az=180\n");
        assert_eq!(output.text(), "slit=open az=180");
        assert!(output.success());
    }

    #[test]
    fn test_failed_output() {
        let output = CommandOutput::failed(255, "Connection closed");
        assert!(!output.success());
        assert_eq!(output.text(), "");
    }

    #[test]
    fn test_ssh_config_defaults() {
        let config = SshConfig::default();
        assert_eq!(config.port, 22);
        assert_eq!(config.command_timeout(), Duration::from_secs(3600));
        assert_eq!(config.reconnect.max_attempts, 5);
        assert_eq!(config.destination(), "queue@telescope.local");
    }

    #[test]
    fn test_describe() {
        let transport = SshTransport::new(SshConfig {
            host: "obs.example.org".to_string(),
            username: "atlas".to_string(),
            ..Default::default()
        });
        assert_eq!(transport.describe(), "ssh://atlas@obs.example.org:22");
    }
}

//! Device channel error types
//!
//! Transport failures are retried by the channel; parse failures are not.

use std::time::Duration;
use thiserror::Error;

/// Errors raised while talking to the telescope controller
#[derive(Debug, Clone, Error)]
pub enum DeviceError {
    /// The remote session could not carry the command
    #[error("Transport error running '{command}': {message}")]
    Transport { command: String, message: String },

    /// The command ran but the controller reported failure
    #[error("Command '{command}' exited with status {status}: {output}")]
    NonZeroExit {
        command: String,
        status: i32,
        output: String,
    },

    /// Remote session could not be re-established
    #[error("Reconnection to {host} failed: {message}")]
    ReconnectionFailed { host: String, message: String },

    /// A reply did not have the shape the protocol table expects
    #[error("Unable to parse {operation} reply {reply:?} with pattern {pattern:?}")]
    Parse {
        operation: String,
        pattern: String,
        reply: String,
    },

    /// A reply pattern in the protocol table failed to compile
    #[error("Invalid reply pattern for {operation}: {message}")]
    InvalidPattern { operation: String, message: String },

    /// Operation refused because conditions are unsafe
    #[error("Refusing to {action}: weather is unsafe")]
    WeatherUnsafe { action: String },

    /// Weather did not clear within the configured maximum wait
    #[error("Weather did not become safe within {waited:?}")]
    WeatherTimeout { waited: Duration },

    /// Controller accepted the command but the result does not match the request
    #[error("{operation} was not applied: {detail}")]
    NotApplied { operation: String, detail: String },

    /// Operation needs a state the telescope is not in
    #[error("Invalid state for {operation}: {detail}")]
    InvalidState { operation: String, detail: String },

    /// Bounded retry gave up
    #[error("Retry exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted { attempts: u32, last_error: String },
}

impl DeviceError {
    pub fn transport(command: impl Into<String>, message: impl Into<String>) -> Self {
        DeviceError::Transport {
            command: command.into(),
            message: message.into(),
        }
    }

    pub fn parse(
        operation: impl Into<String>,
        pattern: impl Into<String>,
        reply: impl Into<String>,
    ) -> Self {
        DeviceError::Parse {
            operation: operation.into(),
            pattern: pattern.into(),
            reply: reply.into(),
        }
    }

    /// Check if this error is worth another attempt on the same command
    pub fn is_retryable(&self) -> bool {
        match self {
            DeviceError::Transport { .. } => true,
            DeviceError::NonZeroExit { .. } => true,
            DeviceError::ReconnectionFailed { .. } => true,
            // A reply we cannot read will not read better the second time
            DeviceError::Parse { .. } => false,
            DeviceError::InvalidPattern { .. } => false,
            DeviceError::WeatherUnsafe { .. } => false,
            DeviceError::WeatherTimeout { .. } => false,
            DeviceError::NotApplied { .. } => false,
            DeviceError::InvalidState { .. } => false,
            DeviceError::RetryExhausted { .. } => false,
        }
    }

    /// Errors that must end the night rather than a single observation
    pub fn is_fatal(&self) -> bool {
        matches!(self, DeviceError::WeatherTimeout { .. })
    }
}

/// Result type for device operations
pub type DeviceResult<T> = Result<T, DeviceError>;

use anyhow::Context;
use atlas_device::{DeviceChannel, SimulatedTransport, SshTransport, Transport};
use atlas_sequencer::{
    AtlasConfig, BusMessage, BusNotifier, BusPipeline, ExecutorParts, LowPrecisionEphemeris,
    MemoryQueueStore, MessageBus, SesameResolver, SessionExecutor, SolveFieldSolver, SystemClock,
    Topic,
};
use chrono::{DateTime, Local, NaiveTime, TimeZone};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tokio::sync::broadcast;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Keeps the log file writer alive
static LOG_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

#[derive(Parser, Debug)]
#[command(author, version, about = "Robotic telescope queue controller", long_about = None)]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Queue store file, overrides queue.store_path
    #[arg(long)]
    store: Option<PathBuf>,

    /// Drive the in-memory simulated controller instead of the telescope
    #[arg(long)]
    simulate: bool,

    /// Run a single night now and exit
    #[arg(long)]
    once: bool,

    /// Directory for daily rolling log files, overrides general.log_dir
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

fn init_logging(log_dir: Option<&Path>) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console_layer = fmt::layer().with_target(false);

    let file_layer = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let file_appender = tracing_appender::rolling::daily(dir, "atlas.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            LOG_GUARD.set(guard).ok();
            Some(
                fmt::layer()
                    .with_target(true)
                    .with_ansi(false)
                    .with_writer(non_blocking),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;
    Ok(())
}

/// Next occurrence of `start` in local time, today if it is still ahead
fn next_start(now: DateTime<Local>, start: NaiveTime) -> DateTime<Local> {
    let today = now.date_naive().and_time(start);
    let candidate = Local
        .from_local_datetime(&today)
        .earliest()
        .unwrap_or(now);
    if candidate > now {
        candidate
    } else {
        let tomorrow = today + chrono::Duration::days(1);
        Local
            .from_local_datetime(&tomorrow)
            .earliest()
            .unwrap_or(candidate + chrono::Duration::days(1))
    }
}

/// Log what would go to the notification relay and the pipeline
fn log_outbound(bus: &MessageBus) -> tokio::task::JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(BusMessage { topic, payload }) => {
                    if matches!(topic, Topic::Notify | Topic::Pipeline) {
                        tracing::info!("{}: {}", topic, payload);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Outbound logger skipped {} messages", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => AtlasConfig::load(path)
            .await
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => AtlasConfig::default(),
    };
    if let Some(store) = args.store {
        config.queue.store_path = store;
    }
    if args.log_dir.is_some() {
        config.general.log_dir = args.log_dir;
    }

    init_logging(config.general.log_dir.as_deref())?;
    tracing::info!("{} queue controller starting", config.general.name);

    let transport: Arc<dyn Transport> = if args.simulate {
        tracing::info!("Using the simulated telescope controller");
        Arc::new(SimulatedTransport::new())
    } else {
        let ssh = SshTransport::new(config.telescope.ssh.clone());
        ssh.connect().await.with_context(|| {
            format!("Failed to connect to {}", config.telescope.ssh.host)
        })?;
        Arc::new(ssh)
    };
    let channel = Arc::new(
        DeviceChannel::new(transport, config.channel_config())
            .context("Invalid controller dialect")?,
    );

    let store = Arc::new(
        MemoryQueueStore::open(&config.queue.store_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to open queue store {}",
                    config.queue.store_path.display()
                )
            })?,
    );
    let resolver =
        Arc::new(SesameResolver::new(&config.resolver).context("Failed to build name resolver")?);

    let bus = Arc::new(MessageBus::new(config.bus.capacity));
    let _telescope_events = bus.forward_telescope_events(channel.subscribe());
    let _outbound = log_outbound(&bus);

    let start_time = config.start_time()?;
    let parts = ExecutorParts {
        channel: channel.clone(),
        store,
        resolver,
        ephemeris: Arc::new(LowPrecisionEphemeris::new(config.site)),
        solver: Arc::new(SolveFieldSolver::new(channel)),
        clock: Arc::new(SystemClock),
        bus: bus.clone(),
        notifier: Arc::new(BusNotifier::new(bus.clone())),
        pipeline: Arc::new(BusPipeline::new(bus.clone())),
    };
    let executor = Arc::new(SessionExecutor::new(parts, config));
    let _control = executor.listen();

    if args.once {
        let report = executor.run_night().await.context("Night ended with an error")?;
        tracing::info!(
            "Night complete: {} observed, {} failed",
            report.completed.len(),
            report.failed.len()
        );
        return Ok(());
    }

    loop {
        let start = next_start(Local::now(), start_time);
        let wait = (start - Local::now()).to_std().unwrap_or_default();
        tracing::info!("Next night starts at {}", start.format("%Y-%m-%d %H:%M"));

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = executor.start_requested() => tracing::info!("Starting early on request"),
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted; exiting");
                return Ok(());
            }
        }

        match executor.run_night().await {
            Ok(report) => tracing::info!(
                "Night complete: {} observed, {} failed",
                report.completed.len(),
                report.failed.len()
            ),
            Err(e) => tracing::error!("Night ended with an error: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_start_today_or_tomorrow() {
        let start = NaiveTime::from_hms_opt(18, 0, 0).unwrap();

        let afternoon = Local.with_ymd_and_hms(2024, 3, 1, 14, 0, 0).unwrap();
        let next = next_start(afternoon, start);
        assert_eq!(next, Local.with_ymd_and_hms(2024, 3, 1, 18, 0, 0).unwrap());

        let evening = Local.with_ymd_and_hms(2024, 3, 1, 21, 0, 0).unwrap();
        let next = next_start(evening, start);
        assert_eq!(next, Local.with_ymd_and_hms(2024, 3, 2, 18, 0, 0).unwrap());
    }
}

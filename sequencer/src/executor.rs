//! Nightly session executor
//!
//! Runs one night end to end: take the hardware lock, calibrate if enabled,
//! wait for good weather, then work through the night's sessions. Inside a
//! session the executor repeatedly schedules the best pending observation,
//! waits for it and executes it. The dome is closed and the lock released
//! however the night ends.

use crate::bus::{MessageBus, QueueCommand, Topic};
use crate::calibration::Calibration;
use crate::clock::Clock;
use crate::config::AtlasConfig;
use crate::ephemeris::Ephemeris;
use crate::error::{SessionError, SessionResult};
use crate::notify::{completion_message, group_by_owner, Notifier, PipelineTrigger};
use crate::observation::ObservationRunner;
use crate::pinpoint::{Pinpoint, PlateSolver};
use crate::scheduler::{Scheduler, Sky, Window};
use crate::store::{Observation, QueueStore, Session};
use crate::target::{self, TargetResolver};
use atlas_device::{retry, DeviceChannel, DeviceError, RetryError, RetryPolicy};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// State of the session executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorState {
    Idle,
    AcquiringLock,
    AwaitingWeather,
    Calibrating,
    Scheduling,
    Waiting,
    Executing,
    Completing,
    ClosedDown,
}

/// Event emitted by the executor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExecutorEvent {
    StateChanged(ExecutorState),
    SessionStarted { id: String, program: String },
    ObservationStarted { id: String, target: String },
    ObservationCompleted { id: String, target: String, directory: String },
    ObservationFailed { id: String, target: String, code: String },
    NightCompleted { completed: usize, failed: usize },
    NightFailed { error: String },
}

/// Hardware lock acquisition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub attempts: u32,
    /// Pause between attempts, seconds
    pub pause_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            attempts: 6,
            pause_secs: 300,
        }
    }
}

impl LockConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.attempts, Duration::from_secs(self.pause_secs))
    }
}

#[derive(Debug, Error)]
enum LockRefusal {
    #[error("lock held by another user")]
    Held,
    #[error(transparent)]
    Device(#[from] DeviceError),
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletedObservation {
    pub observation: Observation,
    pub directory: String,
    pub frames: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedObservation {
    pub id: String,
    pub target: String,
    pub code: String,
}

/// What happened during one night
#[derive(Debug, Clone, Default, Serialize)]
pub struct NightReport {
    pub completed: Vec<CompletedObservation>,
    pub failed: Vec<FailedObservation>,
    /// The operator disabled the executor before the night was over
    pub stopped: bool,
}

/// Collaborators the executor drives
pub struct ExecutorParts {
    pub channel: Arc<DeviceChannel>,
    pub store: Arc<dyn QueueStore>,
    pub resolver: Arc<dyn TargetResolver>,
    pub ephemeris: Arc<dyn Ephemeris>,
    pub solver: Arc<dyn PlateSolver>,
    pub clock: Arc<dyn Clock>,
    pub bus: Arc<MessageBus>,
    pub notifier: Arc<dyn Notifier>,
    pub pipeline: Arc<dyn PipelineTrigger>,
}

pub struct SessionExecutor {
    channel: Arc<DeviceChannel>,
    store: Arc<dyn QueueStore>,
    resolver: Arc<dyn TargetResolver>,
    ephemeris: Arc<dyn Ephemeris>,
    clock: Arc<dyn Clock>,
    bus: Arc<MessageBus>,
    notifier: Arc<dyn Notifier>,
    pipeline: Arc<dyn PipelineTrigger>,
    runner: ObservationRunner,
    calibration: Calibration,
    scheduler: Scheduler,
    config: AtlasConfig,
    state: Arc<RwLock<ExecutorState>>,
    enabled: Arc<AtomicBool>,
    start: Notify,
    event_tx: broadcast::Sender<ExecutorEvent>,
}

impl SessionExecutor {
    pub fn new(parts: ExecutorParts, config: AtlasConfig) -> Self {
        let (event_tx, _) = broadcast::channel(256);

        let pinpoint = Pinpoint::new(
            parts.channel.clone(),
            parts.solver,
            config.astrometry.clone(),
        );
        let runner = ObservationRunner::new(
            parts.channel.clone(),
            pinpoint,
            parts.store.clone(),
            parts.clock.clone(),
            config.observation_config(),
        );
        let calibration = Calibration::new(
            parts.channel.clone(),
            parts.clock.clone(),
            config.calibration.clone(),
            config.site,
            &config.general.user,
            &config.general.calibration_dir,
        );

        Self {
            channel: parts.channel,
            store: parts.store,
            resolver: parts.resolver,
            ephemeris: parts.ephemeris,
            clock: parts.clock,
            bus: parts.bus,
            notifier: parts.notifier,
            pipeline: parts.pipeline,
            runner,
            calibration,
            scheduler: config.scheduler.kind,
            config,
            state: Arc::new(RwLock::new(ExecutorState::Idle)),
            enabled: Arc::new(AtomicBool::new(true)),
            start: Notify::new(),
            event_tx,
        }
    }

    pub async fn state(&self) -> ExecutorState {
        *self.state.read().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutorEvent> {
        self.event_tx.subscribe()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Disabling takes effect at the next state boundary
    pub fn set_enabled(&self, enabled: bool) {
        info!("Executor {}", if enabled { "enabled" } else { "disabled" });
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Resolves once a start command arrives on the bus
    pub async fn start_requested(&self) {
        self.start.notified().await
    }

    async fn set_state(&self, state: ExecutorState) {
        {
            let mut current = self.state.write().await;
            if *current == state {
                return;
            }
            *current = state;
        }
        debug!("Executor state: {:?}", state);
        let _ = self.event_tx.send(ExecutorEvent::StateChanged(state));
        self.publish_status(state);
    }

    fn emit(&self, event: ExecutorEvent) {
        let _ = self.event_tx.send(event);
    }

    fn publish_status(&self, state: ExecutorState) {
        self.bus.publish(
            Topic::Queue,
            json!({
                "type": "status",
                "state": state,
                "enabled": self.is_enabled(),
            }),
        );
    }

    // =========================================================================
    // CONTROL
    // =========================================================================

    /// Handle operator commands from the `queue` topic until the bus closes
    pub fn listen(self: &Arc<Self>) -> JoinHandle<()> {
        let executor = Arc::clone(self);
        let commands = self.bus.topic_stream(Topic::Queue);
        tokio::spawn(async move {
            let mut commands = std::pin::pin!(commands);
            while let Some(payload) = commands.next().await {
                match serde_json::from_value::<QueueCommand>(payload) {
                    Ok(command) => executor.handle(command).await,
                    Err(e) => debug!("Ignoring queue message: {}", e),
                }
            }
        })
    }

    pub async fn handle(&self, command: QueueCommand) {
        match command {
            QueueCommand::Request => {
                let state = self.state().await;
                self.publish_status(state);
            }
            QueueCommand::Start => {
                info!("Start requested");
                self.start.notify_one();
            }
            QueueCommand::State { enabled } => self.set_enabled(enabled),
            QueueCommand::Create { mut observation } => {
                if observation.id.is_empty() {
                    observation.id = Uuid::new_v4().to_string();
                }
                let id = observation.id.clone();
                match self.store.insert(observation).await {
                    Ok(()) => info!("Queued observation {}", id),
                    Err(e) => warn!("Failed to queue observation {}: {}", id, e),
                }
            }
        }
    }

    // =========================================================================
    // NIGHT
    // =========================================================================

    /// Run one night. The returned error is whatever ended the night early;
    /// cleanup has already happened by the time it is returned.
    pub async fn run_night(&self) -> SessionResult<NightReport> {
        let mut report = NightReport::default();

        if !self.is_enabled() {
            info!("Executor disabled; not observing tonight");
            report.stopped = true;
            self.set_state(ExecutorState::ClosedDown).await;
            return Ok(report);
        }

        self.set_state(ExecutorState::AcquiringLock).await;
        if let Err(e) = self.acquire_lock().await {
            error!("{}", e);
            self.finish(&report, Some(&e), false).await;
            return Err(e);
        }

        let outcome = self.observe(&mut report).await;
        if let Err(e) = &outcome {
            error!("Night ended early: {}", e);
        }
        self.finish(&report, outcome.as_ref().err(), true).await;
        outcome.map(|()| report)
    }

    async fn acquire_lock(&self) -> SessionResult<()> {
        let general = &self.config.general;
        let policy = self.config.lock.policy();
        let max_attempts = policy.max_attempts;

        let outcome = retry(
            &policy,
            "Telescope lock",
            |e: &LockRefusal| match e {
                LockRefusal::Held => true,
                LockRefusal::Device(e) => !e.is_fatal(),
            },
            |attempt| async move {
                info!(
                    "Locking telescope as {} ({}/{})",
                    general.user, attempt, max_attempts
                );
                match self.channel.lock(&general.user, &general.lock_comment).await? {
                    true => Ok::<(), LockRefusal>(()),
                    false => Err(LockRefusal::Held),
                }
            },
        )
        .await;

        match outcome {
            Ok(()) => Ok(()),
            Err(RetryError::Exhausted {
                attempts,
                last_error: LockRefusal::Held,
            }) => Err(SessionError::LockTimeout { attempts }),
            Err(e) => match e.into_last_error() {
                LockRefusal::Device(e) => Err(e.into()),
                LockRefusal::Held => Err(SessionError::LockTimeout {
                    attempts: max_attempts,
                }),
            },
        }
    }

    /// Returns false once the operator has disabled the executor
    fn boundary(&self, report: &mut NightReport) -> bool {
        if self.is_enabled() {
            return true;
        }
        if !report.stopped {
            info!("Executor disabled; ending the night");
        }
        report.stopped = true;
        false
    }

    async fn observe(&self, report: &mut NightReport) -> SessionResult<()> {
        if self.config.calibration.enabled {
            self.set_state(ExecutorState::Calibrating).await;
            match self.calibration.run().await {
                Ok(()) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!("Continuing without calibration: {}", e),
            }
        }

        if !self.boundary(report) {
            return Ok(());
        }
        self.set_state(ExecutorState::AwaitingWeather).await;
        self.channel.weather().wait_until_good(None).await?;

        for session in self.sessions().await? {
            if !self.boundary(report) {
                break;
            }
            self.run_session(&session, report).await?;
        }
        Ok(())
    }

    /// Tonight's sessions, or the general queue when none are booked
    async fn sessions(&self) -> SessionResult<Vec<Session>> {
        let general = &self.config.general;
        let now = self.clock.now();
        let end = now + chrono::Duration::hours(general.night_hours);
        let earliest = now - chrono::Duration::hours(general.session_lookback_hours);

        let sessions: Vec<Session> = self
            .store
            .sessions_between(now, end)
            .await?
            .into_iter()
            .filter(|s| s.start > earliest)
            .collect();

        if sessions.is_empty() {
            info!("No sessions booked tonight; observing the general queue");
            return Ok(vec![Session::general(now, end)]);
        }
        info!("{} sessions tonight", sessions.len());
        Ok(sessions)
    }

    async fn run_session(&self, session: &Session, report: &mut NightReport) -> SessionResult<()> {
        let now = self.clock.now();
        if session.start > now {
            let wait = (session.start - now).to_std().unwrap_or_default();
            info!("Session {} starts in {}s", session.id, wait.as_secs());
            self.set_state(ExecutorState::Waiting).await;
            self.channel.wait(wait.as_secs()).await?;
        }

        info!(
            "Starting session {} for program {} (ends {})",
            session.id, session.program, session.end
        );
        self.emit(ExecutorEvent::SessionStarted {
            id: session.id.clone(),
            program: session.program.clone(),
        });

        let window = Window::new(session.start, session.end);
        loop {
            if !self.boundary(report) {
                break;
            }
            self.set_state(ExecutorState::Scheduling).await;

            let now = self.clock.now();
            if now >= session.end {
                info!("Session {} is over", session.id);
                break;
            }

            let pending = self.store.pending(&session.program).await?;
            if pending.is_empty() {
                info!("No pending observations for {}", session.program);
                break;
            }
            let pool = self.resolve(pending, now, report).await?;

            let sky = Sky {
                ephemeris: self.ephemeris.as_ref(),
                config: &self.config.scheduler,
                now,
            };
            let Some(entry) = self.scheduler.schedule(&pool, &window, &sky) else {
                info!("Nothing observable for the rest of session {}", session.id);
                break;
            };
            let Some(wait) = entry.wait.duration() else {
                break;
            };

            info!(
                "Next: {} ({}) in {}s",
                entry.observation.target,
                entry.observation.id,
                wait.as_secs()
            );
            if wait.as_secs() > 0 {
                self.set_state(ExecutorState::Waiting).await;
                self.channel.wait(wait.as_secs()).await?;
                if !self.boundary(report) {
                    break;
                }
            }

            self.set_state(ExecutorState::AwaitingWeather).await;
            self.channel.weather().wait_until_good(None).await?;
            self.execute(&entry.observation, report).await?;
        }
        Ok(())
    }

    /// Fill in coordinates for the pool. Observations that cannot be
    /// located are marked failed and left out.
    async fn resolve(
        &self,
        pending: Vec<Observation>,
        now: DateTime<Utc>,
        report: &mut NightReport,
    ) -> SessionResult<Vec<Observation>> {
        let mut pool = Vec::with_capacity(pending.len());
        for mut observation in pending {
            match self.locate(&observation, now).await {
                Ok((ra, dec)) => {
                    if observation.coordinates() != Some((ra, dec)) {
                        self.store.set_coordinates(&observation.id, ra, dec).await?;
                        observation.ra = Some(ra);
                        observation.dec = Some(dec);
                    }
                    pool.push(observation);
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => self.fail(&observation, &e, report).await?,
            }
        }
        Ok(pool)
    }

    async fn locate(&self, observation: &Observation, now: DateTime<Utc>) -> SessionResult<(f64, f64)> {
        if observation.is_solar_system() {
            return self
                .ephemeris
                .body_position(&observation.target, now)
                .ok_or_else(|| SessionError::Lookup {
                    target: observation.target.clone(),
                    message: "no ephemeris for this body".to_string(),
                });
        }
        if let Some(coordinates) = observation.coordinates() {
            return Ok(coordinates);
        }
        if let Some(coordinates) = target::parse_coordinates(&observation.target) {
            return Ok(coordinates);
        }
        self.resolver.resolve(&observation.target).await
    }

    async fn execute(&self, observation: &Observation, report: &mut NightReport) -> SessionResult<()> {
        self.set_state(ExecutorState::Executing).await;
        self.emit(ExecutorEvent::ObservationStarted {
            id: observation.id.clone(),
            target: observation.target.clone(),
        });

        match self.runner.execute(observation).await {
            Ok(execution) => {
                info!(
                    "Completed {} ({}): {} frames",
                    observation.target,
                    observation.id,
                    execution.filenames.len()
                );
                self.emit(ExecutorEvent::ObservationCompleted {
                    id: observation.id.clone(),
                    target: observation.target.clone(),
                    directory: execution.directory.clone(),
                });
                report.completed.push(CompletedObservation {
                    observation: observation.clone(),
                    directory: execution.directory,
                    frames: execution.filenames.len(),
                });
                Ok(())
            }
            // Weather that never clears ends the night; anything else only
            // costs this observation
            Err(SessionError::Device(e)) if e.is_fatal() => Err(e.into()),
            Err(e) => self.fail(observation, &e, report).await,
        }
    }

    async fn fail(
        &self,
        observation: &Observation,
        error: &SessionError,
        report: &mut NightReport,
    ) -> SessionResult<()> {
        let code = error.error_code();
        warn!("{} ({}) failed: {}", observation.target, observation.id, error);
        self.store.mark_error(&observation.id, code).await?;

        if matches!(error, SessionError::PointingFailure { .. }) {
            self.notifier
                .slack(&format!(
                    "{}: pointing failed on {} ({}): {}",
                    self.config.general.name, observation.target, observation.id, error
                ))
                .await;
        }

        self.emit(ExecutorEvent::ObservationFailed {
            id: observation.id.clone(),
            target: observation.target.clone(),
            code: code.to_string(),
        });
        report.failed.push(FailedObservation {
            id: observation.id.clone(),
            target: observation.target.clone(),
            code: code.to_string(),
        });
        Ok(())
    }

    /// Hand off data, notify, then close the dome and release the lock
    async fn finish(&self, report: &NightReport, failure: Option<&SessionError>, locked: bool) {
        self.set_state(ExecutorState::Completing).await;
        let name = &self.config.general.name;

        for completed in &report.completed {
            self.pipeline.process(&completed.directory).await;
        }

        let observations: Vec<Observation> = report
            .completed
            .iter()
            .map(|c| c.observation.clone())
            .collect();
        for (email, targets) in group_by_owner(&observations) {
            self.notifier
                .email(
                    &email,
                    &format!("{} observations completed", name),
                    &completion_message(name, &targets),
                )
                .await;
        }

        if let Some(e) = failure {
            self.notifier
                .slack(&format!("{} shut down for the night: {}", name, e))
                .await;
        }

        if locked {
            if let Err(e) = self.channel.close_down().await {
                error!("Close down failed: {}", e);
                self.notifier
                    .slack(&format!("{} failed to close down: {}", name, e))
                    .await;
            }
        }

        match failure {
            Some(e) => self.emit(ExecutorEvent::NightFailed {
                error: e.to_string(),
            }),
            None => self.emit(ExecutorEvent::NightCompleted {
                completed: report.completed.len(),
                failed: report.failed.len(),
            }),
        }
        info!(
            "Night over: {} completed, {} failed",
            report.completed.len(),
            report.failed.len()
        );
        self.set_state(ExecutorState::ClosedDown).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusMessage;
    use crate::clock::TokioClock;
    use crate::notify::{BusNotifier, BusPipeline};
    use crate::pinpoint::SolveFieldSolver;
    use crate::store::{MemoryQueueStore, Owner, QueueData};
    use crate::target::StaticResolver;
    use atlas_device::{ChannelConfig, Conditions, SimulatedTransport};
    use chrono::TimeZone;

    /// Every target sits at 60 degrees all night; the moon is below the
    /// horizon near the south pole
    struct SteadySky;

    impl Ephemeris for SteadySky {
        fn altitude(&self, _ra: f64, dec: f64, _time: DateTime<Utc>) -> f64 {
            if dec < -80.0 {
                -30.0
            } else {
                60.0
            }
        }

        fn sun_altitude(&self, _time: DateTime<Utc>) -> f64 {
            -30.0
        }

        fn moon_position(&self, _time: DateTime<Utc>) -> (f64, f64) {
            (0.0, -89.0)
        }

        fn moon_illumination(&self, _time: DateTime<Utc>) -> f64 {
            0.0
        }

        fn body_position(&self, _body: &str, _time: DateTime<Utc>) -> Option<(f64, f64)> {
            None
        }
    }

    fn located(id: &str, target: &str, ra: f64, dec: f64, email: &str) -> Observation {
        Observation {
            ra: Some(ra),
            dec: Some(dec),
            exposure_time: 30.0,
            filters: vec!["r".to_string()],
            owner: Owner {
                name: String::new(),
                email: email.to_string(),
            },
            ..Observation::new(id, target)
        }
    }

    struct Harness {
        sim: Arc<SimulatedTransport>,
        store: Arc<MemoryQueueStore>,
        bus: Arc<MessageBus>,
        executor: Arc<SessionExecutor>,
    }

    fn origin() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 4, 0, 0).unwrap()
    }

    fn harness(observations: Vec<Observation>) -> Harness {
        harness_with(QueueData {
            sessions: Vec::new(),
            observations,
        })
    }

    fn harness_with(data: QueueData) -> Harness {
        let sim = Arc::new(SimulatedTransport::new());
        let channel =
            Arc::new(DeviceChannel::new(sim.clone(), ChannelConfig::default()).unwrap());
        let store = Arc::new(MemoryQueueStore::new(data));
        let bus = Arc::new(MessageBus::default());
        let parts = ExecutorParts {
            channel: channel.clone(),
            store: store.clone(),
            resolver: Arc::new(StaticResolver::new()),
            ephemeris: Arc::new(SteadySky),
            solver: Arc::new(SolveFieldSolver::new(channel)),
            clock: Arc::new(TokioClock::starting_at(origin())),
            bus: bus.clone(),
            notifier: Arc::new(BusNotifier::new(bus.clone())),
            pipeline: Arc::new(BusPipeline::new(bus.clone())),
        };
        let executor = Arc::new(SessionExecutor::new(parts, AtlasConfig::default()));
        Harness {
            sim,
            store,
            bus,
            executor,
        }
    }

    fn drain(rx: &mut broadcast::Receiver<BusMessage>, topic: Topic) -> Vec<serde_json::Value> {
        let mut payloads = Vec::new();
        while let Ok(message) = rx.try_recv() {
            if message.topic == topic {
                payloads.push(message.payload);
            }
        }
        payloads
    }

    #[tokio::test(start_paused = true)]
    async fn test_night_completes_queue_and_closes_down() {
        let h = harness(vec![
            located("obs-1", "M 42", 83.82, -5.39, "alice@example.edu"),
            located("obs-2", "M 31", 10.68, 41.27, "alice@example.edu"),
        ]);
        let mut bus = h.bus.subscribe();
        let mut events = h.executor.subscribe();

        let report = h.executor.run_night().await.unwrap();

        assert_eq!(report.completed.len(), 2);
        assert!(report.failed.is_empty());
        assert!(!report.stopped);
        let data = h.store.snapshot().await;
        assert!(data.observations.iter().all(|o| o.completed));

        assert!(!h.sim.dome_open());
        assert_eq!(h.sim.lock_owner(), None);
        assert_eq!(h.executor.state().await, ExecutorState::ClosedDown);

        let pipeline = drain(&mut bus, Topic::Pipeline);
        assert_eq!(pipeline.len(), 2);

        let mut seen_completed = false;
        while let Ok(event) = events.try_recv() {
            if let ExecutorEvent::NightCompleted { completed, failed } = event {
                assert_eq!((completed, failed), (2, 0));
                seen_completed = true;
            }
        }
        assert!(seen_completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_owner_gets_one_email() {
        let h = harness(vec![
            located("obs-1", "M 42", 83.82, -5.39, "alice@example.edu"),
            located("obs-2", "M 31", 10.68, 41.27, "alice@example.edu"),
        ]);
        let mut bus = h.bus.subscribe();

        h.executor.run_night().await.unwrap();

        let notify = drain(&mut bus, Topic::Notify);
        let emails: Vec<_> = notify.iter().filter(|m| m["action"] == "email").collect();
        assert_eq!(emails.len(), 1);
        assert_eq!(emails[0]["to"], "alice@example.edu");
        let message = emails[0]["message"].as_str().unwrap();
        assert!(message.contains("M 42"));
        assert!(message.contains("M 31"));
        assert!(notify.iter().all(|m| m["action"] != "slack"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_weather_timeout_still_closes_down() {
        let h = harness(vec![located("obs-1", "M 42", 83.82, -5.39, "alice@example.edu")]);
        h.sim.set_conditions(Conditions::raining());
        let mut bus = h.bus.subscribe();

        let err = h.executor.run_night().await.unwrap_err();

        assert!(matches!(err, SessionError::Device(ref e) if e.is_fatal()));
        assert!(h.sim.commands_matching("openup").is_empty());
        assert!(!h.sim.dome_open());
        assert_eq!(h.sim.lock_owner(), None);
        assert_eq!(h.executor.state().await, ExecutorState::ClosedDown);

        let notify = drain(&mut bus, Topic::Notify);
        assert!(notify
            .iter()
            .any(|m| m["action"] == "slack"
                && m["message"].as_str().unwrap().contains("shut down")));
        assert!(h.store.get("obs-1").await.unwrap().is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_timeout_never_opens_dome() {
        let h = harness(vec![located("obs-1", "M 42", 83.82, -5.39, "alice@example.edu")]);
        h.sim.set_lock_owner(Some("bob"));
        let started = tokio::time::Instant::now();

        let err = h.executor.run_night().await.unwrap_err();

        assert!(matches!(err, SessionError::LockTimeout { attempts: 6 }));
        assert_eq!(h.sim.commands_matching("tx lock user=").len(), 6);
        assert!(started.elapsed() >= Duration::from_secs(5 * 300));
        assert!(h.sim.commands_matching("openup").is_empty());
        assert!(!h.sim.dome_open());
        // someone else's lock is left alone
        assert_eq!(h.sim.lock_owner().as_deref(), Some("bob"));
        assert_eq!(h.executor.state().await, ExecutorState::ClosedDown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_observations_marked_and_night_continues() {
        let h = harness(vec![
            located("obs-1", "M 42", 83.82, -5.39, "alice@example.edu"),
            Observation::new("obs-2", "Nowhere In Particular"),
        ]);
        h.sim.script_solutions(std::iter::repeat(None).take(20));
        let mut bus = h.bus.subscribe();

        let report = h.executor.run_night().await.unwrap();

        assert!(report.completed.is_empty());
        let mut codes: Vec<_> = report
            .failed
            .iter()
            .map(|f| (f.id.as_str(), f.code.as_str()))
            .collect();
        codes.sort();
        assert_eq!(codes, vec![("obs-1", "pointing"), ("obs-2", "lookup")]);
        assert_eq!(
            h.store.get("obs-1").await.unwrap().error.as_deref(),
            Some("pointing")
        );
        assert_eq!(
            h.store.get("obs-2").await.unwrap().error.as_deref(),
            Some("lookup")
        );

        assert!(!h.sim.dome_open());
        assert_eq!(h.sim.lock_owner(), None);

        let notify = drain(&mut bus, Topic::Notify);
        let slack: Vec<_> = notify.iter().filter(|m| m["action"] == "slack").collect();
        assert_eq!(slack.len(), 1);
        assert!(slack[0]["message"].as_str().unwrap().contains("pointing failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_failure_costs_only_that_observation() {
        let h = harness(vec![
            located("obs-1", "M 42", 83.82, -5.39, "alice@example.edu"),
            located("obs-2", "M 31", 10.68, 41.27, "alice@example.edu"),
        ]);
        // every attempt at the first M 42 science frame fails
        h.sim.fail_exposures_matching("/raw/science/M_42_", 5);

        let report = h.executor.run_night().await.unwrap();

        assert_eq!(
            report.failed,
            vec![FailedObservation {
                id: "obs-1".to_string(),
                target: "M 42".to_string(),
                code: "execution".to_string(),
            }]
        );
        let ids: Vec<_> = report
            .completed
            .iter()
            .map(|c| c.observation.id.as_str())
            .collect();
        assert_eq!(ids, vec!["obs-2"]);

        let failed = h.store.get("obs-1").await.unwrap();
        assert!(!failed.completed);
        assert_eq!(failed.error.as_deref(), Some("execution"));
        assert!(h.store.get("obs-2").await.unwrap().completed);

        assert!(!h.sim.dome_open());
        assert_eq!(h.sim.lock_owner(), None);
        assert_eq!(h.executor.state().await, ExecutorState::ClosedDown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_literal_coordinates_are_stored() {
        let h = harness(vec![Observation::new("obs-1", "05:35:17.3 -05:23:28")]);

        let report = h.executor.run_night().await.unwrap();

        assert_eq!(report.completed.len(), 1);
        let stored = h.store.get("obs-1").await.unwrap();
        let (ra, dec) = stored.coordinates().unwrap();
        assert!((ra - 83.822).abs() < 0.001);
        assert!((dec + 5.391).abs() < 0.001);
    }

    #[tokio::test(start_paused = true)]
    async fn test_booked_session_runs_only_its_program() {
        let booked = Observation {
            program: "alice-survey".to_string(),
            ..located("obs-1", "M 42", 83.82, -5.39, "alice@example.edu")
        };
        let general = located("obs-2", "M 31", 10.68, 41.27, "bob@example.edu");
        let h = harness_with(QueueData {
            sessions: vec![Session {
                id: "session-1".to_string(),
                program: "alice-survey".to_string(),
                start: origin() + chrono::Duration::hours(1),
                end: origin() + chrono::Duration::hours(3),
                owner: Owner::default(),
            }],
            observations: vec![booked, general],
        });
        let started = tokio::time::Instant::now();

        let report = h.executor.run_night().await.unwrap();

        assert!(started.elapsed() >= Duration::from_secs(3600));
        let ids: Vec<_> = report
            .completed
            .iter()
            .map(|c| c.observation.id.as_str())
            .collect();
        assert_eq!(ids, vec!["obs-1"]);
        assert!(h.store.get("obs-2").await.unwrap().is_pending());
        assert!(!h.sim.dome_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_executor_skips_night() {
        let h = harness(vec![located("obs-1", "M 42", 83.82, -5.39, "alice@example.edu")]);
        h.executor.set_enabled(false);

        let report = h.executor.run_night().await.unwrap();

        assert!(report.stopped);
        assert!(h.sim.commands().is_empty());
        assert_eq!(h.executor.state().await, ExecutorState::ClosedDown);
    }

    #[tokio::test]
    async fn test_queue_commands() {
        let h = harness(Vec::new());
        let listener = h.executor.listen();
        let mut replies = Box::pin(h.bus.topic_stream(Topic::Queue));

        h.bus
            .publish_serialized(Topic::Queue, &QueueCommand::State { enabled: false });
        h.bus.publish_serialized(
            Topic::Queue,
            &QueueCommand::Create {
                observation: Observation::new("new-1", "M 1"),
            },
        );
        h.bus.publish_serialized(Topic::Queue, &QueueCommand::Request);

        let status = loop {
            let message = replies.next().await.unwrap();
            if message["type"] == "status" {
                break message;
            }
        };
        assert_eq!(status["state"], "idle");
        assert_eq!(status["enabled"], false);
        assert!(!h.executor.is_enabled());
        assert!(h.store.get("new-1").await.is_ok());

        h.bus.publish_serialized(Topic::Queue, &QueueCommand::Start);
        tokio::time::timeout(Duration::from_secs(5), h.executor.start_requested())
            .await
            .unwrap();

        listener.abort();
    }
}

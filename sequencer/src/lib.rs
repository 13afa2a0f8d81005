//! Atlas Queue Sequencer
//!
//! Runs a robotic telescope through the night from a queue of observation
//! requests.
//!
//! ## Features
//!
//! - Altitude-maximizing scheduler with sun, moon and airmass constraints
//! - Plate-solve pointing refinement
//! - Science, dark and bias acquisition with per-observation directories
//! - Twilight flats and a dark library
//! - Session executor with guaranteed close down
//! - JSON message bus for operator control, notifications and pipeline handoff

pub mod bus;
pub mod calibration;
pub mod clock;
pub mod config;
pub mod ephemeris;
pub mod error;
pub mod executor;
pub mod notify;
pub mod observation;
pub mod pinpoint;
pub mod scheduler;
pub mod store;
pub mod target;

pub use bus::{BusMessage, MessageBus, QueueCommand, Topic};
pub use calibration::{Calibration, CalibrationConfig};
pub use clock::{Clock, SystemClock, TokioClock};
pub use config::AtlasConfig;
pub use ephemeris::{Ephemeris, LowPrecisionEphemeris, Site};
pub use error::{SessionError, SessionResult};
pub use executor::{ExecutorEvent, ExecutorParts, ExecutorState, NightReport, SessionExecutor};
pub use notify::{BusNotifier, BusPipeline, Notifier, PipelineTrigger};
pub use observation::{ObservationConfig, ObservationRunner};
pub use pinpoint::{AstrometryConfig, Pinpoint, PlateSolver, SolveFieldSolver};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use store::{MemoryQueueStore, Observation, QueueStore, Session};
pub use target::{SesameResolver, StaticResolver, TargetResolver};

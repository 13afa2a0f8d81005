//! Telescope Device Channel
//!
//! Drives a remote telescope controller through shell commands.
//!
//! ## Features
//!
//! - Typed operations over a configurable command dialect
//! - Bounded retry with liveness probe and session reconnect
//! - Multiplexed OpenSSH transport and an in-memory simulator
//! - Weather gate with safest-value sensor fallbacks
//! - Broadcast state-change events

mod channel;
mod error;
mod protocol;
mod retry;
mod state;
mod transport;
mod weather;
pub mod simulator;

pub use channel::{frame_name, ChannelConfig, DeviceChannel, ExposureRequest, SolveRequest};
pub use error::{DeviceError, DeviceResult};
pub use protocol::{render, CommandTable, Dialect, Operation, OperationSpec, PROBE_COMMAND, PROBE_REPLY};
pub use retry::{retry, RetryError, RetryPolicy};
pub use state::{TelescopeEvent, TelescopeState, WeatherSample};
pub use transport::{CommandOutput, SshConfig, SshTransport, Transport};
pub use weather::{Breach, WeatherConfig, WeatherGate};
pub use simulator::{Conditions, SimulatedTransport};

//! Session error types

use atlas_device::DeviceError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Unable to lock the telescope after {attempts} attempts")]
    LockTimeout { attempts: u32 },

    #[error("Pointing at {target} did not converge after {iterations} iterations")]
    PointingFailure { target: String, iterations: u32 },

    #[error("Unable to resolve coordinates for {target}: {message}")]
    Lookup { target: String, message: String },

    #[error("Observation {id} failed: {message}")]
    ObservationExecution { id: String, message: String },

    #[error("Calibration failed: {0}")]
    Calibration(String),

    #[error("Queue store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SessionError {
    /// Errors that end the night
    pub fn is_fatal(&self) -> bool {
        match self {
            SessionError::Device(e) => e.is_fatal(),
            SessionError::LockTimeout { .. } => true,
            SessionError::Store(_) => true,
            _ => false,
        }
    }

    /// Reason code written to a failed observation
    pub fn error_code(&self) -> &'static str {
        match self {
            SessionError::PointingFailure { .. } => "pointing",
            SessionError::Lookup { .. } => "lookup",
            _ => "execution",
        }
    }
}

pub type SessionResult<T> = Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_fatal_classification() {
        assert!(SessionError::LockTimeout { attempts: 6 }.is_fatal());
        assert!(SessionError::from(DeviceError::WeatherTimeout {
            waited: Duration::from_secs(14400)
        })
        .is_fatal());
        assert!(!SessionError::PointingFailure {
            target: "M31".to_string(),
            iterations: 20
        }
        .is_fatal());
        assert!(!SessionError::from(DeviceError::WeatherUnsafe {
            action: "open the dome".to_string()
        })
        .is_fatal());
        assert!(!SessionError::from(DeviceError::RetryExhausted {
            attempts: 5,
            last_error: "ccd fault".to_string()
        })
        .is_fatal());
    }

    #[test]
    fn test_error_codes() {
        let pointing = SessionError::PointingFailure {
            target: "M31".to_string(),
            iterations: 3,
        };
        let lookup = SessionError::Lookup {
            target: "Nowhere".to_string(),
            message: "not found".to_string(),
        };
        let device = SessionError::from(DeviceError::transport("tx slit", "broken pipe"));

        assert_eq!(pointing.error_code(), "pointing");
        assert_eq!(lookup.error_code(), "lookup");
        assert_eq!(device.error_code(), "execution");
    }
}

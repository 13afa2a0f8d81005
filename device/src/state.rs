//! Telescope state and state-change events

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One reading of the site weather sensors
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeatherSample {
    /// Cloud cover fraction (0.0 clear, 1.0 overcast)
    pub cloud: f64,
    pub dew: f64,
    /// Rain sensor; anything but zero means wet
    pub rain: f64,
    /// Sun altitude in degrees
    pub sun_alt: f64,
    /// Moon altitude in degrees
    pub moon_alt: f64,
    pub taken_at: DateTime<Utc>,
}

impl WeatherSample {
    /// Values assumed when a sensor cannot be read
    pub const SAFEST_CLOUD: f64 = 1.0;
    pub const SAFEST_DEW: f64 = 10.0;
    pub const SAFEST_RAIN: f64 = 1.0;
    pub const SAFEST_SUN_ALT: f64 = 90.0;
    pub const SAFEST_MOON_ALT: f64 = 90.0;
}

/// In-memory view of the telescope, owned by the device channel
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelescopeState {
    pub locked: bool,
    pub lock_owner: Option<String>,
    pub dome_open: bool,
    pub tracking: bool,
    pub current_filter: Option<String>,
    pub focus_position: Option<i32>,
    /// Last commanded pointing (RA, Dec) in degrees
    pub pointing: Option<(f64, f64)>,
    pub last_weather: Option<WeatherSample>,
}

/// State change emitted by the device channel after a successful operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum TelescopeEvent {
    Opening,
    Openup,
    Closing,
    Closedown,
    FilterChange { filter: String },
    Filter { filter: String },
    Focus { position: i32 },
    Slew { ra: f64, dec: f64 },
    Point { ra: f64, dec: f64 },
    Lock { user: String, comment: String },
    Unlock,
    Wait { seconds: u64 },
    Wake,
    Weather(WeatherSample),
    Exposing {
        filename: String,
        time: f64,
        binning: u32,
        filter: Option<String>,
    },
    Exposure { filename: String },
}

impl TelescopeEvent {
    /// The event name as carried on the bus
    pub fn name(&self) -> &'static str {
        match self {
            TelescopeEvent::Opening => "opening",
            TelescopeEvent::Openup => "openup",
            TelescopeEvent::Closing => "closing",
            TelescopeEvent::Closedown => "closedown",
            TelescopeEvent::FilterChange { .. } => "filterchange",
            TelescopeEvent::Filter { .. } => "filter",
            TelescopeEvent::Focus { .. } => "focus",
            TelescopeEvent::Slew { .. } => "slew",
            TelescopeEvent::Point { .. } => "point",
            TelescopeEvent::Lock { .. } => "lock",
            TelescopeEvent::Unlock => "unlock",
            TelescopeEvent::Wait { .. } => "wait",
            TelescopeEvent::Wake => "wake",
            TelescopeEvent::Weather(_) => "weather",
            TelescopeEvent::Exposing { .. } => "exposing",
            TelescopeEvent::Exposure { .. } => "exposure",
        }
    }
}

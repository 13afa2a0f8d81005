//! Queue controller configuration
//!
//! A single JSON document with one section per subsystem. Every field has a
//! default, so a file only needs to name what differs from them.

use crate::bus::DEFAULT_BUS_CAPACITY;
use crate::calibration::CalibrationConfig;
use crate::ephemeris::Site;
use crate::error::{SessionError, SessionResult};
use crate::executor::LockConfig;
use crate::observation::ObservationConfig;
use crate::pinpoint::AstrometryConfig;
use crate::scheduler::SchedulerConfig;
use crate::target::ResolverConfig;
use atlas_device::{ChannelConfig, SshConfig, WeatherConfig};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Observatory name used in notifications
    pub name: String,
    /// Short site name embedded in file names
    pub site: String,
    /// User that takes the hardware lock
    pub user: String,
    pub lock_comment: String,
    /// Root of the data tree on the telescope host
    pub data_dir: String,
    /// Calibration frames land here
    pub calibration_dir: String,
    /// Daily rolling log files go here when set
    pub log_dir: Option<PathBuf>,
    /// Local time the night starts, "HH:MM"
    pub start_time: String,
    /// Length of the window searched for sessions
    pub night_hours: i64,
    /// Sessions that started longer ago than this are skipped
    pub session_lookback_hours: i64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            name: "Atlas".to_string(),
            site: "atlas".to_string(),
            user: "queue".to_string(),
            lock_comment: "queue observing".to_string(),
            data_dir: "/home/atlas/data".to_string(),
            calibration_dir: "/home/atlas/data/calibration".to_string(),
            log_dir: None,
            start_time: "18:00".to_string(),
            night_hours: 12,
            session_lookback_hours: 2,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelescopeConfig {
    pub ssh: SshConfig,
    pub channel: ChannelConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub store_path: PathBuf,
    /// Biases per science exposure
    pub numbias: u32,
    pub flush_bias_base: String,
    pub flush_bias_count: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("queue.json"),
            numbias: 5,
            flush_bias_base: "/tmp/clear".to_string(),
            flush_bias_count: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_BUS_CAPACITY,
        }
    }
}

/// Complete controller configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AtlasConfig {
    pub general: GeneralConfig,
    pub telescope: TelescopeConfig,
    pub site: Site,
    pub queue: QueueConfig,
    pub weather: WeatherConfig,
    pub astrometry: AstrometryConfig,
    pub scheduler: SchedulerConfig,
    pub lock: LockConfig,
    pub calibration: CalibrationConfig,
    pub resolver: ResolverConfig,
    pub bus: BusConfig,
}

impl AtlasConfig {
    pub async fn load(path: impl AsRef<Path>) -> SessionResult<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            SessionError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: AtlasConfig = serde_json::from_str(&text)
            .map_err(|e| SessionError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub async fn save(&self, path: impl AsRef<Path>) -> SessionResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    pub fn validate(&self) -> SessionResult<()> {
        self.start_time()?;
        if self.general.night_hours <= 0 {
            return Err(SessionError::Config(
                "general.night_hours must be positive".to_string(),
            ));
        }
        if self.lock.attempts == 0 {
            return Err(SessionError::Config(
                "lock.attempts must be at least 1".to_string(),
            ));
        }
        if !(0.0..90.0).contains(&self.scheduler.min_altitude) {
            return Err(SessionError::Config(format!(
                "scheduler.min_altitude {} out of range",
                self.scheduler.min_altitude
            )));
        }
        if self.astrometry.min_ra_offset > self.astrometry.max_ra_offset
            || self.astrometry.min_dec_offset > self.astrometry.max_dec_offset
        {
            return Err(SessionError::Config(
                "astrometry minimum offsets exceed the maximum".to_string(),
            ));
        }
        Ok(())
    }

    /// Local time the night starts
    pub fn start_time(&self) -> SessionResult<NaiveTime> {
        NaiveTime::parse_from_str(&self.general.start_time, "%H:%M").map_err(|e| {
            SessionError::Config(format!(
                "invalid start time {:?}: {}",
                self.general.start_time, e
            ))
        })
    }

    /// Channel settings with the top-level weather limits applied
    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            weather: self.weather.clone(),
            ..self.telescope.channel.clone()
        }
    }

    pub fn observation_config(&self) -> ObservationConfig {
        ObservationConfig {
            data_dir: self.general.data_dir.clone(),
            site: self.general.site.clone(),
            numbias: self.queue.numbias,
            clear_filter: self.astrometry.clear_filter.clone(),
            flush_bias_base: self.queue.flush_bias_base.clone(),
            flush_bias_count: self.queue.flush_bias_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_document_takes_defaults() {
        let config: AtlasConfig = serde_json::from_str(
            r#"{
                "general": { "name": "Stone Edge", "start_time": "19:30" },
                "weather": { "max_cloud": 0.3 },
                "lock": { "attempts": 3 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.general.name, "Stone Edge");
        assert_eq!(config.general.user, "queue");
        assert_eq!(config.lock.attempts, 3);
        assert_eq!(config.scheduler, SchedulerConfig::default());
        assert_eq!(
            config.start_time().unwrap(),
            NaiveTime::from_hms_opt(19, 30, 0).unwrap()
        );
        config.validate().unwrap();
    }

    #[test]
    fn test_channel_config_uses_weather_section() {
        let mut config = AtlasConfig::default();
        config.weather.max_cloud = 0.2;
        config.telescope.channel.max_frame_retakes = 3;

        let channel = config.channel_config();
        assert_eq!(channel.weather.max_cloud, 0.2);
        assert_eq!(channel.max_frame_retakes, 3);
    }

    #[test]
    fn test_observation_config_follows_sections() {
        let mut config = AtlasConfig::default();
        config.general.site = "stone".to_string();
        config.queue.numbias = 2;
        config.astrometry.clear_filter = "lum".to_string();

        let observation = config.observation_config();
        assert_eq!(observation.site, "stone");
        assert_eq!(observation.numbias, 2);
        assert_eq!(observation.clear_filter, "lum");
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = AtlasConfig::default();
        config.general.start_time = "dusk".to_string();
        assert!(matches!(config.validate(), Err(SessionError::Config(_))));

        let mut config = AtlasConfig::default();
        config.lock.attempts = 0;
        assert!(config.validate().is_err());

        let mut config = AtlasConfig::default();
        config.astrometry.min_ra_offset = 30.0;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let path = std::env::temp_dir().join(format!("atlas-config-{}.json", uuid::Uuid::new_v4()));
        let mut config = AtlasConfig::default();
        config.general.name = "Saved".to_string();
        config.save(&path).await.unwrap();

        let loaded = AtlasConfig::load(&path).await.unwrap();
        assert_eq!(loaded.general, config.general);
        assert_eq!(loaded.lock, config.lock);
        assert_eq!(loaded.calibration.flat_sequence, config.calibration.flat_sequence);
        let _ = std::fs::remove_file(&path);
    }
}

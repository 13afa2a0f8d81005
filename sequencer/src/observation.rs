//! Executing a single observation
//!
//! Points the telescope, runs the science frames for each filter and the
//! matching darks and biases, and records every frame in the queue store
//! as it is written.

use crate::clock::Clock;
use crate::error::{SessionError, SessionResult};
use crate::pinpoint::Pinpoint;
use crate::store::{Observation, QueueStore};
use crate::target;
use atlas_device::{DeviceChannel, ExposureRequest};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Frame naming and calibration settings for observations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservationConfig {
    /// Root of the data tree on the telescope host
    pub data_dir: String,
    /// Site short name used in filenames
    pub site: String,
    /// Biases per science exposure
    pub numbias: u32,
    pub clear_filter: String,
    /// Throwaway biases that flush residual charge after science frames
    pub flush_bias_base: String,
    pub flush_bias_count: u32,
}

impl Default for ObservationConfig {
    fn default() -> Self {
        Self {
            data_dir: "/home/atlas/data".to_string(),
            site: "atlas".to_string(),
            numbias: 5,
            clear_filter: "clear".to_string(),
            flush_bias_base: "/tmp/clear".to_string(),
            flush_bias_count: 10,
        }
    }
}

/// Where an observation's frames go
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameLayout {
    /// Observation directory; `raw/` and `processed/` live below it
    pub directory: String,
    /// Science frame base with a `{filter}` placeholder
    pub science: String,
    pub dark: String,
    pub bias: String,
}

impl FrameLayout {
    const FILTER: &'static str = "{filter}";

    pub fn new(observation: &Observation, config: &ObservationConfig, date: &str) -> Self {
        let user = observation.owner.user();
        let fname = format!(
            "{}_{}_{}s_bin{}_{}_{}_{}",
            target_label(&observation.target),
            Self::FILTER,
            observation.exposure_time,
            observation.binning,
            date,
            config.site,
            user
        );
        let directory = format!(
            "{}/{}/{}",
            config.data_dir.trim_end_matches('/'),
            user,
            fname.replace(&format!("{}_", Self::FILTER), "")
        );

        Self {
            science: format!("{}/raw/science/{}", directory, fname),
            dark: format!("{}/raw/dark/{}", directory, fname.replace(Self::FILTER, "dark")),
            bias: format!("{}/raw/bias/{}", directory, fname.replace(Self::FILTER, "bias")),
            directory,
        }
    }

    pub fn science_base(&self, filter: &str) -> String {
        self.science.replace(Self::FILTER, filter)
    }

    pub fn directories(&self) -> [String; 4] {
        [
            format!("{}/raw/science", self.directory),
            format!("{}/raw/dark", self.directory),
            format!("{}/raw/bias", self.directory),
            format!("{}/processed", self.directory),
        ]
    }
}

/// Filesystem-safe label for a target. Literal positions become
/// `05h35m17.3s_-05d23m28s`; names lose spaces and quotes.
pub fn target_label(target: &str) -> String {
    let trimmed = target.trim();
    if target::parse_coordinates(trimmed).is_some() {
        let mut parts = trimmed.split_whitespace();
        if let (Some(ra), Some(dec), None) = (parts.next(), parts.next(), parts.next()) {
            if ra.contains(':') && dec.contains(':') {
                let ra = ra.replacen(':', "h", 1).replacen(':', "m", 1) + "s";
                let dec = dec.replacen(':', "d", 1).replacen(':', "m", 1) + "s";
                return format!("{}_{}", ra, dec);
            }
        }
    }
    trimmed.replace(' ', "_").replace('\'', "")
}

/// Frames written for one observation
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExecutionReport {
    pub directory: String,
    pub filenames: Vec<String>,
}

/// Runs observations on the telescope
pub struct ObservationRunner {
    channel: Arc<DeviceChannel>,
    pinpoint: Pinpoint,
    store: Arc<dyn QueueStore>,
    clock: Arc<dyn Clock>,
    config: ObservationConfig,
}

impl ObservationRunner {
    pub fn new(
        channel: Arc<DeviceChannel>,
        pinpoint: Pinpoint,
        store: Arc<dyn QueueStore>,
        clock: Arc<dyn Clock>,
        config: ObservationConfig,
    ) -> Self {
        Self {
            channel,
            pinpoint,
            store,
            clock,
            config,
        }
    }

    /// Execute an observation whose coordinates are known. On success the
    /// observation is marked completed in the store.
    pub async fn execute(&self, observation: &Observation) -> SessionResult<ExecutionReport> {
        let Some((ra, dec)) = observation.offset_coordinates() else {
            return Err(SessionError::ObservationExecution {
                id: observation.id.clone(),
                message: "observation has no coordinates".to_string(),
            });
        };

        info!(
            "Executing observation of {} for {}",
            observation.target, observation.owner.email
        );

        self.channel.enable_tracking().await?;
        self.channel.goto(ra, dec).await?;

        let date = self.clock.now().format("%Y-%m-%d").to_string();
        let layout = FrameLayout::new(observation, &self.config, &date);
        for directory in layout.directories() {
            self.channel.make_dir(&directory).await?;
        }

        if observation.is_solar_system() {
            warn!("Can't pinpoint to solar system object {}", observation.target);
        } else {
            let outcome = self.pinpoint.point(ra, dec).await?;
            if !outcome.converged {
                return Err(SessionError::PointingFailure {
                    target: observation.target.clone(),
                    iterations: outcome.iterations,
                });
            }
        }

        let mut report = ExecutionReport {
            directory: layout.directory.clone(),
            filenames: Vec::new(),
        };

        for filter in observation.science_filters() {
            self.channel.weather().wait_until_good(None).await?;
            self.channel.open_dome(None).await?;
            self.channel.enable_tracking().await?;

            let keep_open =
                (observation.exposure_time * observation.exposure_count as f64) as u64 + 300;
            self.channel.keep_open(keep_open).await?;

            let frames = self
                .channel
                .take_exposure(&ExposureRequest {
                    base: layout.science_base(filter),
                    time: observation.exposure_time,
                    count: observation.exposure_count,
                    binning: observation.binning,
                    filter: Some(filter.to_string()),
                })
                .await?;
            self.record(observation, &mut report, frames).await?;
        }

        debug!("Switching back to {} filter", self.config.clear_filter);
        self.channel.change_filter(&self.config.clear_filter).await?;

        self.channel
            .take_bias(
                &self.config.flush_bias_base,
                self.config.flush_bias_count,
                observation.binning,
            )
            .await?;

        if observation.wants_darks() {
            let darks = self
                .channel
                .take_dark(
                    &layout.dark,
                    observation.exposure_time,
                    observation.exposure_count,
                    observation.binning,
                )
                .await?;
            self.record(observation, &mut report, darks).await?;
        }

        let biases = self
            .channel
            .take_bias(
                &layout.bias,
                self.config.numbias * observation.exposure_count,
                observation.binning,
            )
            .await?;
        self.record(observation, &mut report, biases).await?;

        self.store
            .mark_completed(&observation.id, self.clock.now())
            .await?;
        info!(
            "Finished observing {}: {} frames in {}",
            observation.target,
            report.filenames.len(),
            report.directory
        );

        Ok(report)
    }

    async fn record(
        &self,
        observation: &Observation,
        report: &mut ExecutionReport,
        frames: Vec<String>,
    ) -> SessionResult<()> {
        for frame in frames {
            self.store.append_filename(&observation.id, &frame).await?;
            report.filenames.push(frame);
        }
        Ok(())
    }
}

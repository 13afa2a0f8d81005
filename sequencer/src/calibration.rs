//! Sunset calibration: motor homing, sky flats and a dark library

use crate::clock::Clock;
use crate::ephemeris::Site;
use crate::error::{SessionError, SessionResult};
use atlas_device::{DeviceChannel, ExposureRequest};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// One entry of the flat sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlatStep {
    pub binning: u32,
    pub filter: String,
    pub count: u32,
}

impl FlatStep {
    pub fn new(binning: u32, filter: &str, count: u32) -> Self {
        Self {
            binning,
            filter: filter.to_string(),
            count,
        }
    }
}

/// A set of dark frames for the nightly library
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DarkSet {
    pub exposure_time: f64,
    pub count: u32,
    pub binning: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Run calibration before observing
    pub enabled: bool,
    /// Sun altitude at which sky flats may start, degrees
    pub max_sun_alt_for_flats: f64,
    pub flat_poll_interval_secs: u64,
    /// Seconds
    pub starting_exposure: f64,
    pub min_exposure: f64,
    pub max_exposure: f64,
    /// Target mean count of a flat
    pub optimum_count: f64,
    pub exposure_fudge: f64,
    pub delay_between_test_flats_secs: u64,
    pub cooling_checks: u32,
    pub cooling_interval_secs: u64,
    /// Hour angle of the flat field position, hours
    pub flat_hour_angle: f64,
    pub flat_sequence: Vec<FlatStep>,
    pub darks: Vec<DarkSet>,
    pub bias_count: u32,
    pub bias_binning: u32,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_sun_alt_for_flats: -1.0,
            flat_poll_interval_secs: 60,
            starting_exposure: 0.1,
            min_exposure: 1.0,
            max_exposure: 60.0,
            optimum_count: 30_000.0,
            exposure_fudge: 1.0,
            delay_between_test_flats_secs: 5,
            cooling_checks: 25,
            cooling_interval_secs: 60,
            flat_hour_angle: -1.0,
            flat_sequence: vec![
                FlatStep::new(1, "h-alpha", 5),
                FlatStep::new(2, "h-alpha", 5),
                FlatStep::new(1, "z", 5),
                FlatStep::new(1, "r", 5),
                FlatStep::new(1, "i", 5),
                FlatStep::new(1, "g", 5),
                FlatStep::new(2, "z", 5),
                FlatStep::new(2, "r", 5),
                FlatStep::new(1, "clear", 10),
                FlatStep::new(2, "i", 5),
                FlatStep::new(2, "g", 5),
                FlatStep::new(2, "clear", 10),
            ],
            darks: vec![DarkSet {
                exposure_time: 300.0,
                count: 1,
                binning: 2,
            }],
            bias_count: 10,
            bias_binning: 2,
        }
    }
}

pub struct Calibration {
    channel: Arc<DeviceChannel>,
    clock: Arc<dyn Clock>,
    config: CalibrationConfig,
    site: Site,
    user: String,
    /// Directory on the telescope host receiving calibration frames
    directory: String,
}

impl Calibration {
    pub fn new(
        channel: Arc<DeviceChannel>,
        clock: Arc<dyn Clock>,
        config: CalibrationConfig,
        site: Site,
        user: &str,
        directory: &str,
    ) -> Self {
        Self {
            channel,
            clock,
            config,
            site,
            user: user.to_string(),
            directory: directory.trim_end_matches('/').to_string(),
        }
    }

    /// Home the motors, take flats, then build the dark library
    pub async fn run(&self) -> SessionResult<()> {
        info!("Waiting until sunset to calibrate...");
        self.channel.weather().wait_until_good(Some(0.0)).await?;

        self.channel.calibrate_motors().await?;
        let flats = self.take_flats().await?;
        let library = self.take_dark_library().await?;

        info!(
            "Calibration finished: {} flats, {} dark and bias frames",
            flats.len(),
            library.len()
        );
        Ok(())
    }

    fn flat_directory(&self) -> String {
        format!("{}/flats", self.directory)
    }

    /// Take the configured flat sequence. The dome is closed afterwards
    /// whether or not the sequence completed.
    pub async fn take_flats(&self) -> SessionResult<Vec<String>> {
        let config = &self.config;

        self.channel
            .weather()
            .wait_until_good_every(
                Some(config.max_sun_alt_for_flats),
                Duration::from_secs(config.flat_poll_interval_secs.max(1)),
            )
            .await?;

        self.channel.lamps_off().await?;
        self.cool_ccd().await?;

        self.channel
            .open_dome(Some(config.max_sun_alt_for_flats))
            .await?;
        self.channel.keep_open(3600).await?;

        let flats = self.flat_sequence().await;

        if let Err(e) = self.channel.close_dome().await {
            error!("Failed to close dome after flats: {}", e);
            if flats.is_ok() {
                return Err(e.into());
            }
        }
        flats
    }

    async fn cool_ccd(&self) -> SessionResult<()> {
        if self.channel.chip_temp_ok().await? {
            return Ok(());
        }

        self.channel.cool_ccd().await?;
        for _ in 0..self.config.cooling_checks {
            if self.channel.chip_temp_ok().await? {
                debug!("CCD at temperature");
                return Ok(());
            }
            self.channel.wait(self.config.cooling_interval_secs).await?;
        }

        warn!("CCD unable to reach temperature");
        Ok(())
    }

    async fn flat_sequence(&self) -> SessionResult<Vec<String>> {
        let config = &self.config;
        let directory = self.flat_directory();

        self.channel.make_dir(&directory).await?;
        self.channel.disable_tracking().await?;
        self.point_for_flats().await?;

        let test_frame = format!("{}/_flat", directory);
        let mut flats = Vec::new();

        for step in &config.flat_sequence {
            let mut exposure = config.starting_exposure;
            let mut optimum = config.starting_exposure;

            for i in 0..step.count {
                while optimum < config.min_exposure {
                    let frames = self
                        .expose(&test_frame, exposure, step.binning, &step.filter)
                        .await?;
                    optimum = self.optimum_exposure(&frames, exposure).await?;
                    if optimum > config.max_exposure {
                        return Err(SessionError::Calibration(format!(
                            "flat exposure {:.2}s for {} exceeds {:.2}s",
                            optimum, step.filter, config.max_exposure
                        )));
                    }
                    exposure = optimum;
                    tokio::time::sleep(Duration::from_secs(config.delay_between_test_flats_secs))
                        .await;
                }
                exposure = optimum;

                let timestamp = self.clock.now().format("%Y%b%d_%Hh%Mm%Ss");
                let base = format!(
                    "{}/flat_{}_{:.2}sec_bin{}_{}_{}_num{}",
                    directory, step.filter, exposure, step.binning, self.user, timestamp, i
                );
                let frames = self.expose(&base, exposure, step.binning, &step.filter).await?;
                optimum = self.optimum_exposure(&frames, exposure).await?;
                flats.extend(frames);

                self.point_for_flats().await?;
            }
        }

        Ok(flats)
    }

    async fn point_for_flats(&self) -> SessionResult<()> {
        self.channel
            .goto_point_for_flats(self.site.latitude, self.config.flat_hour_angle)
            .await?;
        Ok(())
    }

    async fn expose(
        &self,
        base: &str,
        time: f64,
        binning: u32,
        filter: &str,
    ) -> SessionResult<Vec<String>> {
        Ok(self
            .channel
            .take_exposure(&ExposureRequest {
                base: base.to_string(),
                time,
                count: 1,
                binning,
                filter: Some(filter.to_string()),
            })
            .await?)
    }

    /// Exposure that would bring the mean count of `frames` to the optimum
    async fn optimum_exposure(&self, frames: &[String], exposure: f64) -> SessionResult<f64> {
        let Some(frame) = frames.first() else {
            return Err(SessionError::Calibration("flat produced no frame".to_string()));
        };
        let mean = self.channel.mean_image_count(frame).await?;
        if mean <= 0.0 {
            return Err(SessionError::Calibration(format!(
                "mean count of {} is {}",
                frame, mean
            )));
        }
        Ok(self.config.optimum_count / mean * self.config.exposure_fudge * exposure)
    }

    /// Darks and biases for observations that did not ask for their own
    pub async fn take_dark_library(&self) -> SessionResult<Vec<String>> {
        let directory = format!("{}/darks", self.directory);
        self.channel.make_dir(&directory).await?;

        let date = self.clock.now().format("%Y-%m-%d");
        let mut frames = Vec::new();

        for set in &self.config.darks {
            let base = format!("{}/{}_{}s", directory, date, set.exposure_time);
            frames.extend(
                self.channel
                    .take_dark(&base, set.exposure_time, set.count, set.binning)
                    .await?,
            );
        }

        if self.config.bias_count > 0 {
            let base = format!("{}/{}", directory, date);
            frames.extend(
                self.channel
                    .take_bias(&base, self.config.bias_count, self.config.bias_binning)
                    .await?,
            );
        }

        Ok(frames)
    }
}

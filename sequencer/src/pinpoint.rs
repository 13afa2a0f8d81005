//! Closed-loop pointing refinement
//!
//! Images the field, plate-solves it and nudges the mount until the solved
//! center lands within tolerance of the target.

use crate::error::SessionResult;
use async_trait::async_trait;
use atlas_device::{DeviceChannel, ExposureRequest, SolveRequest};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Astrometry and pointing loop settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AstrometryConfig {
    pub binning: u32,
    /// Seconds
    pub exposure_time: f64,
    pub downsample: u32,
    /// Arcseconds per pixel
    pub scale_low: f64,
    pub scale_high: f64,
    /// Search radius, degrees
    pub radius: f64,
    /// Solver CPU limit, seconds
    pub cpu_limit: u32,
    /// Degrees
    pub min_ra_offset: f64,
    pub min_dec_offset: f64,
    pub max_ra_offset: f64,
    pub max_dec_offset: f64,
    pub max_tries: u32,
    /// Pointing images are written here, without extension
    pub image_base: String,
    pub clear_filter: String,
    pub keep_open_secs: u64,
}

impl Default for AstrometryConfig {
    fn default() -> Self {
        Self {
            binning: 2,
            exposure_time: 10.0,
            downsample: 2,
            scale_low: 0.55,
            scale_high: 2.0,
            radius: 20.0,
            cpu_limit: 50,
            min_ra_offset: 0.05,
            min_dec_offset: 0.05,
            max_ra_offset: 20.0,
            max_dec_offset: 20.0,
            max_tries: 20,
            image_base: "/tmp/pointing".to_string(),
            clear_filter: "clear".to_string(),
            keep_open_secs: 600,
        }
    }
}

/// Solves an image for its field center
#[async_trait]
pub trait PlateSolver: Send + Sync {
    /// `None` when the field cannot be solved
    async fn solve(&self, request: &SolveRequest) -> SessionResult<Option<(f64, f64)>>;
}

/// Runs `solve-field` on the telescope host
pub struct SolveFieldSolver {
    channel: Arc<DeviceChannel>,
}

impl SolveFieldSolver {
    pub fn new(channel: Arc<DeviceChannel>) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl PlateSolver for SolveFieldSolver {
    async fn solve(&self, request: &SolveRequest) -> SessionResult<Option<(f64, f64)>> {
        Ok(self.channel.solve_field(request).await?)
    }
}

/// Result of one pointing run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PinpointOutcome {
    pub converged: bool,
    /// Solve rounds used
    pub iterations: u32,
    /// Last measured (RA, Dec) error in degrees
    pub last_offset: Option<(f64, f64)>,
}

/// Wrap an RA difference into (-180, 180]
pub fn wrap_ra_offset(offset: f64) -> f64 {
    let wrapped = offset.rem_euclid(360.0);
    if wrapped > 180.0 {
        wrapped - 360.0
    } else {
        wrapped
    }
}

pub struct Pinpoint {
    channel: Arc<DeviceChannel>,
    solver: Arc<dyn PlateSolver>,
    config: AstrometryConfig,
}

impl Pinpoint {
    pub fn new(
        channel: Arc<DeviceChannel>,
        solver: Arc<dyn PlateSolver>,
        config: AstrometryConfig,
    ) -> Self {
        Self {
            channel,
            solver,
            config,
        }
    }

    pub fn config(&self) -> &AstrometryConfig {
        &self.config
    }

    /// Refine pointing onto (ra, dec) in degrees. The filter in place
    /// beforehand is restored however the loop ends.
    pub async fn point(&self, ra: f64, dec: f64) -> SessionResult<PinpointOutcome> {
        self.channel.enable_tracking().await?;
        if !self.channel.dome_open().await? {
            self.channel.open_dome(None).await?;
            self.channel.keep_open(self.config.keep_open_secs).await?;
        }

        let saved_filter = self.channel.current_filter().await?;
        if saved_filter != self.config.clear_filter {
            self.channel.change_filter(&self.config.clear_filter).await?;
        }

        let outcome = self.iterate(ra, dec).await;

        if saved_filter != self.config.clear_filter {
            if let Err(e) = self.channel.change_filter(&saved_filter).await {
                warn!("Failed to restore filter {} after pointing: {}", saved_filter, e);
                if outcome.is_ok() {
                    return Err(e.into());
                }
            }
        }

        outcome
    }

    async fn iterate(&self, ra: f64, dec: f64) -> SessionResult<PinpointOutcome> {
        let config = &self.config;
        let mut iteration = 0;
        let mut ra_offset = config.max_ra_offset;
        let mut dec_offset = config.max_dec_offset;
        let mut last_offset = None;

        info!("Pinpointing RA {:.4}, Dec {:.4}", ra, dec);

        while (ra_offset.abs() > config.min_ra_offset || dec_offset.abs() > config.min_dec_offset)
            && iteration < config.max_tries
        {
            let frames = self
                .channel
                .take_exposure(&ExposureRequest {
                    base: config.image_base.clone(),
                    time: config.exposure_time,
                    count: 1,
                    binning: config.binning,
                    filter: None,
                })
                .await?;
            let Some(path) = frames.into_iter().next() else {
                iteration += 1;
                continue;
            };

            let solved = self
                .solver
                .solve(&SolveRequest {
                    path,
                    ra,
                    dec,
                    radius: config.radius,
                    scale_low: config.scale_low,
                    scale_high: config.scale_high,
                    downsample: config.downsample,
                    cpu_limit: config.cpu_limit,
                })
                .await?;

            let Some((solved_ra, solved_dec)) = solved else {
                warn!("Pointing image did not solve ({}/{})", iteration + 1, config.max_tries);
                iteration += 1;
                continue;
            };

            ra_offset = wrap_ra_offset(ra - solved_ra);
            dec_offset = dec - solved_dec;
            last_offset = Some((ra_offset, dec_offset));

            if ra_offset.abs() > config.max_ra_offset || dec_offset.abs() > config.max_dec_offset {
                warn!(
                    "Calculated offsets too large (dRA={:.3} dDec={:.3}); abandoning pinpoint",
                    ra_offset, dec_offset
                );
                return Ok(PinpointOutcome {
                    converged: false,
                    iterations: iteration + 1,
                    last_offset,
                });
            }

            debug!(
                "dRA={:.1} arcsec dDec={:.1} arcsec",
                ra_offset * 3600.0,
                dec_offset * 3600.0
            );
            self.channel.offset(ra_offset, dec_offset).await?;
            self.channel.enable_tracking().await?;
            iteration += 1;
        }

        let converged = ra_offset.abs() <= config.min_ra_offset
            && dec_offset.abs() <= config.min_dec_offset;
        if converged {
            info!("Pinpoint converged after {} iterations", iteration);
        } else {
            warn!("Pinpoint reached {} tries without converging", config.max_tries);
        }

        Ok(PinpointOutcome {
            converged,
            iterations: iteration,
            last_offset,
        })
    }
}

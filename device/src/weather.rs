//! Weather gate
//!
//! Decides whether the sky is safe for an open dome and waits out bad
//! weather with a bounded poll.

use crate::channel::DeviceChannel;
use crate::error::{DeviceError, DeviceResult};
use crate::retry::{retry, RetryError, RetryPolicy};
use crate::state::WeatherSample;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{info, warn};

/// Weather limits and polling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeatherConfig {
    /// Highest sun altitude (degrees) at which the dome may be open
    pub max_sun_alt: f64,
    /// Highest cloud fraction at which the dome may be open
    pub max_cloud: f64,
    pub poll_interval_secs: u64,
    pub max_wait_secs: u64,
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            max_sun_alt: -12.0,
            max_cloud: 0.5,
            poll_interval_secs: 15 * 60,
            max_wait_secs: 4 * 60 * 60,
        }
    }
}

impl WeatherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }

    /// Every limit the sample violates. `sun_limit` overrides the
    /// configured sun altitude limit (sky flats run in twilight).
    pub fn breaches(&self, sample: &WeatherSample, sun_limit: Option<f64>) -> Vec<Breach> {
        let sun_limit = sun_limit.unwrap_or(self.max_sun_alt);
        let mut breaches = Vec::new();

        if sample.sun_alt > sun_limit {
            breaches.push(Breach::SunUp {
                altitude: sample.sun_alt,
                limit: sun_limit,
            });
        }
        if sample.cloud > self.max_cloud {
            breaches.push(Breach::Cloudy {
                cloud: sample.cloud,
                limit: self.max_cloud,
            });
        }
        if sample.rain != 0.0 {
            breaches.push(Breach::Raining { rain: sample.rain });
        }
        breaches
    }
}

/// A violated weather limit
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Breach {
    SunUp { altitude: f64, limit: f64 },
    Cloudy { cloud: f64, limit: f64 },
    Raining { rain: f64 },
}

impl fmt::Display for Breach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Breach::SunUp { altitude, limit } => {
                write!(f, "sun at {:.1} deg is above {:.1}", altitude, limit)
            }
            Breach::Cloudy { cloud, limit } => {
                write!(f, "cloud cover {:.2} is above {:.2}", cloud, limit)
            }
            Breach::Raining { rain } => write!(f, "rain sensor reads {}", rain),
        }
    }
}

enum Poll {
    Unsafe,
    Device(DeviceError),
}

impl fmt::Display for Poll {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Poll::Unsafe => write!(f, "weather still unsafe"),
            Poll::Device(e) => write!(f, "{}", e),
        }
    }
}

/// Weather checks performed through a device channel
pub struct WeatherGate<'a> {
    channel: &'a DeviceChannel,
}

impl<'a> WeatherGate<'a> {
    pub(crate) fn new(channel: &'a DeviceChannel) -> Self {
        Self { channel }
    }

    fn config(&self) -> &WeatherConfig {
        &self.channel.config().weather
    }

    /// Sample the sensors and decide. When any limit is breached and the
    /// dome is open, the dome is closed before returning false.
    pub async fn ok(&self, sun_limit: Option<f64>) -> DeviceResult<bool> {
        let sample = self.channel.get_weather().await?;
        let breaches = self.config().breaches(&sample, sun_limit);

        if breaches.is_empty() {
            return Ok(true);
        }

        for breach in &breaches {
            warn!("Weather unsafe: {}", breach);
        }
        if self.channel.dome_open().await? {
            self.channel.close_dome().await?;
        }
        Ok(false)
    }

    /// Poll at the configured interval until the weather is safe
    pub async fn wait_until_good(&self, sun_limit: Option<f64>) -> DeviceResult<()> {
        self.wait_until_good_every(sun_limit, self.config().poll_interval())
            .await
    }

    /// Poll every `interval` until the weather is safe, giving up with
    /// `WeatherTimeout` once the configured maximum wait has passed
    pub async fn wait_until_good_every(
        &self,
        sun_limit: Option<f64>,
        interval: Duration,
    ) -> DeviceResult<()> {
        let max_wait = self.config().max_wait();
        let interval = interval.max(Duration::from_secs(1));
        let checks = (max_wait.as_secs() / interval.as_secs()) as u32 + 1;
        let policy = RetryPolicy::fixed(checks, interval);

        let result = retry(
            &policy,
            "weather wait",
            |e: &Poll| matches!(e, Poll::Unsafe),
            |attempt| async move {
                match self.ok(sun_limit).await {
                    Ok(true) => Ok(()),
                    Ok(false) => {
                        if attempt == 1 {
                            info!(
                                "Waiting up to {:?} for good weather, checking every {:?}",
                                max_wait, interval
                            );
                        }
                        Err(Poll::Unsafe)
                    }
                    Err(e) => Err(Poll::Device(e)),
                }
            },
        )
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(RetryError::Aborted(Poll::Device(e))) => Err(e),
            Err(RetryError::Aborted(Poll::Unsafe)) | Err(RetryError::Exhausted { .. }) => {
                warn!("Weather did not clear within {:?}", max_wait);
                Err(DeviceError::WeatherTimeout { waited: max_wait })
            }
        }
    }
}

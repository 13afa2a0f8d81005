//! Telescope device channel
//!
//! Owns the remote session and the `TelescopeState`. One command runs at a
//! time; failed commands are retried with a liveness probe and reconnect
//! in between. Every successful mutating operation updates the state and
//! broadcasts a `TelescopeEvent`.

use crate::error::{DeviceError, DeviceResult};
use crate::protocol::{CommandTable, Dialect, Operation};
use crate::retry::{retry, RetryError, RetryPolicy};
use crate::state::{TelescopeEvent, TelescopeState, WeatherSample};
use crate::transport::Transport;
use crate::weather::{WeatherConfig, WeatherGate};
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

/// Device channel configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Retry policy for every controller command
    pub retry: RetryPolicy,
    /// Waits at least this long close the dome while sleeping
    pub wait_close_threshold_secs: u64,
    /// Exposure time used for bias frames
    pub bias_exposure_secs: f64,
    /// How often a single frame may be retaken after a dome closure
    pub max_frame_retakes: u32,
    /// Chip may be this many degrees above the setpoint
    pub chip_temp_tolerance: f64,
    pub weather: WeatherConfig,
    pub dialect: Dialect,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            wait_close_threshold_secs: 600,
            bias_exposure_secs: 0.1,
            max_frame_retakes: 10,
            chip_temp_tolerance: 1.0,
            weather: WeatherConfig::default(),
            dialect: Dialect::default(),
        }
    }
}

impl ChannelConfig {
    pub fn wait_close_threshold(&self) -> Duration {
        Duration::from_secs(self.wait_close_threshold_secs)
    }
}

/// A science exposure sequence
#[derive(Debug, Clone, PartialEq)]
pub struct ExposureRequest {
    /// Path without extension; frames are named from it
    pub base: String,
    /// Exposure time in seconds
    pub time: f64,
    pub count: u32,
    pub binning: u32,
    pub filter: Option<String>,
}

/// Seed for a plate-solve run on the telescope host
#[derive(Debug, Clone, PartialEq)]
pub struct SolveRequest {
    pub path: String,
    pub ra: f64,
    pub dec: f64,
    pub radius: f64,
    pub scale_low: f64,
    pub scale_high: f64,
    pub downsample: u32,
    pub cpu_limit: u32,
}

/// Filename of frame `index` in a sequence of `count`
pub fn frame_name(base: &str, index: u32, count: u32) -> String {
    if count == 1 {
        format!("{}.fits", base)
    } else {
        format!("{}_{}.fits", base, index)
    }
}

fn deg(value: f64) -> String {
    format!("{:.6}", value)
}

pub struct DeviceChannel {
    transport: Arc<dyn Transport>,
    table: CommandTable,
    config: ChannelConfig,
    state: RwLock<TelescopeState>,
    event_tx: broadcast::Sender<TelescopeEvent>,
}

impl DeviceChannel {
    pub fn new(transport: Arc<dyn Transport>, config: ChannelConfig) -> DeviceResult<Self> {
        let table = CommandTable::new(&config.dialect)?;
        let (event_tx, _) = broadcast::channel(256);

        info!("Device channel ready on {}", transport.describe());

        Ok(Self {
            transport,
            table,
            config,
            state: RwLock::new(TelescopeState::default()),
            event_tx,
        })
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn table(&self) -> &CommandTable {
        &self.table
    }

    /// Snapshot of the telescope state
    pub async fn state(&self) -> TelescopeState {
        self.state.read().await.clone()
    }

    /// Subscribe to state-change events
    pub fn subscribe(&self) -> broadcast::Receiver<TelescopeEvent> {
        self.event_tx.subscribe()
    }

    /// Weather gate backed by this channel
    pub fn weather(&self) -> WeatherGate<'_> {
        WeatherGate::new(self)
    }

    fn emit(&self, event: TelescopeEvent) {
        debug!("Telescope event: {}", event.name());
        let _ = self.event_tx.send(event);
    }

    async fn update(&self, f: impl FnOnce(&mut TelescopeState)) {
        let mut state = self.state.write().await;
        f(&mut state);
    }

    // =========================================================================
    // COMMAND EXECUTION
    // =========================================================================

    /// Run a raw command, retrying transport failures and non-zero exits.
    /// Returns the reply with lines joined and trimmed.
    pub async fn execute(&self, command: &str) -> DeviceResult<String> {
        let result = retry(
            &self.config.retry,
            command,
            DeviceError::is_retryable,
            |attempt| async move {
                if attempt > 1 && !self.transport.probe().await {
                    warn!(
                        "Telescope session on {} is not responding; reconnecting",
                        self.transport.describe()
                    );
                    self.transport.reconnect().await?;
                }

                let output = self.transport.exec(command).await?;
                if output.success() {
                    Ok(output.text())
                } else {
                    Err(DeviceError::NonZeroExit {
                        command: command.to_string(),
                        status: output.status,
                        output: format!("{} {}", output.text(), output.stderr.trim())
                            .trim()
                            .to_string(),
                    })
                }
            },
        )
        .await;

        match result {
            Ok(reply) => Ok(reply),
            Err(RetryError::Aborted(e)) => Err(e),
            Err(RetryError::Exhausted {
                attempts,
                last_error,
            }) => {
                error!(
                    "Command '{}' failed after {} attempts: {}",
                    command, attempts, last_error
                );
                Err(DeviceError::RetryExhausted {
                    attempts,
                    last_error: last_error.to_string(),
                })
            }
        }
    }

    /// Format and run an operation from the command table
    pub async fn run(&self, operation: Operation, args: &[(&str, String)]) -> DeviceResult<String> {
        let command = self.table.request(operation, args)?;
        self.execute(&command).await
    }

    async fn run_expecting(&self, operation: Operation, args: &[(&str, String)]) -> DeviceResult<()> {
        let reply = self.run(operation, args).await?;
        if self.table.matches(operation, &reply) {
            Ok(())
        } else {
            Err(DeviceError::NotApplied {
                operation: operation.name().to_string(),
                detail: format!("controller replied {:?}", reply),
            })
        }
    }

    // =========================================================================
    // DOME
    // =========================================================================

    /// Query the slit status
    pub async fn dome_open(&self) -> DeviceResult<bool> {
        let reply = self.run(Operation::DomeStatus, &[]).await?;
        let open = self.table.capture(Operation::DomeStatus, &reply)? == "open";
        self.update(|s| s.dome_open = open).await;
        Ok(open)
    }

    /// Open the dome. A no-op when already open; refused when the weather
    /// gate reports unsafe conditions.
    pub async fn open_dome(&self, sun_alt: Option<f64>) -> DeviceResult<()> {
        if self.dome_open().await? {
            debug!("Dome already open");
            return Ok(());
        }

        if !self.weather().ok(sun_alt).await? {
            warn!("Not opening the dome: weather is unsafe");
            return Err(DeviceError::WeatherUnsafe {
                action: "open the dome".to_string(),
            });
        }

        info!("Opening dome");
        self.emit(TelescopeEvent::Opening);
        self.run(Operation::OpenDome, &[]).await?;
        self.update(|s| s.dome_open = true).await;
        self.emit(TelescopeEvent::Openup);
        Ok(())
    }

    /// Close the dome; the controller also stops tracking
    pub async fn close_dome(&self) -> DeviceResult<()> {
        info!("Closing dome");
        self.emit(TelescopeEvent::Closing);
        self.run(Operation::CloseDome, &[]).await?;
        self.update(|s| {
            s.dome_open = false;
            s.tracking = false;
        })
        .await;
        self.emit(TelescopeEvent::Closedown);
        Ok(())
    }

    /// Ask the controller to keep the slit open for `seconds`
    pub async fn keep_open(&self, seconds: u64) -> DeviceResult<()> {
        if !self.dome_open().await? {
            warn!("Slit must be open before keep_open");
            return Err(DeviceError::InvalidState {
                operation: Operation::KeepOpen.name().to_string(),
                detail: "dome is closed".to_string(),
            });
        }
        self.run(Operation::KeepOpen, &[("time", seconds.to_string())])
            .await?;
        Ok(())
    }

    /// Close the dome and release the lock. Both steps are attempted; the
    /// first error is returned.
    pub async fn close_down(&self) -> DeviceResult<()> {
        let closed = self.close_dome().await;
        if let Err(e) = &closed {
            error!("Failed to close dome during close down: {}", e);
        }

        let unlocked = self.unlock().await;
        if let Err(e) = &unlocked {
            error!("Failed to release lock during close down: {}", e);
        }

        closed?;
        match unlocked? {
            true => Ok(()),
            false => Err(DeviceError::NotApplied {
                operation: Operation::Unlock.name().to_string(),
                detail: "controller did not confirm".to_string(),
            }),
        }
    }

    /// Sleep for `seconds`. Long waits close the dome and reopen it on
    /// waking if the weather allows.
    pub async fn wait(&self, seconds: u64) -> DeviceResult<()> {
        let duration = Duration::from_secs(seconds);
        let close = duration >= self.config.wait_close_threshold() && self.state().await.dome_open;

        info!("Waiting {} seconds{}", seconds, if close { " with dome closed" } else { "" });
        self.emit(TelescopeEvent::Wait { seconds });

        if close {
            self.close_dome().await?;
        }

        tokio::time::sleep(duration).await;
        self.emit(TelescopeEvent::Wake);

        if close {
            match self.open_dome(None).await {
                Err(DeviceError::WeatherUnsafe { .. }) => {
                    info!("Dome stays closed after wait: weather is unsafe");
                }
                other => other?,
            }
        }
        Ok(())
    }

    // =========================================================================
    // LOCK
    // =========================================================================

    /// Take the hardware lock. Returns false if another user holds it.
    pub async fn lock(&self, user: &str, comment: &str) -> DeviceResult<bool> {
        let reply = self
            .run(
                Operation::Lock,
                &[("user", user.to_string()), ("comment", comment.to_string())],
            )
            .await?;

        if !self.table.matches(Operation::Lock, &reply) {
            info!("Lock refused: {}", reply);
            return Ok(false);
        }

        let owner = user.to_string();
        self.update(|s| {
            s.locked = true;
            s.lock_owner = Some(owner);
        })
        .await;
        self.emit(TelescopeEvent::Lock {
            user: user.to_string(),
            comment: comment.to_string(),
        });
        Ok(true)
    }

    /// Release the hardware lock
    pub async fn unlock(&self) -> DeviceResult<bool> {
        let reply = self.run(Operation::Unlock, &[]).await?;
        if !self.table.matches(Operation::Unlock, &reply) {
            warn!("Unlock not confirmed: {}", reply);
            return Ok(false);
        }

        self.update(|s| {
            s.locked = false;
            s.lock_owner = None;
        })
        .await;
        self.emit(TelescopeEvent::Unlock);
        Ok(true)
    }

    /// Current lock holder, if any
    pub async fn locked(&self) -> DeviceResult<Option<String>> {
        let reply = self.run(Operation::LockStatus, &[]).await?;
        if reply.trim() == "done lock" || reply.trim().is_empty() {
            return Ok(None);
        }
        Ok(self.table.capture(Operation::LockStatus, &reply).ok())
    }

    // =========================================================================
    // MOUNT
    // =========================================================================

    pub async fn enable_tracking(&self) -> DeviceResult<()> {
        self.run(Operation::EnableTracking, &[]).await?;
        self.update(|s| s.tracking = true).await;
        Ok(())
    }

    pub async fn disable_tracking(&self) -> DeviceResult<()> {
        self.run(Operation::DisableTracking, &[]).await?;
        self.update(|s| s.tracking = false).await;
        Ok(())
    }

    /// Slew to J2000 RA/Dec in degrees
    pub async fn goto(&self, ra: f64, dec: f64) -> DeviceResult<()> {
        info!("Slewing to RA {:.4}, Dec {:.4}", ra, dec);
        self.emit(TelescopeEvent::Slew { ra, dec });
        self.run(Operation::Goto, &[("ra", deg(ra)), ("dec", deg(dec))])
            .await?;
        self.update(|s| s.pointing = Some((ra, dec))).await;
        self.emit(TelescopeEvent::Point { ra, dec });
        Ok(())
    }

    /// Slew to an hour angle (hours) and declination (degrees)
    pub async fn goto_ha_dec(&self, ha: f64, dec: f64) -> DeviceResult<()> {
        self.run(
            Operation::GotoHaDec,
            &[("ha", format!("{:.4}", ha)), ("dec", format!("{:.4}", dec))],
        )
        .await?;
        Ok(())
    }

    /// Point east of the meridian near zenith for sky flats, with a small
    /// random wiggle so stars do not land on the same pixels
    pub async fn goto_point_for_flats(&self, latitude: f64, ha: f64) -> DeviceResult<()> {
        let (dha, ddec) = {
            let mut rng = rand::thread_rng();
            (rng.gen_range(0.0..0.5), rng.gen_range(0.0..0.5))
        };
        self.goto_ha_dec(ha + dha, latitude + ddec).await
    }

    /// Apply a pointing offset in degrees
    pub async fn offset(&self, dra: f64, ddec: f64) -> DeviceResult<()> {
        debug!("Offsetting by dRA {:.4}, dDec {:.4}", dra, ddec);
        self.run(Operation::Offset, &[("ra", deg(dra)), ("dec", deg(ddec))])
            .await?;

        let pointing = self.state().await.pointing;
        if let Some((ra, dec)) = pointing {
            let moved = ((ra + dra).rem_euclid(360.0), dec + ddec);
            self.update(|s| s.pointing = Some(moved)).await;
            self.emit(TelescopeEvent::Point {
                ra: moved.0,
                dec: moved.1,
            });
        }
        Ok(())
    }

    /// Altitude of a J2000 position as computed by the controller
    pub async fn altaz(&self, ra: f64, dec: f64) -> DeviceResult<f64> {
        let reply = self
            .run(Operation::AltAz, &[("ra", deg(ra)), ("dec", deg(dec))])
            .await?;
        self.table.number(Operation::AltAz, &reply)
    }

    /// Home the dome, hour angle and declination motors
    pub async fn calibrate_motors(&self) -> DeviceResult<()> {
        info!("Calibrating dome and axis motors");
        self.run_expecting(Operation::HomeDome, &[]).await?;
        self.run_expecting(Operation::HomeHa, &[]).await?;
        self.run_expecting(Operation::HomeDec, &[]).await?;
        Ok(())
    }

    // =========================================================================
    // FILTER WHEEL / FOCUSER
    // =========================================================================

    pub async fn current_filter(&self) -> DeviceResult<String> {
        let reply = self.run(Operation::CurrentFilter, &[]).await?;
        let name = self.table.capture(Operation::CurrentFilter, &reply)?;
        let filter = name.clone();
        self.update(|s| s.current_filter = Some(filter)).await;
        Ok(name)
    }

    /// Change filter and verify the wheel reports it
    pub async fn change_filter(&self, name: &str) -> DeviceResult<()> {
        self.emit(TelescopeEvent::FilterChange {
            filter: name.to_string(),
        });
        self.run(Operation::ChangeFilter, &[("name", name.to_string())])
            .await?;

        let current = self.current_filter().await?;
        if current != name {
            return Err(DeviceError::NotApplied {
                operation: Operation::ChangeFilter.name().to_string(),
                detail: format!("requested {} but wheel reports {}", name, current),
            });
        }

        self.emit(TelescopeEvent::Filter {
            filter: current,
        });
        Ok(())
    }

    pub async fn get_focus(&self) -> DeviceResult<i32> {
        let reply = self.run(Operation::GetFocus, &[]).await?;
        let position = self.table.number(Operation::GetFocus, &reply)? as i32;
        self.update(|s| s.focus_position = Some(position)).await;
        Ok(position)
    }

    pub async fn set_focus(&self, position: i32) -> DeviceResult<()> {
        self.run_expecting(Operation::SetFocus, &[("position", position.to_string())])
            .await?;
        self.update(|s| s.focus_position = Some(position)).await;
        self.emit(TelescopeEvent::Focus { position });
        Ok(())
    }

    // =========================================================================
    // CAMERA
    // =========================================================================

    /// Make sure the dome is open before a sky exposure, waiting out bad
    /// weather if needed
    async fn ensure_open(&self, keep_open_secs: u64) -> DeviceResult<()> {
        if self.dome_open().await? {
            return Ok(());
        }
        self.weather().wait_until_good(None).await?;
        self.open_dome(None).await?;
        self.keep_open(keep_open_secs).await
    }

    /// Take a sequence of science frames.
    ///
    /// A frame during which the dome closed is presumed corrupt: the channel
    /// waits for good weather, reopens and retakes it under the same name.
    pub async fn take_exposure(&self, request: &ExposureRequest) -> DeviceResult<Vec<String>> {
        if let Some(filter) = &request.filter {
            self.change_filter(filter).await?;
        }

        let mut filenames = Vec::with_capacity(request.count as usize);
        let mut retakes = 0;
        let mut index = 0;

        while index < request.count {
            let remaining = (request.time * (request.count - index) as f64) as u64 + 300;
            self.ensure_open(remaining).await?;

            let filename = frame_name(&request.base, index, request.count);
            info!(
                "Capturing frame {}/{}: {} ({}s, bin {})",
                index + 1,
                request.count,
                filename,
                request.time,
                request.binning
            );
            self.emit(TelescopeEvent::Exposing {
                filename: filename.clone(),
                time: request.time,
                binning: request.binning,
                filter: request.filter.clone(),
            });

            self.run(
                Operation::Expose,
                &[
                    ("time", request.time.to_string()),
                    ("binning", request.binning.to_string()),
                    ("outfile", filename.clone()),
                ],
            )
            .await?;

            if !self.dome_open().await? {
                retakes += 1;
                warn!(
                    "Dome closed during {}; frame will be retaken ({}/{})",
                    filename, retakes, self.config.max_frame_retakes
                );
                if retakes > self.config.max_frame_retakes {
                    return Err(DeviceError::NotApplied {
                        operation: Operation::Expose.name().to_string(),
                        detail: format!("dome closed during {} {} times", filename, retakes),
                    });
                }
                continue;
            }

            self.emit(TelescopeEvent::Exposure {
                filename: filename.clone(),
            });
            filenames.push(filename);
            index += 1;
            retakes = 0;
        }

        Ok(filenames)
    }

    /// Take dark frames named `{base}_dark_{i}.fits`
    pub async fn take_dark(
        &self,
        base: &str,
        time: f64,
        count: u32,
        binning: u32,
    ) -> DeviceResult<Vec<String>> {
        self.take_dark_frames(&format!("{}_dark", base), time, count, binning)
            .await
    }

    /// Take bias frames named `{base}_bias_{i}.fits`
    pub async fn take_bias(&self, base: &str, count: u32, binning: u32) -> DeviceResult<Vec<String>> {
        self.take_dark_frames(
            &format!("{}_bias", base),
            self.config.bias_exposure_secs,
            count,
            binning,
        )
        .await
    }

    async fn take_dark_frames(
        &self,
        prefix: &str,
        time: f64,
        count: u32,
        binning: u32,
    ) -> DeviceResult<Vec<String>> {
        let mut filenames = Vec::with_capacity(count as usize);
        for index in 0..count {
            let filename = format!("{}_{}.fits", prefix, index);
            self.emit(TelescopeEvent::Exposing {
                filename: filename.clone(),
                time,
                binning,
                filter: None,
            });
            self.run(
                Operation::Dark,
                &[
                    ("time", time.to_string()),
                    ("binning", binning.to_string()),
                    ("outfile", filename.clone()),
                ],
            )
            .await?;
            self.emit(TelescopeEvent::Exposure {
                filename: filename.clone(),
            });
            filenames.push(filename);
        }
        Ok(filenames)
    }

    /// Mean pixel value of an image on the telescope host
    pub async fn mean_image_count(&self, path: &str) -> DeviceResult<f64> {
        let reply = self
            .run(Operation::MeanCount, &[("path", path.to_string())])
            .await?;
        self.table.number(Operation::MeanCount, &reply)
    }

    /// Whether the CCD is within tolerance of its setpoint
    pub async fn chip_temp_ok(&self) -> DeviceResult<bool> {
        let reply = self.run(Operation::ChipTemperature, &[]).await?;
        let chip = self.table.number(Operation::ChipTemperature, &reply)?;
        let setpoint = self.table.number(Operation::ChipSetpoint, &reply)?;
        Ok(chip - setpoint < self.config.chip_temp_tolerance)
    }

    pub async fn cool_ccd(&self) -> DeviceResult<()> {
        self.run(Operation::CoolCcd, &[]).await?;
        Ok(())
    }

    pub async fn lamps_on(&self) -> DeviceResult<()> {
        self.run_expecting(Operation::LampsOn, &[]).await
    }

    pub async fn lamps_off(&self) -> DeviceResult<()> {
        self.run_expecting(Operation::LampsOff, &[]).await
    }

    /// Create a directory on the telescope host
    pub async fn make_dir(&self, path: &str) -> DeviceResult<()> {
        self.run(Operation::MakeDir, &[("path", path.to_string())])
            .await?;
        Ok(())
    }

    /// Run the plate solver on the telescope host. `None` means the field
    /// did not solve.
    pub async fn solve_field(&self, request: &SolveRequest) -> DeviceResult<Option<(f64, f64)>> {
        let reply = self
            .run(
                Operation::SolveField,
                &[
                    ("path", request.path.clone()),
                    ("ra", deg(request.ra)),
                    ("dec", deg(request.dec)),
                    ("radius", request.radius.to_string()),
                    ("scale_low", request.scale_low.to_string()),
                    ("scale_high", request.scale_high.to_string()),
                    ("downsample", request.downsample.to_string()),
                    ("cpu_limit", request.cpu_limit.to_string()),
                ],
            )
            .await?;

        let Ok(values) = self.table.captures(Operation::SolveField, &reply) else {
            debug!("Field did not solve: {}", reply);
            return Ok(None);
        };

        match values.as_slice() {
            [ra, dec] => match (ra.parse::<f64>(), dec.parse::<f64>()) {
                (Ok(ra), Ok(dec)) => Ok(Some((ra, dec))),
                _ => Err(DeviceError::parse(
                    Operation::SolveField.name(),
                    "<ra, dec>",
                    reply,
                )),
            },
            _ => Err(DeviceError::parse(
                Operation::SolveField.name(),
                "<ra, dec>",
                reply,
            )),
        }
    }

    // =========================================================================
    // WEATHER
    // =========================================================================

    /// Read every weather sensor. A sensor whose reply cannot be parsed is
    /// reported at its safest value.
    pub async fn get_weather(&self) -> DeviceResult<WeatherSample> {
        let replies = self
            .read_all(&[
                Operation::Cloud,
                Operation::Dew,
                Operation::Rain,
                Operation::SunAltitude,
                Operation::MoonAltitude,
            ])
            .await?;
        let [cloud, dew, rain, sun, moon] = replies.as_slice() else {
            return Err(DeviceError::InvalidState {
                operation: "weather".to_string(),
                detail: format!("expected 5 sensor replies, got {}", replies.len()),
            });
        };

        let sample = WeatherSample {
            cloud: self.sensor(Operation::Cloud, cloud, WeatherSample::SAFEST_CLOUD),
            dew: self.sensor(Operation::Dew, dew, WeatherSample::SAFEST_DEW),
            rain: self.sensor(Operation::Rain, rain, WeatherSample::SAFEST_RAIN),
            sun_alt: self.sensor(Operation::SunAltitude, sun, WeatherSample::SAFEST_SUN_ALT),
            moon_alt: self.sensor(
                Operation::MoonAltitude,
                moon,
                WeatherSample::SAFEST_MOON_ALT,
            ),
            taken_at: Utc::now(),
        };

        self.update(|s| s.last_weather = Some(sample)).await;
        self.emit(TelescopeEvent::Weather(sample));
        Ok(sample)
    }

    /// Run each operation's request once. Operations whose requests render
    /// the same, like the sensors behind a single `tx taux`, share a reply.
    async fn read_all(&self, operations: &[Operation]) -> DeviceResult<Vec<String>> {
        let mut sent: Vec<(String, String)> = Vec::new();
        let mut replies = Vec::with_capacity(operations.len());
        for &operation in operations {
            let request = self.table.request(operation, &[])?;
            let reply = match sent.iter().find(|(r, _)| *r == request) {
                Some((_, reply)) => reply.clone(),
                None => {
                    let reply = self.execute(&request).await?;
                    sent.push((request, reply.clone()));
                    reply
                }
            };
            replies.push(reply);
        }
        Ok(replies)
    }

    fn sensor(&self, operation: Operation, reply: &str, safest: f64) -> f64 {
        match self.table.number(operation, reply) {
            Ok(value) => value,
            Err(e) => {
                warn!("{}; assuming {}", e, safest);
                safest
            }
        }
    }
}

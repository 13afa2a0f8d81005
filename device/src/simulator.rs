//! In-memory telescope controller
//!
//! Speaks the default dialect and keeps enough state to exercise the
//! channel, the pointing loop and the nightly executor without hardware.
//! Tests script weather, dome closures, solver results and transport
//! failures through the public setters.

use crate::error::{DeviceError, DeviceResult};
use crate::protocol::{PROBE_COMMAND, PROBE_REPLY};
use crate::transport::{CommandOutput, Transport};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

/// Sky and sensor conditions reported by the simulated controller
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Conditions {
    pub cloud: f64,
    pub dew: f64,
    pub rain: f64,
    pub sun_alt: f64,
    pub moon_alt: f64,
}

impl Conditions {
    pub fn clear_night() -> Self {
        Self {
            cloud: 0.0,
            dew: 2.0,
            rain: 0.0,
            sun_alt: -30.0,
            moon_alt: -10.0,
        }
    }

    pub fn raining() -> Self {
        Self {
            rain: 1.0,
            cloud: 1.0,
            ..Self::clear_night()
        }
    }
}

#[derive(Debug)]
struct Controller {
    session_alive: bool,
    failures_remaining: u32,
    dome_open: bool,
    tracking: bool,
    filter: String,
    filters: Vec<String>,
    focus: i32,
    lock_owner: Option<String>,
    conditions: Conditions,
    weather_script: VecDeque<Conditions>,
    /// Where the telescope actually points (RA, Dec) in degrees
    actual: (f64, f64),
    /// Error added to every commanded slew
    pointing_error: (f64, f64),
    solve_script: VecDeque<Option<(f64, f64)>>,
    exposures_started: u32,
    dome_closes_on: HashSet<u32>,
    /// Science frames whose path contains the pattern fail this many times
    image_faults: Option<(String, u32)>,
    image_times: HashMap<String, f64>,
    images: Vec<String>,
    sky_counts_per_sec: f64,
    chip_temp: f64,
    setpoint: f64,
    log: Vec<String>,
    reconnects: u32,
}

impl Default for Controller {
    fn default() -> Self {
        Self {
            session_alive: true,
            failures_remaining: 0,
            dome_open: false,
            tracking: false,
            filter: "clear".to_string(),
            filters: ["clear", "u", "g", "r", "i", "z", "h-alpha"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            focus: 4200,
            lock_owner: None,
            conditions: Conditions::clear_night(),
            weather_script: VecDeque::new(),
            actual: (0.0, 0.0),
            pointing_error: (0.0, 0.0),
            solve_script: VecDeque::new(),
            exposures_started: 0,
            dome_closes_on: HashSet::new(),
            image_faults: None,
            image_times: HashMap::new(),
            images: Vec::new(),
            sky_counts_per_sec: 20_000.0,
            chip_temp: -15.0,
            setpoint: -20.0,
            log: Vec::new(),
            reconnects: 0,
        }
    }
}

fn arg<'a>(command: &'a str, key: &str) -> Option<&'a str> {
    command
        .split_whitespace()
        .find_map(|token| token.strip_prefix(key)?.strip_prefix('='))
}

fn flag<'a>(command: &'a str, flag: &str) -> Option<&'a str> {
    let mut tokens = command.split_whitespace();
    tokens.find(|token| *token == flag)?;
    tokens.next()
}

fn number(command: &str, key: &str) -> Option<f64> {
    arg(command, key)?.parse().ok()
}

/// Simulated controller reachable through the `Transport` trait
#[derive(Default)]
pub struct SimulatedTransport {
    controller: Mutex<Controller>,
}

impl SimulatedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut Controller) -> R) -> R {
        let mut controller = match self.controller.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut controller)
    }

    /// Set the current conditions
    pub fn set_conditions(&self, conditions: Conditions) {
        self.with(|c| c.conditions = conditions);
    }

    /// Queue conditions returned by successive weather reads; the last one sticks
    pub fn script_weather(&self, script: impl IntoIterator<Item = Conditions>) {
        self.with(|c| c.weather_script.extend(script));
    }

    /// Make the next `count` commands fail with a non-zero exit
    pub fn fail_next(&self, count: u32) {
        self.with(|c| c.failures_remaining = count);
    }

    /// Drop the remote session; commands fail until `reconnect`
    pub fn drop_session(&self) {
        self.with(|c| c.session_alive = false);
    }

    /// Close the dome while exposure number `n` (1-based, counting every
    /// science frame started) is running
    pub fn close_dome_during_exposure(&self, n: u32) {
        self.with(|c| {
            c.dome_closes_on.insert(n);
        });
    }

    /// Fail the next `count` science exposures whose command contains
    /// `pattern` with a non-zero exit
    pub fn fail_exposures_matching(&self, pattern: &str, count: u32) {
        self.with(|c| c.image_faults = Some((pattern.to_string(), count)));
    }

    /// Offset between commanded and actual pointing, in degrees
    pub fn set_pointing_error(&self, dra: f64, ddec: f64) {
        self.with(|c| c.pointing_error = (dra, ddec));
    }

    /// Queue solver results; `None` means the field did not solve
    pub fn script_solutions(&self, script: impl IntoIterator<Item = Option<(f64, f64)>>) {
        self.with(|c| c.solve_script.extend(script));
    }

    /// Another user holds the hardware lock
    pub fn set_lock_owner(&self, owner: Option<&str>) {
        self.with(|c| c.lock_owner = owner.map(str::to_string));
    }

    pub fn lock_owner(&self) -> Option<String> {
        self.with(|c| c.lock_owner.clone())
    }

    pub fn dome_open(&self) -> bool {
        self.with(|c| c.dome_open)
    }

    pub fn filter(&self) -> String {
        self.with(|c| c.filter.clone())
    }

    /// Every science and calibration frame written, in order
    pub fn images(&self) -> Vec<String> {
        self.with(|c| c.images.clone())
    }

    /// Every command received, probes included
    pub fn commands(&self) -> Vec<String> {
        self.with(|c| c.log.clone())
    }

    /// Commands starting with `prefix`
    pub fn commands_matching(&self, prefix: &str) -> Vec<String> {
        self.with(|c| {
            c.log
                .iter()
                .filter(|cmd| cmd.starts_with(prefix))
                .cloned()
                .collect()
        })
    }

    pub fn reconnects(&self) -> u32 {
        self.with(|c| c.reconnects)
    }

    /// Returns the reply and how long the command keeps the controller busy
    fn handle(&self, command: &str) -> DeviceResult<(CommandOutput, Duration)> {
        self.with(|c| {
            c.log.push(command.to_string());

            if !c.session_alive {
                return Err(DeviceError::transport(command, "session closed"));
            }
            if command == PROBE_COMMAND {
                return Ok((CommandOutput::ok(PROBE_REPLY), Duration::ZERO));
            }
            if c.failures_remaining > 0 {
                c.failures_remaining -= 1;
                return Ok((
                    CommandOutput::failed(255, "controller busy"),
                    Duration::ZERO,
                ));
            }
            if command.starts_with("image ") && !command.ends_with(" dark") {
                if let Some((pattern, remaining)) = &mut c.image_faults {
                    if *remaining > 0 && command.contains(pattern.as_str()) {
                        *remaining -= 1;
                        return Ok((CommandOutput::failed(255, "ccd fault"), Duration::ZERO));
                    }
                }
            }

            Ok(c.respond(command))
        })
    }
}

impl Controller {
    fn respond(&mut self, command: &str) -> (CommandOutput, Duration) {
        let mut busy = Duration::ZERO;

        let reply = if command.starts_with("openup") {
            self.dome_open = true;
            String::new()
        } else if command.starts_with("closedown") {
            self.dome_open = false;
            self.tracking = false;
            String::new()
        } else if command.starts_with("keepopen") {
            String::new()
        } else if command == "tx slit" {
            format!("slit={}", if self.dome_open { "open" } else { "closed" })
        } else if command == "tx track on" {
            self.tracking = true;
            "done track".to_string()
        } else if command == "tx track off" {
            self.tracking = false;
            "done track".to_string()
        } else if command == "tx taux" {
            if let Some(next) = self.weather_script.pop_front() {
                self.conditions = next;
            }
            format!(
                "cloud={} dew={} rain={} wind=1.0",
                self.conditions.cloud, self.conditions.dew, self.conditions.rain
            )
        } else if command == "sun" {
            format!("az=270.0 alt={}", self.conditions.sun_alt)
        } else if command == "moon" {
            format!("az=90.0 alt={} phase=0.4", self.conditions.moon_alt)
        } else if command.starts_with("tx point ra=") {
            if let (Some(ra), Some(dec)) = (number(command, "ra"), number(command, "dec")) {
                self.actual = (ra + self.pointing_error.0, dec + self.pointing_error.1);
            }
            "done point".to_string()
        } else if command.starts_with("tx point ha=") {
            "done point".to_string()
        } else if command.starts_with("tx offset") {
            let dra = number(command, "ra").unwrap_or(0.0);
            let ddec = number(command, "dec").unwrap_or(0.0);
            self.actual = (self.actual.0 + dra, self.actual.1 + ddec);
            "done offset".to_string()
        } else if command.contains("| altaz") {
            "alt=45.0 az=180.0".to_string()
        } else if command == "pfilter" {
            self.filter.clone()
        } else if let Some(name) = command.strip_prefix("pfilter ") {
            let name = name.trim();
            if self.filters.iter().any(|f| f == name) {
                self.filter = name.to_string();
            }
            String::new()
        } else if command.starts_with("image ") {
            let time = number(command, "time").unwrap_or(0.0);
            let outfile = arg(command, "outfile").unwrap_or("image.fits").to_string();
            busy = Duration::from_secs_f64(time.max(0.0));

            if !command.ends_with(" dark") {
                self.exposures_started += 1;
                if self.dome_closes_on.contains(&self.exposures_started) {
                    self.dome_open = false;
                }
            }

            self.image_times.insert(outfile.clone(), time);
            self.images.push(outfile);
            String::new()
        } else if command == "tx lock clear" {
            self.lock_owner = None;
            "done lock".to_string()
        } else if command.starts_with("tx lock user=") {
            let user = arg(command, "user").unwrap_or_default().to_string();
            match &self.lock_owner {
                Some(owner) if *owner != user => format!("lock denied: held by user={}", owner),
                _ => {
                    self.lock_owner = Some(user);
                    "done lock".to_string()
                }
            }
        } else if command == "tx lock" {
            match &self.lock_owner {
                Some(owner) => format!("lock user={} comment=observing", owner),
                None => "done lock".to_string(),
            }
        } else if command == "tx focus" {
            format!("pos={}", self.focus)
        } else if command.starts_with("tx focus pos=") {
            if let Some(pos) = number(command, "pos") {
                self.focus = pos as i32;
            }
            "done focus".to_string()
        } else if command.starts_with("tx home") {
            "done home".to_string()
        } else if command.starts_with("tx lamps") {
            "done lamps".to_string()
        } else if command == "ccd status" {
            format!("tchip={} setpoint={}", self.chip_temp, self.setpoint)
        } else if command == "ccd cool" {
            self.chip_temp = self.setpoint;
            String::new()
        } else if command.starts_with("mkdir") {
            String::new()
        } else if let Some(path) = command.strip_prefix("imstat ") {
            let time = self.image_times.get(path.trim()).copied().unwrap_or(1.0);
            format!("npix=4194304 mean={:.1}", time * self.sky_counts_per_sec)
        } else if command.starts_with("solve-field") {
            let solution = match self.solve_script.pop_front() {
                Some(scripted) => scripted,
                None => Some(self.actual),
            };
            match solution {
                Some((ra, dec)) => format!(
                    "Field: {}\nField center: (RA,Dec) = ({:.6}, {:.6}) deg.\nField size: 26 x 17 arcminutes",
                    flag(command, "solve-field").unwrap_or_default(),
                    ra,
                    dec
                ),
                None => "Did not solve (or no WCS file was written).".to_string(),
            }
        } else {
            return (
                CommandOutput::failed(127, format!("unknown command: {}", command)),
                busy,
            );
        };

        (CommandOutput::ok(reply), busy)
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn exec(&self, command: &str) -> DeviceResult<CommandOutput> {
        let (output, busy) = self.handle(command)?;
        if !busy.is_zero() {
            tokio::time::sleep(busy).await;
        }
        Ok(output)
    }

    async fn reconnect(&self) -> DeviceResult<()> {
        self.with(|c| {
            c.session_alive = true;
            c.reconnects += 1;
        });
        Ok(())
    }

    fn describe(&self) -> String {
        "simulator".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arg_parsing() {
        let cmd = "tx point ra=10.5 dec=-41.25 equinox=2000";
        assert_eq!(number(cmd, "ra"), Some(10.5));
        assert_eq!(number(cmd, "dec"), Some(-41.25));
        assert_eq!(arg(cmd, "equinox"), Some("2000"));
        assert_eq!(arg(cmd, "missing"), None);
    }

    #[tokio::test]
    async fn test_probe_and_dropped_session() {
        let sim = SimulatedTransport::new();
        assert!(sim.probe().await);

        sim.drop_session();
        assert!(!sim.probe().await);

        sim.reconnect().await.unwrap();
        assert!(sim.probe().await);
        assert_eq!(sim.reconnects(), 1);
    }

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let sim = SimulatedTransport::new();
        let reply = sim.exec("tx lock user=alice comment=focus").await.unwrap();
        assert_eq!(reply.text(), "done lock");

        let reply = sim.exec("tx lock user=queue comment=observing").await.unwrap();
        assert!(reply.text().contains("denied"));
        assert_eq!(sim.lock_owner().as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_scripted_weather_is_consumed_in_order() {
        let sim = SimulatedTransport::new();
        sim.script_weather([Conditions::raining(), Conditions::clear_night()]);

        let first = sim.exec("tx taux").await.unwrap();
        assert!(first.text().contains("rain=1"));
        let second = sim.exec("tx taux").await.unwrap();
        assert!(second.text().contains("rain=0"));
        let third = sim.exec("tx taux").await.unwrap();
        assert!(third.text().contains("rain=0"));
    }

    #[tokio::test]
    async fn test_unknown_command_fails() {
        let sim = SimulatedTransport::new();
        let output = sim.exec("format c:").await.unwrap();
        assert_eq!(output.status, 127);
    }

    #[tokio::test]
    async fn test_exposure_faults_match_path() {
        let sim = SimulatedTransport::new();
        sim.fail_exposures_matching("/raw/science/", 1);

        let dark = sim
            .exec("image time=0 bin=1 outfile=/d/raw/science/b_0.fits dark")
            .await
            .unwrap();
        assert!(dark.success());
        let other = sim.exec("image time=1 bin=1 outfile=/tmp/pointing.fits").await.unwrap();
        assert!(other.success());

        let failed = sim
            .exec("image time=1 bin=1 outfile=/d/raw/science/m_0.fits")
            .await
            .unwrap();
        assert_eq!(failed.status, 255);
        let retried = sim
            .exec("image time=1 bin=1 outfile=/d/raw/science/m_0.fits")
            .await
            .unwrap();
        assert!(retried.success());
    }
}

//! Observation scheduler
//!
//! Picks the next observation from a pool of pending requests. The general
//! scheduler samples each target's altitude over the coming night, keeps
//! the samples that satisfy every constraint, and schedules the target at
//! its highest constrained altitude. The soonest such time wins.

use crate::ephemeris::{self, Ephemeris};
use crate::store::Observation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// How observation priority affects selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityPolicy {
    /// Soonest best time wins; priority is ignored
    #[default]
    SoonestOnly,
    /// Soonest best time wins; equal times go to the higher priority
    PriorityTieBreak,
    /// Highest priority class first, soonest within the class
    PriorityFirst,
}

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub kind: Scheduler,
    pub priority_policy: PriorityPolicy,
    /// Degrees
    pub min_altitude: f64,
    /// Darkness limit, degrees
    pub max_sun_alt: f64,
    /// Degrees; an observation may ask for more
    pub min_moon_separation: f64,
    /// Altitude samples per curve
    pub samples: usize,
    pub horizon_hours: f64,
    /// Best times further out than this are not schedulable
    pub max_wait_hours: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            kind: Scheduler::General,
            priority_policy: PriorityPolicy::SoonestOnly,
            min_altitude: 30.0,
            max_sun_alt: -12.0,
            min_moon_separation: 10.0,
            samples: 1000,
            horizon_hours: 15.0,
            max_wait_hours: 12.0,
        }
    }
}

impl SchedulerConfig {
    pub fn horizon(&self) -> Duration {
        Duration::from_secs_f64(self.horizon_hours.max(0.0) * 3600.0)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs_f64(self.max_wait_hours.max(0.0) * 3600.0)
    }
}

/// How long until an observation should start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    Schedulable(Duration),
    Unschedulable,
}

impl Wait {
    pub fn is_schedulable(&self) -> bool {
        matches!(self, Wait::Schedulable(_))
    }

    pub fn duration(&self) -> Option<Duration> {
        match self {
            Wait::Schedulable(d) => Some(*d),
            Wait::Unschedulable => None,
        }
    }
}

/// An evaluated observation
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleEntry {
    pub observation: Observation,
    /// Time of highest constrained altitude
    pub best_time: Option<DateTime<Utc>>,
    /// Degrees
    pub max_altitude: Option<f64>,
    pub wait: Wait,
}

impl ScheduleEntry {
    fn unschedulable(observation: &Observation) -> Self {
        Self {
            observation: observation.clone(),
            best_time: None,
            max_altitude: None,
            wait: Wait::Unschedulable,
        }
    }
}

/// The interval a session may use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, time: DateTime<Utc>) -> bool {
        time >= self.start && time <= self.end
    }
}

/// Everything the scheduler needs to know about the sky
#[derive(Clone, Copy)]
pub struct Sky<'a> {
    pub ephemeris: &'a dyn Ephemeris,
    pub config: &'a SchedulerConfig,
    pub now: DateTime<Utc>,
}

/// Scheduling algorithm
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scheduler {
    #[default]
    General,
    Asteroid,
}

impl Scheduler {
    /// Choose the next observation, or `None` when nothing can be scheduled
    pub fn schedule(
        &self,
        pool: &[Observation],
        window: &Window,
        sky: &Sky<'_>,
    ) -> Option<ScheduleEntry> {
        match self {
            Scheduler::General => {
                let entries = pool.iter().map(|o| evaluate(o, window, sky)).collect();
                select(entries, sky.config.priority_policy)
            }
            Scheduler::Asteroid => pool.first().map(|observation| ScheduleEntry {
                observation: observation.clone(),
                best_time: Some(sky.now),
                max_altitude: observation
                    .offset_coordinates()
                    .map(|(ra, dec)| sky.ephemeris.altitude(ra, dec, sky.now)),
                wait: Wait::Schedulable(Duration::ZERO),
            }),
        }
    }
}

fn at_offset(now: DateTime<Utc>, seconds: f64) -> DateTime<Utc> {
    now + chrono::Duration::milliseconds((seconds * 1000.0).round() as i64)
}

/// Whether a target at (ra, dec) may be observed at `time`
fn observable(
    observation: &Observation,
    ra: f64,
    dec: f64,
    time: DateTime<Utc>,
    sky: &Sky<'_>,
) -> Option<f64> {
    let config = sky.config;
    let eph = sky.ephemeris;

    let altitude = eph.altitude(ra, dec, time);
    if altitude < config.min_altitude {
        return None;
    }
    if eph.sun_altitude(time) > config.max_sun_alt {
        return None;
    }
    if let Some(max_airmass) = observation.options.max_airmass {
        if ephemeris::airmass(altitude) > max_airmass {
            return None;
        }
    }

    let (moon_ra, moon_dec) = eph.moon_position(time);
    let min_separation = observation
        .options
        .min_moon_separation
        .unwrap_or(config.min_moon_separation);
    if ephemeris::angular_separation(ra, dec, moon_ra, moon_dec) < min_separation {
        return None;
    }
    if let Some(max_illumination) = observation.options.max_moon_illumination {
        let moon_up = eph.altitude(moon_ra, moon_dec, time) > 0.0;
        if moon_up && eph.moon_illumination(time) > max_illumination {
            return None;
        }
    }

    Some(altitude)
}

/// Evaluate one observation over the scheduling horizon
pub fn evaluate(observation: &Observation, window: &Window, sky: &Sky<'_>) -> ScheduleEntry {
    let Some((ra, dec)) = observation.offset_coordinates() else {
        debug!("{} has no coordinates; skipping", observation.target);
        return ScheduleEntry::unschedulable(observation);
    };

    let samples = sky.config.samples.max(2);
    let horizon = sky.config.horizon().as_secs_f64();
    let step = horizon / (samples - 1) as f64;

    let curve: Vec<Option<f64>> = (0..samples)
        .map(|i| observable(observation, ra, dec, at_offset(sky.now, i as f64 * step), sky))
        .collect();

    let best = curve
        .iter()
        .enumerate()
        .filter_map(|(i, alt)| alt.map(|a| (i, a)))
        .fold(None, |best: Option<(usize, f64)>, (i, a)| match best {
            Some((_, b)) if b >= a => best,
            _ => Some((i, a)),
        });

    let Some((index, sampled_altitude)) = best else {
        debug!("{} is never observable in the next {:.1}h", observation.target, horizon / 3600.0);
        return ScheduleEntry::unschedulable(observation);
    };

    // Refine between the neighbouring samples
    let lo = index.saturating_sub(1) as f64 * step;
    let hi = (index + 1).min(samples - 1) as f64 * step;
    let peak = refine_peak(lo, hi, |t| sky.ephemeris.altitude(ra, dec, at_offset(sky.now, t)));

    let (offset, max_altitude) =
        match observable(observation, ra, dec, at_offset(sky.now, peak), sky) {
            Some(altitude) if altitude >= sampled_altitude => (peak, altitude),
            _ => (index as f64 * step, sampled_altitude),
        };

    let best_time = at_offset(sky.now, offset);
    let wait = Duration::from_secs_f64(offset.round().max(0.0));

    let wait = if window.contains(best_time) && wait < sky.config.max_wait() {
        Wait::Schedulable(wait)
    } else {
        debug!(
            "{} peaks at {} outside the session window",
            observation.target, best_time
        );
        Wait::Unschedulable
    };

    ScheduleEntry {
        observation: observation.clone(),
        best_time: Some(best_time),
        max_altitude: Some(max_altitude),
        wait,
    }
}

/// Ternary search for the maximum of a unimodal function on [lo, hi],
/// to one second
fn refine_peak(mut lo: f64, mut hi: f64, f: impl Fn(f64) -> f64) -> f64 {
    while hi - lo > 1.0 {
        let m1 = lo + (hi - lo) / 3.0;
        let m2 = hi - (hi - lo) / 3.0;
        if f(m1) < f(m2) {
            lo = m1;
        } else {
            hi = m2;
        }
    }
    (lo + hi) / 2.0
}

/// Pick one schedulable entry according to the priority policy. Ties on
/// every criterion go to the entry seen first.
pub fn select(entries: Vec<ScheduleEntry>, policy: PriorityPolicy) -> Option<ScheduleEntry> {
    let mut chosen: Option<ScheduleEntry> = None;

    for entry in entries {
        let Some(wait) = entry.wait.duration() else {
            continue;
        };
        let better = match &chosen {
            None => true,
            Some(current) => {
                let current_wait = current.wait.duration().unwrap_or(Duration::MAX);
                let priority = entry.observation.options.priority;
                let current_priority = current.observation.options.priority;
                match policy {
                    PriorityPolicy::SoonestOnly => wait < current_wait,
                    PriorityPolicy::PriorityTieBreak => {
                        wait < current_wait || (wait == current_wait && priority > current_priority)
                    }
                    PriorityPolicy::PriorityFirst => {
                        priority > current_priority
                            || (priority == current_priority && wait < current_wait)
                    }
                }
            }
        };
        if better {
            chosen = Some(entry);
        }
    }

    chosen
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    /// Targets peak `ra` seconds after the origin; the sun stays down and
    /// the moon sits at the south pole
    struct PeakingSky {
        origin: DateTime<Utc>,
        sun_alt: f64,
        moon_illumination: f64,
    }

    impl PeakingSky {
        fn new(origin: DateTime<Utc>) -> Self {
            Self {
                origin,
                sun_alt: -30.0,
                moon_illumination: 0.0,
            }
        }
    }

    impl Ephemeris for PeakingSky {
        fn altitude(&self, ra: f64, dec: f64, time: DateTime<Utc>) -> f64 {
            if dec < -80.0 {
                // the moon
                return 45.0;
            }
            let peak = self.origin + chrono::Duration::seconds(ra as i64);
            let hours = (time - peak).num_milliseconds() as f64 / 3_600_000.0;
            80.0 - 10.0 * hours.abs()
        }

        fn sun_altitude(&self, _time: DateTime<Utc>) -> f64 {
            self.sun_alt
        }

        fn moon_position(&self, _time: DateTime<Utc>) -> (f64, f64) {
            (0.0, -89.0)
        }

        fn moon_illumination(&self, _time: DateTime<Utc>) -> f64 {
            self.moon_illumination
        }

        fn body_position(&self, _body: &str, _time: DateTime<Utc>) -> Option<(f64, f64)> {
            None
        }
    }

    fn origin() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 4, 0, 0).unwrap()
    }

    fn peaking(id: &str, seconds: f64) -> Observation {
        Observation {
            ra: Some(seconds),
            dec: Some(20.0),
            ..Observation::new(id, id)
        }
    }

    fn night() -> Window {
        Window::new(origin(), origin() + chrono::Duration::hours(12))
    }

    #[test]
    fn test_three_best_times_soonest_wins() {
        let eph = PeakingSky::new(origin());
        let config = SchedulerConfig::default();
        let sky = Sky {
            ephemeris: &eph,
            config: &config,
            now: origin(),
        };

        let pool = vec![peaking("late", 9999.0), peaking("soon", 10.0), peaking("mid", 300.0)];
        let entry = Scheduler::General.schedule(&pool, &night(), &sky).unwrap();

        assert_eq!(entry.observation.id, "soon");
        assert_eq!(entry.wait, Wait::Schedulable(Duration::from_secs(10)));
        assert!((entry.max_altitude.unwrap() - 80.0).abs() < 0.01);
    }

    #[test]
    fn test_best_time_is_refined_between_samples() {
        let eph = PeakingSky::new(origin());
        let config = SchedulerConfig::default();
        let sky = Sky {
            ephemeris: &eph,
            config: &config,
            now: origin(),
        };

        let entry = evaluate(&peaking("m", 9999.0), &night(), &sky);
        let Wait::Schedulable(wait) = entry.wait else {
            panic!("expected schedulable, got {:?}", entry.wait);
        };
        assert!((wait.as_secs() as i64 - 9999).abs() <= 1);
    }

    #[test]
    fn test_never_dark_is_unschedulable() {
        let mut eph = PeakingSky::new(origin());
        eph.sun_alt = 10.0;
        let config = SchedulerConfig::default();
        let sky = Sky {
            ephemeris: &eph,
            config: &config,
            now: origin(),
        };

        let entry = evaluate(&peaking("m", 10.0), &night(), &sky);
        assert_eq!(entry.wait, Wait::Unschedulable);
        assert!(Scheduler::General
            .schedule(&[peaking("m", 10.0)], &night(), &sky)
            .is_none());
    }

    #[test]
    fn test_outside_window_is_unschedulable() {
        let eph = PeakingSky::new(origin());
        let config = SchedulerConfig::default();
        let sky = Sky {
            ephemeris: &eph,
            config: &config,
            now: origin(),
        };
        let short = Window::new(origin(), origin() + chrono::Duration::minutes(30));

        let entry = evaluate(&peaking("m", 9999.0), &short, &sky);
        assert!(entry.best_time.is_some());
        assert_eq!(entry.wait, Wait::Unschedulable);
    }

    #[test]
    fn test_missing_coordinates_are_skipped() {
        let eph = PeakingSky::new(origin());
        let config = SchedulerConfig::default();
        let sky = Sky {
            ephemeris: &eph,
            config: &config,
            now: origin(),
        };

        let entry = evaluate(&Observation::new("x", "M31"), &night(), &sky);
        assert_eq!(entry.wait, Wait::Unschedulable);
        assert!(entry.best_time.is_none());
    }

    #[test]
    fn test_moon_illumination_limit() {
        let mut eph = PeakingSky::new(origin());
        eph.moon_illumination = 0.9;
        let config = SchedulerConfig::default();
        let sky = Sky {
            ephemeris: &eph,
            config: &config,
            now: origin(),
        };

        let mut dark_time = peaking("m", 10.0);
        dark_time.options.max_moon_illumination = Some(0.5);
        assert_eq!(evaluate(&dark_time, &night(), &sky).wait, Wait::Unschedulable);

        let any_time = peaking("n", 10.0);
        assert!(evaluate(&any_time, &night(), &sky).wait.is_schedulable());
    }

    #[test]
    fn test_airmass_limit_narrows_curve() {
        let eph = PeakingSky::new(origin());
        let config = SchedulerConfig::default();
        let sky = Sky {
            ephemeris: &eph,
            config: &config,
            now: origin(),
        };

        // Peak altitude 80 deg is airmass 1.015
        let mut strict = peaking("m", 300.0);
        strict.options.max_airmass = Some(1.01);
        assert_eq!(evaluate(&strict, &night(), &sky).wait, Wait::Unschedulable);

        strict.options.max_airmass = Some(1.5);
        assert!(evaluate(&strict, &night(), &sky).wait.is_schedulable());
    }

    fn entry(id: &str, wait: u64, priority: i32) -> ScheduleEntry {
        let mut observation = Observation::new(id, id);
        observation.options.priority = priority;
        ScheduleEntry {
            observation,
            best_time: None,
            max_altitude: None,
            wait: Wait::Schedulable(Duration::from_secs(wait)),
        }
    }

    fn chosen(entries: Vec<ScheduleEntry>, policy: PriorityPolicy) -> String {
        select(entries, policy).unwrap().observation.id
    }

    #[test]
    fn test_select_policies() {
        let pool = || vec![entry("a", 100, 1), entry("b", 100, 5), entry("c", 900, 9)];

        assert_eq!(chosen(pool(), PriorityPolicy::SoonestOnly), "a");
        assert_eq!(chosen(pool(), PriorityPolicy::PriorityTieBreak), "b");
        assert_eq!(chosen(pool(), PriorityPolicy::PriorityFirst), "c");
    }

    #[test]
    fn test_select_skips_unschedulable() {
        let mut blocked = entry("blocked", 0, 10);
        blocked.wait = Wait::Unschedulable;

        assert_eq!(
            chosen(vec![blocked.clone(), entry("ok", 50, 1)], PriorityPolicy::PriorityFirst),
            "ok"
        );
        assert!(select(vec![blocked], PriorityPolicy::SoonestOnly).is_none());
    }

    #[test]
    fn test_asteroid_takes_first_with_zero_wait() {
        let eph = PeakingSky::new(origin());
        let config = SchedulerConfig::default();
        let sky = Sky {
            ephemeris: &eph,
            config: &config,
            now: origin(),
        };

        let pool = vec![peaking("first", 9999.0), peaking("second", 10.0)];
        let entry = Scheduler::Asteroid.schedule(&pool, &night(), &sky).unwrap();
        assert_eq!(entry.observation.id, "first");
        assert_eq!(entry.wait, Wait::Schedulable(Duration::ZERO));
        assert!(Scheduler::Asteroid.schedule(&[], &night(), &sky).is_none());
    }

    #[test]
    fn test_scheduler_named_in_config() {
        let config: SchedulerConfig = serde_json::from_str(r#"{ "kind": "asteroid" }"#).unwrap();
        assert_eq!(config.kind, Scheduler::Asteroid);
        assert_eq!(SchedulerConfig::default().kind, Scheduler::General);
    }
}

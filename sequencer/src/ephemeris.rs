//! Low precision ephemeris
//!
//! Sun, Moon and planet positions good to a fraction of a degree, which is
//! plenty for scheduling around altitude and twilight limits.

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Observatory location
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Site {
    /// Degrees north
    pub latitude: f64,
    /// Degrees east
    pub longitude: f64,
    /// Meters
    pub elevation: f64,
}

impl Default for Site {
    fn default() -> Self {
        Self {
            latitude: 38.2886,
            longitude: -122.504,
            elevation: 75.0,
        }
    }
}

/// Positions and derived quantities needed by the scheduler.
/// Angles are degrees; RA/Dec are J2000-ish apparent positions.
pub trait Ephemeris: Send + Sync {
    fn altitude(&self, ra: f64, dec: f64, time: DateTime<Utc>) -> f64;

    fn sun_altitude(&self, time: DateTime<Utc>) -> f64;

    fn moon_position(&self, time: DateTime<Utc>) -> (f64, f64);

    /// Illuminated fraction of the lunar disk
    fn moon_illumination(&self, time: DateTime<Utc>) -> f64;

    /// RA/Dec of a named solar system body
    fn body_position(&self, body: &str, time: DateTime<Utc>) -> Option<(f64, f64)>;

    fn moon_altitude(&self, time: DateTime<Utc>) -> f64 {
        let (ra, dec) = self.moon_position(time);
        self.altitude(ra, dec, time)
    }
}

/// Calculate Julian Day from UTC datetime
pub fn julian_day(dt: DateTime<Utc>) -> f64 {
    let year = dt.year();
    let month = dt.month() as i32;
    let day = dt.day() as f64;
    let hour = dt.hour() as f64
        + dt.minute() as f64 / 60.0
        + (dt.second() as f64 + dt.nanosecond() as f64 * 1e-9) / 3600.0;

    let (y, m) = if month <= 2 {
        (year - 1, month + 12)
    } else {
        (year, month)
    };

    let a = (y as f64 / 100.0).floor();
    let b = 2.0 - a + (a / 4.0).floor();

    (365.25 * (y + 4716) as f64).floor() + (30.6001 * (m + 1) as f64).floor() + day + hour / 24.0 + b
        - 1524.5
}

/// Calculate Local Sidereal Time in hours
pub fn local_sidereal_time(jd: f64, longitude: f64) -> f64 {
    let t = (jd - 2451545.0) / 36525.0;

    // Greenwich Mean Sidereal Time
    let gmst = 280.46061837 + 360.98564736629 * (jd - 2451545.0) + 0.000387933 * t * t
        - t * t * t / 38710000.0;

    (gmst + longitude).rem_euclid(360.0) / 15.0
}

/// Altitude of RA/Dec (degrees) for a latitude and local sidereal time (hours)
pub fn altitude(ra: f64, dec: f64, latitude: f64, lst: f64) -> f64 {
    let ha_rad = (lst * 15.0 - ra).to_radians();
    let dec_rad = dec.to_radians();
    let lat_rad = latitude.to_radians();

    let sin_alt = lat_rad.sin() * dec_rad.sin() + lat_rad.cos() * dec_rad.cos() * ha_rad.cos();
    sin_alt.clamp(-1.0, 1.0).asin().to_degrees()
}

/// Plane-parallel airmass; infinite at or below the horizon
pub fn airmass(altitude: f64) -> f64 {
    if altitude <= 0.0 {
        return f64::INFINITY;
    }
    1.0 / altitude.to_radians().sin()
}

/// Great-circle distance between two positions, degrees
pub fn angular_separation(ra1: f64, dec1: f64, ra2: f64, dec2: f64) -> f64 {
    let (ra1, dec1, ra2, dec2) = (
        ra1.to_radians(),
        dec1.to_radians(),
        ra2.to_radians(),
        dec2.to_radians(),
    );
    let cos_sep = dec1.sin() * dec2.sin() + dec1.cos() * dec2.cos() * (ra1 - ra2).cos();
    cos_sep.clamp(-1.0, 1.0).acos().to_degrees()
}

const OBLIQUITY_J2000: f64 = 23.43928;

fn sin_deg(x: f64) -> f64 {
    x.to_radians().sin()
}

fn cos_deg(x: f64) -> f64 {
    x.to_radians().cos()
}

fn ecliptic_to_equatorial(x: f64, y: f64, z: f64, obliquity: f64) -> (f64, f64) {
    let xe = x;
    let ye = cos_deg(obliquity) * y - sin_deg(obliquity) * z;
    let ze = sin_deg(obliquity) * y + cos_deg(obliquity) * z;
    let ra = ye.atan2(xe).to_degrees().rem_euclid(360.0);
    let dec = ze.atan2((xe * xe + ye * ye).sqrt()).to_degrees();
    (ra, dec)
}

/// Sun RA/Dec
pub fn sun_position(jd: f64) -> (f64, f64) {
    let n = jd - 2451545.0;
    let l = 280.460 + 0.9856474 * n;
    let g = 357.528 + 0.9856003 * n;
    let lambda = l + 1.915 * sin_deg(g) + 0.020 * sin_deg(2.0 * g);
    let epsilon = 23.439 - 0.0000004 * n;

    ecliptic_to_equatorial(cos_deg(lambda), sin_deg(lambda), 0.0, epsilon)
}

/// Moon RA/Dec
pub fn moon_position(jd: f64) -> (f64, f64) {
    let t = (jd - 2451545.0) / 36525.0;

    let lambda = 218.32 + 481267.881 * t + 6.29 * sin_deg(135.0 + 477198.87 * t)
        - 1.27 * sin_deg(259.3 - 413335.36 * t)
        + 0.66 * sin_deg(235.7 + 890534.22 * t)
        + 0.21 * sin_deg(269.9 + 954397.74 * t)
        - 0.19 * sin_deg(357.5 + 35999.05 * t)
        - 0.11 * sin_deg(186.5 + 966404.03 * t);
    let beta = 5.13 * sin_deg(93.3 + 483202.02 * t) + 0.28 * sin_deg(228.2 + 960400.89 * t)
        - 0.28 * sin_deg(318.3 + 6003.15 * t)
        - 0.17 * sin_deg(217.6 - 407332.21 * t);

    ecliptic_to_equatorial(
        cos_deg(beta) * cos_deg(lambda),
        cos_deg(beta) * sin_deg(lambda),
        sin_deg(beta),
        OBLIQUITY_J2000,
    )
}

/// Illuminated fraction of the Moon from its elongation
pub fn moon_illumination(jd: f64) -> f64 {
    let (sun_ra, sun_dec) = sun_position(jd);
    let (moon_ra, moon_dec) = moon_position(jd);
    let elongation = angular_separation(sun_ra, sun_dec, moon_ra, moon_dec);
    (1.0 - cos_deg(elongation)) / 2.0
}

/// Keplerian elements and rates per century, valid 1800-2050
struct Elements {
    a: [f64; 2],
    e: [f64; 2],
    i: [f64; 2],
    l: [f64; 2],
    peri: [f64; 2],
    node: [f64; 2],
}

const EARTH_MOON_BARYCENTER: Elements = Elements {
    a: [1.00000261, 0.00000562],
    e: [0.01671123, -0.00004392],
    i: [-0.00001531, -0.01294668],
    l: [100.46457166, 35999.37244981],
    peri: [102.93768193, 0.32327364],
    node: [0.0, 0.0],
};

fn planet_elements(body: &str) -> Option<Elements> {
    let elements = match body {
        "mercury" => Elements {
            a: [0.38709927, 0.00000037],
            e: [0.20563593, 0.00001906],
            i: [7.00497902, -0.00594749],
            l: [252.25032350, 149472.67411175],
            peri: [77.45779628, 0.16047689],
            node: [48.33076593, -0.12534081],
        },
        "venus" => Elements {
            a: [0.72333566, 0.00000390],
            e: [0.00677672, -0.00004107],
            i: [3.39467605, -0.00078890],
            l: [181.97909950, 58517.81538729],
            peri: [131.60246718, 0.00268329],
            node: [76.67984255, -0.27769418],
        },
        "mars" => Elements {
            a: [1.52371034, 0.00001847],
            e: [0.09339410, 0.00007882],
            i: [1.84969142, -0.00813131],
            l: [-4.55343205, 19140.30268499],
            peri: [-23.94362959, 0.44441088],
            node: [49.55953891, -0.29257343],
        },
        "jupiter" => Elements {
            a: [5.20288700, -0.00011607],
            e: [0.04838624, -0.00013253],
            i: [1.30439695, -0.00183714],
            l: [34.39644051, 3034.74612775],
            peri: [14.72847983, 0.21252668],
            node: [100.47390909, 0.20469106],
        },
        "saturn" => Elements {
            a: [9.53667594, -0.00125060],
            e: [0.05386179, -0.00050991],
            i: [2.48599187, 0.00193609],
            l: [49.95424423, 1222.49362201],
            peri: [92.59887831, -0.41897216],
            node: [113.66242448, -0.28867794],
        },
        "uranus" => Elements {
            a: [19.18916464, -0.00196176],
            e: [0.04725744, -0.00004397],
            i: [0.77263783, -0.00242939],
            l: [313.23810451, 428.48202785],
            peri: [170.95427630, 0.40805281],
            node: [74.01692503, 0.04240589],
        },
        "neptune" => Elements {
            a: [30.06992276, 0.00026291],
            e: [0.00859048, 0.00005105],
            i: [1.77004347, 0.00035372],
            l: [-55.12002969, 218.45945325],
            peri: [44.96476227, -0.32241464],
            node: [131.78422574, -0.00508664],
        },
        "pluto" => Elements {
            a: [39.48211675, -0.00031596],
            e: [0.24882730, 0.00005170],
            i: [17.14001206, 0.00004818],
            l: [238.92903833, 145.20780515],
            peri: [224.06891629, -0.04062942],
            node: [110.30393684, -0.01183482],
        },
        _ => return None,
    };
    Some(elements)
}

/// Heliocentric ecliptic position in au
fn heliocentric(elements: &Elements, t: f64) -> (f64, f64, f64) {
    let at = |v: [f64; 2]| v[0] + v[1] * t;
    let a = at(elements.a);
    let e = at(elements.e);
    let i = at(elements.i);
    let l = at(elements.l);
    let peri = at(elements.peri);
    let node = at(elements.node);

    let omega = peri - node;
    let m = (l - peri).rem_euclid(360.0);
    let m = if m > 180.0 { m - 360.0 } else { m };

    // Kepler's equation, degrees
    let e_deg = e.to_degrees();
    let mut ecc = m + e_deg * sin_deg(m);
    for _ in 0..10 {
        let delta_m = m - (ecc - e_deg * sin_deg(ecc));
        let delta_e = delta_m / (1.0 - e * cos_deg(ecc));
        ecc += delta_e;
        if delta_e.abs() < 1e-8 {
            break;
        }
    }

    let xp = a * (cos_deg(ecc) - e);
    let yp = a * (1.0 - e * e).sqrt() * sin_deg(ecc);

    let (co, so) = (cos_deg(omega), sin_deg(omega));
    let (cn, sn) = (cos_deg(node), sin_deg(node));
    let (ci, si) = (cos_deg(i), sin_deg(i));

    (
        (co * cn - so * sn * ci) * xp + (-so * cn - co * sn * ci) * yp,
        (co * sn + so * cn * ci) * xp + (-so * sn + co * cn * ci) * yp,
        (so * si) * xp + (co * si) * yp,
    )
}

/// Geocentric RA/Dec of a planet or Pluto
pub fn planet_position(body: &str, jd: f64) -> Option<(f64, f64)> {
    let elements = planet_elements(body)?;
    let t = (jd - 2451545.0) / 36525.0;

    let (px, py, pz) = heliocentric(&elements, t);
    let (ex, ey, ez) = heliocentric(&EARTH_MOON_BARYCENTER, t);

    Some(ecliptic_to_equatorial(
        px - ex,
        py - ey,
        pz - ez,
        OBLIQUITY_J2000,
    ))
}

/// Ephemeris computed from the formulas above for one site
#[derive(Debug, Clone, Copy)]
pub struct LowPrecisionEphemeris {
    site: Site,
}

impl LowPrecisionEphemeris {
    pub fn new(site: Site) -> Self {
        Self { site }
    }

    pub fn site(&self) -> &Site {
        &self.site
    }
}

impl Ephemeris for LowPrecisionEphemeris {
    fn altitude(&self, ra: f64, dec: f64, time: DateTime<Utc>) -> f64 {
        let lst = local_sidereal_time(julian_day(time), self.site.longitude);
        altitude(ra, dec, self.site.latitude, lst)
    }

    fn sun_altitude(&self, time: DateTime<Utc>) -> f64 {
        let (ra, dec) = sun_position(julian_day(time));
        self.altitude(ra, dec, time)
    }

    fn moon_position(&self, time: DateTime<Utc>) -> (f64, f64) {
        moon_position(julian_day(time))
    }

    fn moon_illumination(&self, time: DateTime<Utc>) -> f64 {
        moon_illumination(julian_day(time))
    }

    fn body_position(&self, body: &str, time: DateTime<Utc>) -> Option<(f64, f64)> {
        let jd = julian_day(time);
        match body.trim().to_lowercase().as_str() {
            "moon" => Some(moon_position(jd)),
            other => planet_position(other, jd),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_julian_day_epoch() {
        let j2000 = Utc.with_ymd_and_hms(2000, 1, 1, 12, 0, 0).unwrap();
        assert!((julian_day(j2000) - 2451545.0).abs() < 1e-9);
    }

    #[test]
    fn test_zenith_transit() {
        let lst = 5.0;
        let alt = altitude(75.0, 38.0, 38.0, lst);
        assert!((alt - 90.0).abs() < 1e-6);

        let below = altitude(75.0 + 180.0, 38.0, 38.0, lst);
        assert!(below < 0.0);
    }

    #[test]
    fn test_airmass() {
        assert!((airmass(90.0) - 1.0).abs() < 1e-12);
        assert!((airmass(30.0) - 2.0).abs() < 1e-9);
        assert!(airmass(-5.0).is_infinite());
    }

    #[test]
    fn test_separation() {
        assert!((angular_separation(10.0, 0.0, 20.0, 0.0) - 10.0).abs() < 1e-9);
        assert!((angular_separation(0.0, 89.0, 180.0, 89.0) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_sun_declination_at_solstice() {
        let solstice = Utc.with_ymd_and_hms(2024, 6, 20, 20, 51, 0).unwrap();
        let (_, dec) = sun_position(julian_day(solstice));
        assert!((dec - 23.44).abs() < 0.05);
    }

    #[test]
    fn test_earth_orbit_matches_sun() {
        let time = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let jd = julian_day(time);
        let t = (jd - 2451545.0) / 36525.0;

        let (x, y, z) = heliocentric(&EARTH_MOON_BARYCENTER, t);
        let (ra, dec) = ecliptic_to_equatorial(-x, -y, -z, OBLIQUITY_J2000);
        let (sun_ra, sun_dec) = sun_position(jd);

        assert!(angular_separation(ra, dec, sun_ra, sun_dec) < 0.1);
    }

    #[test]
    fn test_moon_phases() {
        let full = Utc.with_ymd_and_hms(2024, 1, 25, 17, 54, 0).unwrap();
        let new = Utc.with_ymd_and_hms(2024, 1, 11, 11, 57, 0).unwrap();
        assert!(moon_illumination(julian_day(full)) > 0.97);
        assert!(moon_illumination(julian_day(new)) < 0.03);
    }

    #[test]
    fn test_body_lookup() {
        let eph = LowPrecisionEphemeris::new(Site::default());
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        for body in crate::target::SOLAR_SYSTEM_BODIES {
            let (ra, dec) = eph.body_position(body, now).unwrap();
            assert!((0.0..360.0).contains(&ra), "{} ra {}", body, ra);
            assert!(dec.abs() < 40.0, "{} dec {}", body, dec);
        }
        assert!(eph.body_position("vulcan", now).is_none());
    }
}

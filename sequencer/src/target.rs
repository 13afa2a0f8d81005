//! Target name resolution

use crate::error::{SessionError, SessionResult};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Bodies whose position comes from the ephemeris and that are never pinpointed
pub const SOLAR_SYSTEM_BODIES: [&str; 9] = [
    "mercury", "venus", "moon", "mars", "jupiter", "saturn", "uranus", "neptune", "pluto",
];

pub fn is_solar_system(target: &str) -> bool {
    let name = target.trim().to_lowercase();
    SOLAR_SYSTEM_BODIES.contains(&name.as_str())
}

fn sexagesimal_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^\s*(\d{1,2})[:hH\s]\s*(\d{1,2})[:mM\s]\s*(\d{1,2}(?:\.\d*)?)[sS]?\s+([+-]?)(\d{1,2})[:dD°\s]\s*(\d{1,2})[:mM'\s]\s*(\d{1,2}(?:\.\d*)?)[sS\x22]?\s*$",
        )
        .ok()
    })
    .as_ref()
}

/// Parse a literal position: "HH:MM:SS.s +DD:MM:SS" (RA in hours) or two
/// decimal numbers in degrees. Returns (RA, Dec) in degrees.
pub fn parse_coordinates(text: &str) -> Option<(f64, f64)> {
    if let Some(caps) = sexagesimal_re().and_then(|re| re.captures(text)) {
        let field = |i: usize| caps[i].parse::<f64>().ok();
        let hours = field(1)? + field(2)? / 60.0 + field(3)? / 3600.0;
        let degrees = field(5)? + field(6)? / 60.0 + field(7)? / 3600.0;
        let sign = if &caps[4] == "-" { -1.0 } else { 1.0 };

        let ra = hours * 15.0;
        let dec = sign * degrees;
        return (ra < 360.0 && dec.abs() <= 90.0).then_some((ra, dec));
    }

    let mut parts = text.split_whitespace();
    let ra: f64 = parts.next()?.parse().ok()?;
    let dec: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || !(0.0..360.0).contains(&ra) || dec.abs() > 90.0 {
        return None;
    }
    Some((ra, dec))
}

/// Converts catalog names into J2000 coordinates
#[async_trait]
pub trait TargetResolver: Send + Sync {
    async fn resolve(&self, name: &str) -> SessionResult<(f64, f64)>;
}

/// Resolver configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Sesame name resolver endpoint; the form-encoded name becomes its query
    pub sesame_url: String,
    pub timeout_secs: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            sesame_url: "https://cds.unistra.fr/cgi-bin/nph-sesame/-oI/A?".to_string(),
            timeout_secs: 30,
        }
    }
}

/// Resolves names through the CDS Sesame service
pub struct SesameResolver {
    client: reqwest::Client,
    base_url: Url,
}

impl SesameResolver {
    pub fn new(config: &ResolverConfig) -> SessionResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SessionError::Config(format!("failed to build HTTP client: {}", e)))?;
        let base_url = Url::parse(&config.sesame_url).map_err(|e| {
            SessionError::Config(format!("invalid Sesame URL {:?}: {}", config.sesame_url, e))
        })?;
        Ok(Self { client, base_url })
    }

    /// The query is the bare object name, form encoded
    fn query_url(&self, name: &str) -> Url {
        let query: String = url::form_urlencoded::byte_serialize(name.trim().as_bytes()).collect();
        let mut url = self.base_url.clone();
        url.set_query(Some(&query));
        url
    }

    fn parse_reply(name: &str, body: &str) -> SessionResult<(f64, f64)> {
        body.lines()
            .find_map(|line| {
                let rest = line.strip_prefix("%J")?;
                let mut values = rest.split_whitespace();
                let ra = values.next()?.parse().ok()?;
                let dec = values.next()?.parse().ok()?;
                Some((ra, dec))
            })
            .ok_or_else(|| SessionError::Lookup {
                target: name.to_string(),
                message: "name not found".to_string(),
            })
    }
}

#[async_trait]
impl TargetResolver for SesameResolver {
    async fn resolve(&self, name: &str) -> SessionResult<(f64, f64)> {
        let lookup_error = |message: String| SessionError::Lookup {
            target: name.to_string(),
            message,
        };

        let url = self.query_url(name);
        debug!("Resolving {} via {}", name, url);

        let body = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| lookup_error(e.to_string()))?
            .text()
            .await
            .map_err(|e| lookup_error(e.to_string()))?;

        Self::parse_reply(name, &body)
    }
}

/// Fixed name table, for offline runs and tests
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    entries: HashMap<String, (f64, f64)>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, ra: f64, dec: f64) -> Self {
        self.entries.insert(name.trim().to_lowercase(), (ra, dec));
        self
    }
}

#[async_trait]
impl TargetResolver for StaticResolver {
    async fn resolve(&self, name: &str) -> SessionResult<(f64, f64)> {
        self.entries
            .get(&name.trim().to_lowercase())
            .copied()
            .ok_or_else(|| SessionError::Lookup {
                target: name.to_string(),
                message: "name not in table".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn test_solar_system_names() {
        assert!(is_solar_system("Jupiter"));
        assert!(is_solar_system(" moon "));
        assert!(!is_solar_system("M31"));
        assert!(!is_solar_system("sun"));
    }

    #[test]
    fn test_parse_sexagesimal() {
        let (ra, dec) = parse_coordinates("00:42:44.33 +41:16:07.5").unwrap();
        assert!(close(ra, 10.684708333));
        assert!(close(dec, 41.26875));

        let (ra, dec) = parse_coordinates("05:35:17.3 -05:23:28").unwrap();
        assert!(close(ra, 83.822083333));
        assert!(close(dec, -5.391111111));
    }

    #[test]
    fn test_parse_decimal_degrees() {
        assert_eq!(parse_coordinates("10.68 41.27"), Some((10.68, 41.27)));
        assert_eq!(parse_coordinates("400 10"), None);
        assert_eq!(parse_coordinates("M31"), None);
        assert_eq!(parse_coordinates("NGC 6946"), None);
    }

    #[test]
    fn test_sesame_reply() {
        let body = "# M31\t#Q22453946\n#=V=VizieR(local):    1\n%J 10.68470833 +41.26875000 = 00:42:44.33 +41:16:07.5\n%V v -301.00 [4] 2000ApJS..126..423P\n";
        let (ra, dec) = SesameResolver::parse_reply("M31", body).unwrap();
        assert!(close(ra, 10.68470833));
        assert!(close(dec, 41.26875));

        let err = SesameResolver::parse_reply("Nowhere", "#! *** Nothing found ***").unwrap_err();
        assert_eq!(err.error_code(), "lookup");
    }

    #[test]
    fn test_sesame_query_is_encoded() {
        let resolver = SesameResolver::new(&ResolverConfig::default()).unwrap();

        let url = resolver.query_url(" M 42 ");
        assert_eq!(url.as_str(), "https://cds.unistra.fr/cgi-bin/nph-sesame/-oI/A?M+42");

        let url = resolver.query_url("NGC 1234+5 & #7");
        assert_eq!(url.query(), Some("NGC+1234%2B5+%26+%237"));

        let url = resolver.query_url("Barnard's Étoile");
        assert_eq!(url.query(), Some("Barnard%27s+%C3%89toile"));
    }

    #[test]
    fn test_invalid_sesame_url_rejected() {
        let config = ResolverConfig {
            sesame_url: "not a url".to_string(),
            ..ResolverConfig::default()
        };
        assert!(matches!(
            SesameResolver::new(&config),
            Err(SessionError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_static_resolver() {
        let resolver = StaticResolver::new().with("M 42", 83.82, -5.39);
        assert_eq!(resolver.resolve("m 42").await.unwrap(), (83.82, -5.39));
        assert!(resolver.resolve("M 1").await.is_err());
    }
}

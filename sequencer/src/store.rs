//! Queue store
//!
//! Observation requests, programs and scheduled sessions. The executor
//! only reads pending work and writes results; requests are created
//! elsewhere.

use crate::error::{SessionError, SessionResult};
use crate::target;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Program used when no session is scheduled
pub const GENERAL_PROGRAM: &str = "general";

/// Synthetic filter asking for dark frames
pub const DARK_FILTER: &str = "dark";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub name: String,
    pub email: String,
}

impl Owner {
    /// Short user name: the local part of the email
    pub fn user(&self) -> &str {
        self.email.split('@').next().unwrap_or(&self.email)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservationOptions {
    pub priority: i32,
    pub max_airmass: Option<f64>,
    /// Fraction of the lunar disk lit (0.0 - 1.0)
    pub max_moon_illumination: Option<f64>,
    /// Degrees; the scheduler default applies when unset
    pub min_moon_separation: Option<f64>,
    /// Arcseconds
    pub ra_offset: f64,
    /// Arcseconds
    pub dec_offset: f64,
}

impl Default for ObservationOptions {
    fn default() -> Self {
        Self {
            priority: 1,
            max_airmass: None,
            max_moon_illumination: None,
            min_moon_separation: None,
            ra_offset: 0.0,
            dec_offset: 0.0,
        }
    }
}

/// A pending imaging request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub id: String,
    #[serde(default = "general_program")]
    pub program: String,
    /// Catalog name or a literal "HH:MM:SS.s +DD:MM:SS" position
    pub target: String,
    /// Degrees, J2000
    #[serde(default)]
    pub ra: Option<f64>,
    #[serde(default)]
    pub dec: Option<f64>,
    pub exposure_time: f64,
    pub exposure_count: u32,
    #[serde(default = "default_binning")]
    pub binning: u32,
    pub filters: Vec<String>,
    #[serde(default)]
    pub options: ObservationOptions,
    #[serde(default)]
    pub owner: Owner,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub filenames: Vec<String>,
    #[serde(default)]
    pub exec_date: Option<DateTime<Utc>>,
}

fn general_program() -> String {
    GENERAL_PROGRAM.to_string()
}

fn default_binning() -> u32 {
    2
}

impl Observation {
    pub fn new(id: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            program: general_program(),
            target: target.into(),
            ra: None,
            dec: None,
            exposure_time: 60.0,
            exposure_count: 1,
            binning: default_binning(),
            filters: vec!["clear".to_string()],
            options: ObservationOptions::default(),
            owner: Owner::default(),
            completed: false,
            error: None,
            filenames: Vec::new(),
            exec_date: None,
        }
    }

    pub fn coordinates(&self) -> Option<(f64, f64)> {
        Some((self.ra?, self.dec?))
    }

    /// Coordinates with the requested offsets applied
    pub fn offset_coordinates(&self) -> Option<(f64, f64)> {
        let (ra, dec) = self.coordinates()?;
        Some((
            (ra + self.options.ra_offset / 3600.0).rem_euclid(360.0),
            dec + self.options.dec_offset / 3600.0,
        ))
    }

    pub fn wants_darks(&self) -> bool {
        self.filters.iter().any(|f| f == DARK_FILTER)
    }

    /// Requested filters with the dark marker removed
    pub fn science_filters(&self) -> impl Iterator<Item = &str> {
        self.filters
            .iter()
            .map(String::as_str)
            .filter(|f| *f != DARK_FILTER)
    }

    pub fn is_solar_system(&self) -> bool {
        target::is_solar_system(&self.target)
    }

    /// Still waiting to be observed
    pub fn is_pending(&self) -> bool {
        !self.completed && self.error.is_none()
    }
}

/// A reserved observing window for one program
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub program: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default)]
    pub owner: Owner,
}

impl Session {
    /// Fallback session covering every pending observation
    pub fn general(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            id: GENERAL_PROGRAM.to_string(),
            program: GENERAL_PROGRAM.to_string(),
            start,
            end,
            owner: Owner::default(),
        }
    }

    pub fn is_general(&self) -> bool {
        self.program == GENERAL_PROGRAM
    }
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Sessions overlapping `[start, end)`, earliest first
    async fn sessions_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> SessionResult<Vec<Session>>;

    /// Pending observations of one program
    async fn pending(&self, program: &str) -> SessionResult<Vec<Observation>>;

    /// Pending observations of every program
    async fn pending_all(&self) -> SessionResult<Vec<Observation>>;

    async fn get(&self, id: &str) -> SessionResult<Observation>;

    async fn insert(&self, observation: Observation) -> SessionResult<()>;

    async fn mark_completed(&self, id: &str, exec_date: DateTime<Utc>) -> SessionResult<()>;

    async fn mark_error(&self, id: &str, code: &str) -> SessionResult<()>;

    async fn append_filename(&self, id: &str, name: &str) -> SessionResult<()>;

    async fn set_coordinates(&self, id: &str, ra: f64, dec: f64) -> SessionResult<()>;
}

/// Serialized queue contents
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueData {
    #[serde(default)]
    pub sessions: Vec<Session>,
    #[serde(default)]
    pub observations: Vec<Observation>,
}

/// Queue store kept in memory and optionally mirrored to a JSON file
pub struct MemoryQueueStore {
    data: RwLock<QueueData>,
    path: Option<PathBuf>,
}

impl MemoryQueueStore {
    pub fn new(data: QueueData) -> Self {
        Self {
            data: RwLock::new(data),
            path: None,
        }
    }

    /// Load from a JSON file, starting empty if it does not exist. Every
    /// change is written back to the same file.
    pub async fn open(path: impl AsRef<Path>) -> SessionResult<Self> {
        let path = path.as_ref().to_path_buf();
        let data = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("Queue file {} not found; starting empty", path.display());
                QueueData::default()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            data: RwLock::new(data),
            path: Some(path),
        })
    }

    pub async fn snapshot(&self) -> QueueData {
        self.data.read().await.clone()
    }

    async fn save(&self, data: &QueueData) -> SessionResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_vec_pretty(data)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!("Saved queue to {}", path.display());
        Ok(())
    }

    async fn modify(&self, id: &str, f: impl FnOnce(&mut Observation)) -> SessionResult<()> {
        let mut data = self.data.write().await;
        let mut updated = data.clone();
        let observation = updated
            .observations
            .iter_mut()
            .find(|o| o.id == id)
            .ok_or_else(|| SessionError::Store(format!("unknown observation {}", id)))?;
        f(observation);
        self.save(&updated).await?;
        *data = updated;
        Ok(())
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn sessions_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> SessionResult<Vec<Session>> {
        let data = self.data.read().await;
        let mut sessions: Vec<Session> = data
            .sessions
            .iter()
            .filter(|s| s.start < end && s.end > start)
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.start);
        Ok(sessions)
    }

    async fn pending(&self, program: &str) -> SessionResult<Vec<Observation>> {
        if program == GENERAL_PROGRAM {
            return self.pending_all().await;
        }
        let data = self.data.read().await;
        Ok(data
            .observations
            .iter()
            .filter(|o| o.program == program && o.is_pending())
            .cloned()
            .collect())
    }

    async fn pending_all(&self) -> SessionResult<Vec<Observation>> {
        let data = self.data.read().await;
        Ok(data
            .observations
            .iter()
            .filter(|o| o.is_pending())
            .cloned()
            .collect())
    }

    async fn get(&self, id: &str) -> SessionResult<Observation> {
        let data = self.data.read().await;
        data.observations
            .iter()
            .find(|o| o.id == id)
            .cloned()
            .ok_or_else(|| SessionError::Store(format!("unknown observation {}", id)))
    }

    async fn insert(&self, observation: Observation) -> SessionResult<()> {
        let mut data = self.data.write().await;
        if data.observations.iter().any(|o| o.id == observation.id) {
            return Err(SessionError::Store(format!(
                "observation {} already exists",
                observation.id
            )));
        }
        let mut updated = data.clone();
        updated.observations.push(observation);
        self.save(&updated).await?;
        *data = updated;
        Ok(())
    }

    async fn mark_completed(&self, id: &str, exec_date: DateTime<Utc>) -> SessionResult<()> {
        self.modify(id, |o| {
            o.completed = true;
            o.exec_date = Some(exec_date);
        })
        .await
    }

    async fn mark_error(&self, id: &str, code: &str) -> SessionResult<()> {
        self.modify(id, |o| o.error = Some(code.to_string())).await
    }

    async fn append_filename(&self, id: &str, name: &str) -> SessionResult<()> {
        self.modify(id, |o| o.filenames.push(name.to_string())).await
    }

    async fn set_coordinates(&self, id: &str, ra: f64, dec: f64) -> SessionResult<()> {
        self.modify(id, |o| {
            o.ra = Some(ra);
            o.dec = Some(dec);
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn observation(id: &str, program: &str) -> Observation {
        Observation {
            program: program.to_string(),
            ..Observation::new(id, "M31")
        }
    }

    fn store() -> MemoryQueueStore {
        MemoryQueueStore::new(QueueData {
            sessions: Vec::new(),
            observations: vec![
                observation("a", "galaxies"),
                observation("b", "galaxies"),
                observation("c", "asteroids"),
            ],
        })
    }

    #[test]
    fn test_dark_marker_is_not_a_science_filter() {
        let obs = Observation {
            filters: vec!["r".to_string(), "dark".to_string(), "g".to_string()],
            ..Observation::new("a", "M31")
        };
        assert!(obs.wants_darks());
        assert_eq!(obs.science_filters().collect::<Vec<_>>(), vec!["r", "g"]);
    }

    #[test]
    fn test_offsets_are_arcseconds() {
        let obs = Observation {
            ra: Some(359.999),
            dec: Some(10.0),
            options: ObservationOptions {
                ra_offset: 36.0,
                dec_offset: -36.0,
                ..Default::default()
            },
            ..Observation::new("a", "M31")
        };
        let (ra, dec) = obs.offset_coordinates().unwrap();
        assert!((ra - 0.009).abs() < 1e-9);
        assert!((dec - 9.99).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_pending_by_program() {
        let store = store();
        assert_eq!(store.pending("galaxies").await.unwrap().len(), 2);
        assert_eq!(store.pending(GENERAL_PROGRAM).await.unwrap().len(), 3);

        store.mark_completed("a", Utc::now()).await.unwrap();
        store.mark_error("c", "lookup").await.unwrap();

        let pending = store.pending_all().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "b");

        let failed = store.get("c").await.unwrap();
        assert_eq!(failed.error.as_deref(), Some("lookup"));
    }

    #[tokio::test]
    async fn test_unknown_observation() {
        let store = store();
        let err = store.append_filename("zzz", "m31.fits").await.unwrap_err();
        assert!(matches!(err, SessionError::Store(_)));
    }

    #[tokio::test]
    async fn test_sessions_between_sorted() {
        let at = |h| Utc.with_ymd_and_hms(2024, 3, 1, h, 0, 0).unwrap();
        let session = |id: &str, start, end| Session {
            id: id.to_string(),
            program: "galaxies".to_string(),
            start,
            end,
            owner: Owner::default(),
        };
        let store = MemoryQueueStore::new(QueueData {
            sessions: vec![
                session("late", at(6), at(8)),
                session("early", at(2), at(4)),
                session("past", at(0), at(1)),
            ],
            observations: Vec::new(),
        });

        let found = store.sessions_between(at(1), at(12)).await.unwrap();
        let ids: Vec<_> = found.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["early", "late"]);
    }

    #[tokio::test]
    async fn test_json_file_round_trip() {
        let dir = std::env::temp_dir().join(format!("atlas-store-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("queue.json");

        let store = MemoryQueueStore::open(&path).await.unwrap();
        store.insert(observation("a", "galaxies")).await.unwrap();
        store.set_coordinates("a", 10.68, 41.27).await.unwrap();
        store.append_filename("a", "m31_r_0.fits").await.unwrap();

        let reopened = MemoryQueueStore::open(&path).await.unwrap();
        let obs = reopened.get("a").await.unwrap();
        assert_eq!(obs.coordinates(), Some((10.68, 41.27)));
        assert_eq!(obs.filenames, vec!["m31_r_0.fits"]);

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_save_leaves_memory_unchanged() {
        let dir = std::env::temp_dir().join(format!("atlas-store-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let store = MemoryQueueStore::open(dir.join("queue.json")).await.unwrap();
        store.insert(observation("a", "galaxies")).await.unwrap();

        tokio::fs::remove_dir_all(&dir).await.unwrap();

        assert!(store.mark_completed("a", Utc::now()).await.is_err());
        assert!(store.insert(observation("b", "galaxies")).await.is_err());

        let data = store.snapshot().await;
        assert_eq!(data.observations.len(), 1);
        assert!(!data.observations[0].completed);
        assert!(data.observations[0].exec_date.is_none());
    }
}

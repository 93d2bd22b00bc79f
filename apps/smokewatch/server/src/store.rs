use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use smokewatch_core::{AlertEvent, CameraId, CameraIdentity, CameraRecord};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::info;

use crate::error::CollaboratorError;

/// Camera registry consulted for token validation and liveness updates.
#[async_trait]
pub trait CameraStore: Send + Sync {
    /// Maps a capability token to the active camera it belongs to.
    async fn resolve_token(&self, token: &str)
        -> Result<Option<CameraIdentity>, CollaboratorError>;

    async fn camera(&self, camera_id: CameraId) -> Result<Option<CameraRecord>, CollaboratorError>;

    async fn set_online(
        &self,
        camera_id: CameraId,
        online: bool,
        at: OffsetDateTime,
    ) -> Result<(), CollaboratorError>;

    /// Records traffic from a streaming camera; also reasserts that it is online.
    async fn touch(&self, camera_id: CameraId, at: OffsetDateTime)
        -> Result<(), CollaboratorError>;
}

/// Persists alert events. Returns the identifier assigned to the stored detection.
#[async_trait]
pub trait DetectionStore: Send + Sync {
    async fn save(&self, event: &AlertEvent) -> Result<String, CollaboratorError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Liveness {
    pub online: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_seen: Option<OffsetDateTime>,
}

#[derive(Debug, Error)]
pub enum SeedError {
    #[error("failed to read camera seed {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid camera seed {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("api key of camera {camera_id} is already assigned to camera {owner}")]
    DuplicateToken { camera_id: CameraId, owner: CameraId },
    #[error("failed to write camera record: {0}")]
    Store(#[from] CollaboratorError),
}

/// Refuses a record whose token already belongs to a different camera.
pub fn ensure_token_owner(
    owner: Option<CameraId>,
    record: &CameraRecord,
) -> Result<(), SeedError> {
    match owner {
        Some(owner) if owner != record.id => Err(SeedError::DuplicateToken {
            camera_id: record.id,
            owner,
        }),
        _ => Ok(()),
    }
}

/// Reads a JSON array of camera records.
pub async fn read_seed(path: &Path) -> Result<Vec<CameraRecord>, SeedError> {
    let raw = tokio::fs::read(path).await.map_err(|source| SeedError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_slice(&raw).map_err(|source| SeedError::Json {
        path: path.display().to_string(),
        source,
    })
}

#[derive(Default)]
pub struct InMemoryCameraStore {
    cameras: DashMap<CameraId, CameraRecord>,
    tokens: DashMap<String, CameraId>,
    liveness: DashMap<CameraId, Liveness>,
}

impl InMemoryCameraStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn from_seed(path: &Path) -> Result<Arc<Self>, SeedError> {
        let store = Self::new();
        let records = read_seed(path).await?;
        let count = records.len();
        for record in records {
            store.insert(record)?;
        }
        info!(cameras = count, path = %path.display(), "camera seed loaded");
        Ok(store)
    }

    /// Adds or replaces a camera. A token may only belong to one camera.
    pub fn insert(&self, record: CameraRecord) -> Result<(), SeedError> {
        ensure_token_owner(
            self.tokens.get(&record.api_key).map(|entry| *entry.value()),
            &record,
        )?;
        if let Some(previous) = self.cameras.get(&record.id).map(|entry| entry.api_key.clone()) {
            self.tokens.remove(&previous);
        }
        self.tokens.insert(record.api_key.clone(), record.id);
        self.cameras.insert(record.id, record);
        Ok(())
    }

    /// Marks a camera inactive; its token stops validating for new sessions.
    pub fn deactivate(&self, camera_id: CameraId) -> bool {
        match self.cameras.get_mut(&camera_id) {
            Some(mut record) => {
                record.active = false;
                true
            }
            None => false,
        }
    }

    pub fn liveness(&self, camera_id: CameraId) -> Option<Liveness> {
        self.liveness.get(&camera_id).map(|entry| *entry.value())
    }
}

#[async_trait]
impl CameraStore for InMemoryCameraStore {
    async fn resolve_token(
        &self,
        token: &str,
    ) -> Result<Option<CameraIdentity>, CollaboratorError> {
        let Some(camera_id) = self.tokens.get(token).map(|entry| *entry.value()) else {
            return Ok(None);
        };
        Ok(self
            .cameras
            .get(&camera_id)
            .filter(|record| record.active)
            .map(|record| record.identity()))
    }

    async fn camera(&self, camera_id: CameraId) -> Result<Option<CameraRecord>, CollaboratorError> {
        Ok(self.cameras.get(&camera_id).map(|record| record.clone()))
    }

    async fn set_online(
        &self,
        camera_id: CameraId,
        online: bool,
        at: OffsetDateTime,
    ) -> Result<(), CollaboratorError> {
        self.liveness.insert(
            camera_id,
            Liveness {
                online,
                last_seen: Some(at),
            },
        );
        Ok(())
    }

    async fn touch(
        &self,
        camera_id: CameraId,
        at: OffsetDateTime,
    ) -> Result<(), CollaboratorError> {
        self.liveness
            .entry(camera_id)
            .and_modify(|liveness| {
                liveness.online = true;
                liveness.last_seen = Some(at);
            })
            .or_insert(Liveness {
                online: true,
                last_seen: Some(at),
            });
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryDetectionStore {
    next_id: AtomicU64,
    events: Mutex<Vec<(String, AlertEvent)>>,
}

impl InMemoryDetectionStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<(String, AlertEvent)> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

#[async_trait]
impl DetectionStore for InMemoryDetectionStore {
    async fn save(&self, event: &AlertEvent) -> Result<String, CollaboratorError> {
        let id = (self.next_id.fetch_add(1, Ordering::Relaxed) + 1).to_string();
        self.events.lock().push((id.clone(), event.clone()));
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smokewatch_core::{CameraKind, CameraSettings, SmokingVerdict};
    use time::macros::datetime;

    fn record(id: i64, api_key: &str) -> CameraRecord {
        CameraRecord {
            id: CameraId(id),
            name: format!("camera-{id}"),
            kind: CameraKind::Rtsp,
            source: "rtsp://cam/stream".into(),
            location: None,
            api_key: api_key.into(),
            active: true,
            settings: CameraSettings::default(),
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn tokens_resolve_only_for_active_cameras() {
        let store = InMemoryCameraStore::new();
        store.insert(record(1, "tok-1")).unwrap();

        let identity = store.resolve_token("tok-1").await.unwrap().unwrap();
        assert_eq!(identity.id, CameraId(1));
        assert!(store.resolve_token("nope").await.unwrap().is_none());

        assert!(store.deactivate(CameraId(1)));
        assert!(store.resolve_token("tok-1").await.unwrap().is_none());
    }

    #[test_timeout::tokio_timeout_test]
    async fn token_rotation_and_duplicates() {
        let store = InMemoryCameraStore::new();
        store.insert(record(1, "old")).unwrap();
        store.insert(record(1, "new")).unwrap();
        assert!(store.resolve_token("old").await.unwrap().is_none());
        assert!(store.resolve_token("new").await.unwrap().is_some());

        let err = store.insert(record(2, "new")).unwrap_err();
        assert!(matches!(err, SeedError::DuplicateToken { owner, .. } if owner == CameraId(1)));
    }

    #[test_timeout::tokio_timeout_test]
    async fn liveness_follows_writes() {
        let store = InMemoryCameraStore::new();
        let at = datetime!(2025-03-01 12:00:00 UTC);
        store.set_online(CameraId(3), true, at).await.unwrap();
        store
            .touch(CameraId(3), at + time::Duration::seconds(2))
            .await
            .unwrap();
        let liveness = store.liveness(CameraId(3)).unwrap();
        assert!(liveness.online);
        assert_eq!(liveness.last_seen, Some(at + time::Duration::seconds(2)));

        store.set_online(CameraId(3), false, at).await.unwrap();
        assert!(!store.liveness(CameraId(3)).unwrap().online);
    }

    #[test_timeout::tokio_timeout_test]
    async fn touch_brings_a_streaming_camera_back_online() {
        let store = InMemoryCameraStore::new();
        let at = datetime!(2025-03-01 12:00:00 UTC);
        // A late offline write from a closing session lands after the new session connected.
        store.set_online(CameraId(3), true, at).await.unwrap();
        store.set_online(CameraId(3), false, at).await.unwrap();

        store
            .touch(CameraId(3), at + time::Duration::seconds(1))
            .await
            .unwrap();
        let liveness = store.liveness(CameraId(3)).unwrap();
        assert!(liveness.online);
        assert_eq!(liveness.last_seen, Some(at + time::Duration::seconds(1)));
    }

    #[test_timeout::timeout]
    fn token_owner_must_match_record() {
        let record = record(2, "shared");
        assert!(ensure_token_owner(None, &record).is_ok());
        assert!(ensure_token_owner(Some(CameraId(2)), &record).is_ok());
        assert!(matches!(
            ensure_token_owner(Some(CameraId(1)), &record),
            Err(SeedError::DuplicateToken { camera_id, owner })
                if camera_id == CameraId(2) && owner == CameraId(1)
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn seed_file_loads_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cameras.json");
        let records = vec![record(1, "a"), record(2, "b")];
        std::fs::write(&path, serde_json::to_vec(&records).unwrap()).unwrap();

        let store = InMemoryCameraStore::from_seed(&path).await.unwrap();
        assert_eq!(
            store.camera(CameraId(2)).await.unwrap().unwrap().api_key,
            "b"
        );

        std::fs::write(&path, b"{not json").unwrap();
        assert!(matches!(
            InMemoryCameraStore::from_seed(&path).await,
            Err(SeedError::Json { .. })
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn detection_ids_are_sequential() {
        let store = InMemoryDetectionStore::new();
        let event = AlertEvent::new(
            CameraId(1),
            SmokingVerdict::default(),
            Vec::new(),
            datetime!(2025-03-01 12:00:00 UTC),
            None,
        );
        assert_eq!(store.save(&event).await.unwrap(), "1");
        assert_eq!(store.save(&event).await.unwrap(), "2");
        assert_eq!(store.len(), 2);
    }
}

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use smokewatch_core::{
    BoundingBox, CameraId, CameraIdentity, CameraKind, CameraRecord, CameraSettings,
    DetectedObject, DetectionThresholds, Frame,
};
use smokewatch_server::detector::Detector;
use smokewatch_server::screenshot::FsScreenshotStore;
use smokewatch_server::store::{CameraStore, InMemoryCameraStore, InMemoryDetectionStore};
use smokewatch_server::{Collaborators, CollaboratorError, SessionConfig};
use tempfile::TempDir;
use time::OffsetDateTime;

pub const SMOKING_FRAME: &[u8] = b"smoke";
pub const EMPTY_FRAME: &[u8] = b"empty";
pub const FAILING_FRAME: &[u8] = b"fail";

/// Sees a smoker in frames starting with `smoke`, nothing in other frames and fails on `fail`.
pub struct ScriptedDetector;

#[async_trait]
impl Detector for ScriptedDetector {
    async fn infer(
        &self,
        _camera_id: CameraId,
        frame: &Frame,
        _thresholds: DetectionThresholds,
    ) -> Result<Vec<DetectedObject>, CollaboratorError> {
        if frame.data.starts_with(FAILING_FRAME) {
            return Err(CollaboratorError::unavailable("detector", "connection refused"));
        }
        if frame.data.starts_with(SMOKING_FRAME) {
            return Ok(vec![
                DetectedObject::new("person", BoundingBox::new(100.0, 100.0, 300.0, 500.0), 0.8)
                    .with_track_id(1),
                DetectedObject::new("cigarette", BoundingBox::new(190.0, 150.0, 210.0, 160.0), 0.75)
                    .with_track_id(2),
            ]);
        }
        Ok(Vec::new())
    }
}

/// Camera store whose token lookups never finish.
pub struct HangingCameraStore;

#[async_trait]
impl CameraStore for HangingCameraStore {
    async fn resolve_token(
        &self,
        _token: &str,
    ) -> Result<Option<CameraIdentity>, CollaboratorError> {
        std::future::pending().await
    }

    async fn camera(&self, _camera_id: CameraId) -> Result<Option<CameraRecord>, CollaboratorError> {
        Ok(None)
    }

    async fn set_online(
        &self,
        _camera_id: CameraId,
        _online: bool,
        _at: OffsetDateTime,
    ) -> Result<(), CollaboratorError> {
        Ok(())
    }

    async fn touch(&self, _camera_id: CameraId, _at: OffsetDateTime) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

pub fn camera(id: i64, kind: CameraKind, api_key: &str) -> CameraRecord {
    CameraRecord {
        id: CameraId(id),
        name: format!("camera-{id}"),
        kind,
        source: match kind {
            CameraKind::Rtsp => format!("rtsp://10.0.0.{id}/stream"),
            _ => "0".to_string(),
        },
        location: Some("loading dock".into()),
        api_key: api_key.into(),
        active: true,
        settings: CameraSettings::default(),
    }
}

pub struct Fixture {
    pub cameras: Arc<InMemoryCameraStore>,
    pub detections: Arc<InMemoryDetectionStore>,
    pub screenshots: FsScreenshotStore,
    pub collaborators: Collaborators,
    pub dir: TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let cameras = InMemoryCameraStore::new();
        let detections = InMemoryDetectionStore::new();
        let screenshots = FsScreenshotStore::new(dir.path().join("screenshots"));
        let collaborators = Collaborators {
            cameras: cameras.clone(),
            detections: detections.clone(),
            detector: Arc::new(ScriptedDetector),
            screenshots: Arc::new(screenshots.clone()),
        };
        Self {
            cameras,
            detections,
            screenshots,
            collaborators,
            dir,
        }
    }

    pub fn with_camera(self, record: CameraRecord) -> Self {
        self.cameras.insert(record).unwrap();
        self
    }
}

pub fn session_config() -> SessionConfig {
    SessionConfig {
        validation_timeout: Duration::from_millis(500),
        idle_timeout: Duration::from_secs(5),
        ..SessionConfig::default()
    }
}

pub fn frame_message(data: &[u8]) -> String {
    serde_json::json!({ "type": "frame", "data": STANDARD.encode(data) }).to_string()
}

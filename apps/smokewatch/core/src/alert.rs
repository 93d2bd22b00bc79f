use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::camera::CameraId;
use crate::classifier::SmokingVerdict;
use crate::detection::DetectedObject;

/// A stable smoking detection for one camera.
///
/// Built once per stability firing and never modified afterwards; persistence and the
/// outbound alert message both read from the same event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    alert_id: Uuid,
    camera_id: CameraId,
    verdict: SmokingVerdict,
    boxes: Vec<DetectedObject>,
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
    screenshot: Option<String>,
}

impl AlertEvent {
    pub fn new(
        camera_id: CameraId,
        verdict: SmokingVerdict,
        boxes: Vec<DetectedObject>,
        timestamp: OffsetDateTime,
        screenshot: Option<String>,
    ) -> Self {
        Self {
            alert_id: Uuid::new_v4(),
            camera_id,
            verdict,
            boxes,
            timestamp,
            screenshot,
        }
    }

    pub fn alert_id(&self) -> Uuid {
        self.alert_id
    }

    pub fn camera_id(&self) -> CameraId {
        self.camera_id
    }

    pub fn verdict(&self) -> &SmokingVerdict {
        &self.verdict
    }

    pub fn boxes(&self) -> &[DetectedObject] {
        &self.boxes
    }

    pub fn timestamp(&self) -> OffsetDateTime {
        self.timestamp
    }

    /// Reference returned by the screenshot store, when a screenshot was taken.
    pub fn screenshot(&self) -> Option<&str> {
        self.screenshot.as_deref()
    }
}

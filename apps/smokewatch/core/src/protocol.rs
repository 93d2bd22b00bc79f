//! JSON messages exchanged on a camera upload session.
//!
//! Inbound frames are `{"type":"frame","data":"<base64 image>"}`; outbound messages use an
//! adjacent `type`/`data` envelope, e.g. `{"type":"detection_result","data":{...}}`.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::alert::AlertEvent;
use crate::camera::CameraId;
use crate::classifier::SmokingVerdict;
use crate::detection::DetectedObject;

/// Close reason sent when the capability token does not resolve to an active camera.
pub const CLOSE_REASON_UNAUTHORIZED: &str = "unauthorized";
/// Close reason sent when a session stays silent past the idle timeout.
pub const CLOSE_REASON_IDLE: &str = "idle timeout";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Frame { data: String },
    Ping,
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::InvalidMessage)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    DetectionResult(DetectionReport),
    Alert(AlertReport),
    Pong,
    Error { message: String },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::DetectionResult(_) => "detection_result",
            ServerMessage::Alert(_) => "alert",
            ServerMessage::Pong => "pong",
            ServerMessage::Error { .. } => "error",
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }
}

/// Result sent back for every processed frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionReport {
    #[serde(flatten)]
    pub verdict: SmokingVerdict,
    pub boxes: Vec<DetectedObject>,
}

/// Alert payload sent once per stability firing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertReport {
    pub alert_id: Uuid,
    pub camera_id: CameraId,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(default)]
    pub detection_id: Option<String>,
    #[serde(flatten)]
    pub verdict: SmokingVerdict,
    pub boxes: Vec<DetectedObject>,
    #[serde(default)]
    pub screenshot_path: Option<String>,
}

impl AlertReport {
    pub fn from_event(event: &AlertEvent, detection_id: Option<String>) -> Self {
        Self {
            alert_id: event.alert_id(),
            camera_id: event.camera_id(),
            timestamp: event.timestamp(),
            detection_id,
            verdict: event.verdict().clone(),
            boxes: event.boxes().to_vec(),
            screenshot_path: event.screenshot().map(str::to_string),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid client message: {0}")]
    InvalidMessage(serde_json::Error),
    #[error("failed to encode server message: {0}")]
    Encode(serde_json::Error),
}

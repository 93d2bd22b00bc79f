use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Stable identifier of a registered camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CameraId(pub i64);

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CameraId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(CameraId)
    }
}

impl From<i64> for CameraId {
    fn from(value: i64) -> Self {
        CameraId(value)
    }
}

/// How frames from a camera reach the service.
///
/// `Local` and `Usb` cameras push frames from a client running next to the device;
/// `Rtsp` sources have to be pulled by a supervised ingestion helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraKind {
    Local,
    Usb,
    Rtsp,
}

impl CameraKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CameraKind::Local => "local",
            CameraKind::Usb => "usb",
            CameraKind::Rtsp => "rtsp",
        }
    }

    /// Returns `true` when the source needs an ingestion helper process.
    pub fn requires_helper(&self) -> bool {
        matches!(self, CameraKind::Rtsp)
    }
}

/// Thresholds forwarded to the detector on every frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectionThresholds {
    #[serde(default = "default_confidence")]
    pub confidence: f32,
    #[serde(default = "default_iou")]
    pub iou: f32,
}

fn default_confidence() -> f32 {
    0.7
}

fn default_iou() -> f32 {
    0.5
}

impl Default for DetectionThresholds {
    fn default() -> Self {
        Self {
            confidence: default_confidence(),
            iou: default_iou(),
        }
    }
}

/// Per-camera detection settings and feature flags.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraSettings {
    #[serde(flatten)]
    pub thresholds: DetectionThresholds,
    #[serde(default = "enabled")]
    pub alert_enabled: bool,
    #[serde(default = "enabled")]
    pub screenshot_enabled: bool,
}

fn enabled() -> bool {
    true
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            thresholds: DetectionThresholds::default(),
            alert_enabled: true,
            screenshot_enabled: true,
        }
    }
}

/// Camera row as held by the camera store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraRecord {
    pub id: CameraId,
    pub name: String,
    pub kind: CameraKind,
    /// Device index for local/usb cameras, stream URI for rtsp.
    pub source: String,
    #[serde(default)]
    pub location: Option<String>,
    /// Capability token presented by the camera client.
    pub api_key: String,
    #[serde(default = "enabled")]
    pub active: bool,
    #[serde(default)]
    pub settings: CameraSettings,
}

impl CameraRecord {
    pub fn identity(&self) -> CameraIdentity {
        CameraIdentity {
            id: self.id,
            name: self.name.clone(),
            kind: self.kind,
            settings: self.settings,
        }
    }
}

/// Camera a capability token resolved to. Only ever built for active cameras.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraIdentity {
    pub id: CameraId,
    pub name: String,
    pub kind: CameraKind,
    pub settings: CameraSettings,
}

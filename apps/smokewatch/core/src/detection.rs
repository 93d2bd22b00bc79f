use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Axis-aligned box in frame pixel coordinates, `(x1, y1)` top-left and `(x2, y2)` bottom-right.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    /// Grows the box by `margin` on every side.
    pub fn expanded(&self, margin: f32) -> Self {
        Self {
            x1: self.x1 - margin,
            y1: self.y1 - margin,
            x2: self.x2 + margin,
            y2: self.y2 + margin,
        }
    }

    /// Inclusive point containment.
    pub fn contains(&self, x: f32, y: f32) -> bool {
        self.x1 <= x && x <= self.x2 && self.y1 <= y && y <= self.y2
    }
}

/// One labeled box reported by the detector for a single frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedObject {
    pub label: String,
    #[serde(flatten)]
    pub bbox: BoundingBox,
    pub confidence: f32,
    /// Tracker identity, when the detector runs with tracking enabled.
    #[serde(default)]
    pub track_id: Option<i64>,
}

impl DetectedObject {
    pub fn new(label: impl Into<String>, bbox: BoundingBox, confidence: f32) -> Self {
        Self {
            label: label.into(),
            bbox,
            confidence,
            track_id: None,
        }
    }

    pub fn with_track_id(mut self, track_id: i64) -> Self {
        self.track_id = Some(track_id);
        self
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.label.eq_ignore_ascii_case(label)
    }
}

/// Encoded image received from a camera session.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub received_at: OffsetDateTime,
}

impl Frame {
    pub fn new(data: Vec<u8>, received_at: OffsetDateTime) -> Self {
        Self { data, received_at }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

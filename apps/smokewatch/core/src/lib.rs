//! Shared primitives for the smokewatch camera service: camera records, detector output,
//! the smoking classifier, the per-camera stability filter and the session wire protocol.

pub mod alert;
pub mod camera;
pub mod classifier;
pub mod detection;
pub mod protocol;
pub mod stability;

pub use alert::AlertEvent;
pub use camera::{
    CameraId, CameraIdentity, CameraKind, CameraRecord, CameraSettings, DetectionThresholds,
};
pub use classifier::{classify, ClassifierConfig, SmokingPair, SmokingVerdict};
pub use detection::{BoundingBox, DetectedObject, Frame};
pub use protocol::{
    AlertReport, ClientMessage, DetectionReport, ProtocolError, ServerMessage,
    CLOSE_REASON_IDLE, CLOSE_REASON_UNAUTHORIZED,
};
pub use stability::{CooldownWindow, StabilityFilter, StabilityPolicy, StabilityState};

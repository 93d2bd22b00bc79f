use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use smokewatch_core::{CameraId, DetectedObject, DetectionThresholds, Frame};

use crate::error::CollaboratorError;

const COLLABORATOR: &str = "detector";

/// Object detection and tracking over single frames.
#[async_trait]
pub trait Detector: Send + Sync {
    async fn infer(
        &self,
        camera_id: CameraId,
        frame: &Frame,
        thresholds: DetectionThresholds,
    ) -> Result<Vec<DetectedObject>, CollaboratorError>;
}

/// Detector used when no detection service is configured; sees nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDetector;

#[async_trait]
impl Detector for NullDetector {
    async fn infer(
        &self,
        _camera_id: CameraId,
        _frame: &Frame,
        _thresholds: DetectionThresholds,
    ) -> Result<Vec<DetectedObject>, CollaboratorError> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Deserialize)]
struct InferResponse {
    #[serde(default)]
    objects: Vec<DetectedObject>,
}

/// Posts frames as multipart uploads to `<base_url>/infer`.
///
/// The service answers with `{"objects": [{"label", "x1", "y1", "x2", "y2", "confidence", "track_id"}]}`.
#[derive(Clone)]
pub struct HttpDetector {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpDetector {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/infer", base_url.trim_end_matches('/')),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn request_error(err: reqwest::Error) -> CollaboratorError {
    if err.is_timeout() {
        CollaboratorError::TimedOut {
            collaborator: COLLABORATOR,
        }
    } else {
        CollaboratorError::unavailable(COLLABORATOR, err)
    }
}

#[async_trait]
impl Detector for HttpDetector {
    async fn infer(
        &self,
        camera_id: CameraId,
        frame: &Frame,
        thresholds: DetectionThresholds,
    ) -> Result<Vec<DetectedObject>, CollaboratorError> {
        let image = Part::bytes(frame.data.clone())
            .file_name("frame.jpg")
            .mime_str("image/jpeg")
            .map_err(request_error)?;
        let form = Form::new()
            .part("image", image)
            .text("camera_id", camera_id.to_string())
            .text("confidence", thresholds.confidence.to_string())
            .text("iou", thresholds.iou.to_string());

        let response = self
            .client
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(request_error)?;
        if !response.status().is_success() {
            return Err(CollaboratorError::unavailable(
                COLLABORATOR,
                format!("inference failed with status {}", response.status()),
            ));
        }
        let body: InferResponse = response.json().await.map_err(|err| {
            if err.is_decode() {
                CollaboratorError::invalid_response(COLLABORATOR, err)
            } else {
                request_error(err)
            }
        })?;
        Ok(body.objects)
    }
}

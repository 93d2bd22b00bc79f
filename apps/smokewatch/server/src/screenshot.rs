use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use smokewatch_core::{CameraId, Frame};
use time::macros::format_description;
use time::OffsetDateTime;

use crate::error::CollaboratorError;

const COLLABORATOR: &str = "screenshot store";

/// Stores the frame that triggered an alert and returns a reference to it.
///
/// Frames arrive already JPEG encoded from the camera client, so the filesystem store
/// writes them as received.
#[async_trait]
pub trait ScreenshotStore: Send + Sync {
    async fn encode_and_store(
        &self,
        frame: &Frame,
        camera_id: CameraId,
        at: OffsetDateTime,
    ) -> Result<String, CollaboratorError>;
}

/// Writes `violation_<camera>_<YYYYmmdd_HHMMSS>.jpg` files into one directory.
#[derive(Debug, Clone)]
pub struct FsScreenshotStore {
    dir: PathBuf,
}

impl FsScreenshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

pub fn screenshot_filename(camera_id: CameraId, at: OffsetDateTime) -> String {
    let stamp = at
        .format(format_description!(
            "[year][month][day]_[hour][minute][second]"
        ))
        .unwrap_or_else(|_| at.unix_timestamp().to_string());
    format!("violation_{camera_id}_{stamp}.jpg")
}

/// Resolves a screenshot name inside `dir`, refusing anything but a plain file name.
pub fn resolve_screenshot(dir: &Path, filename: &str) -> Option<PathBuf> {
    let mut components = Path::new(filename).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(name)), None) => Some(dir.join(name)),
        _ => None,
    }
}

#[async_trait]
impl ScreenshotStore for FsScreenshotStore {
    async fn encode_and_store(
        &self,
        frame: &Frame,
        camera_id: CameraId,
        at: OffsetDateTime,
    ) -> Result<String, CollaboratorError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|err| CollaboratorError::unavailable(COLLABORATOR, err))?;
        let filename = screenshot_filename(camera_id, at);
        tokio::fs::write(self.dir.join(&filename), &frame.data)
            .await
            .map_err(|err| CollaboratorError::unavailable(COLLABORATOR, err))?;
        Ok(filename)
    }
}

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusHandle;
use thiserror::Error;
use tracing::info;

use crate::config::{ServerConfig, StoreBackend};
use crate::detector::{Detector, HttpDetector, NullDetector};
use crate::redis_store::RedisStore;
use crate::screenshot::FsScreenshotStore;
use crate::session::{Collaborators, SessionManager};
use crate::store::{read_seed, InMemoryCameraStore, InMemoryDetectionStore, SeedError};
use crate::supervisor::{HelperTemplate, ProcessSupervisor};

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    sessions: SessionManager,
    supervisor: ProcessSupervisor,
    helper: HelperTemplate,
    screenshot_dir: PathBuf,
    metrics: Option<PrometheusHandle>,
    started_at: Instant,
}

impl AppState {
    pub fn new(
        sessions: SessionManager,
        supervisor: ProcessSupervisor,
        helper: HelperTemplate,
        screenshot_dir: PathBuf,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                sessions,
                supervisor,
                helper,
                screenshot_dir,
                metrics,
                started_at: Instant::now(),
            }),
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.inner.sessions
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.inner.supervisor
    }

    pub fn helper(&self) -> &HelperTemplate {
        &self.inner.helper
    }

    pub fn screenshot_dir(&self) -> &Path {
        &self.inner.screenshot_dir
    }

    pub fn uptime_secs(&self) -> u64 {
        self.inner.started_at.elapsed().as_secs()
    }

    /// Prometheus text exposition; empty when no recorder is installed.
    pub fn render_metrics(&self) -> String {
        self.inner
            .metrics
            .as_ref()
            .map(PrometheusHandle::render)
            .unwrap_or_default()
    }
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Seed(#[from] SeedError),
    #[error("failed to connect to redis: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("failed to build detector client: {0}")]
    Detector(#[from] reqwest::Error),
}

/// Wires the stores, detector and screenshot directory selected by the configuration.
pub async fn build_collaborators(config: &ServerConfig) -> Result<Collaborators, BootstrapError> {
    let detector: Arc<dyn Detector> = match config.detector_url.as_deref() {
        Some(url) => {
            let detector = HttpDetector::new(url, config.detector_timeout)?;
            info!(endpoint = detector.endpoint(), "using http detector");
            Arc::new(detector)
        }
        None => {
            info!("no detector configured; frames are treated as empty");
            Arc::new(NullDetector)
        }
    };
    let screenshots = Arc::new(FsScreenshotStore::new(&config.screenshot_dir));

    match config.store {
        StoreBackend::Memory => {
            let cameras = match config.camera_seed.as_deref() {
                Some(path) => InMemoryCameraStore::from_seed(path).await?,
                None => InMemoryCameraStore::new(),
            };
            Ok(Collaborators {
                cameras,
                detections: InMemoryDetectionStore::new(),
                detector,
                screenshots,
            })
        }
        StoreBackend::Redis => {
            let store = Arc::new(RedisStore::connect(&config.redis_url).await?);
            if let Some(path) = config.camera_seed.as_deref() {
                let records = read_seed(path).await?;
                for record in &records {
                    store.register_camera(record).await?;
                }
                info!(cameras = records.len(), path = %path.display(), "camera seed written to redis");
            }
            Ok(Collaborators {
                cameras: store.clone(),
                detections: store,
                detector,
                screenshots,
            })
        }
    }
}

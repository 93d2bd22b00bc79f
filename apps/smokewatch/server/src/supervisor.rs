//! Supervision of RTSP ingestion helpers.
//!
//! One helper process per camera. Every camera gets its own async lock so concurrent
//! start/stop/status calls for the same camera are serialized while different cameras never
//! wait on each other. Helper stdout/stderr go to `<log_dir>/camera_<id>.log`, truncated on
//! every launch, so a helper that dies during its grace period can be diagnosed from the tail.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures_util::future::join_all;
use metrics::{counter, gauge};
use serde::Serialize;
use smokewatch_core::CameraId;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const LOG_TAIL_BYTES: usize = 4096;
pub const NO_OUTPUT_CAPTURED: &str = "<no output captured>";

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub log_dir: PathBuf,
    /// A helper still alive after this long is considered started.
    pub grace_period: Duration,
    /// Time a helper gets to exit after a termination request before it is killed.
    pub stop_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
            grace_period: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

/// Program and arguments of one helper launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

/// Builds helper launches that stream an RTSP source back into this server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperTemplate {
    pub program: PathBuf,
    pub base_args: Vec<String>,
    /// Websocket base URL, without a trailing slash.
    pub server_url: String,
}

impl HelperTemplate {
    pub fn launch_spec(&self, api_key: &str, source: &str) -> LaunchSpec {
        LaunchSpec::new(&self.program)
            .args(self.base_args.iter().cloned())
            .arg("--server")
            .arg(self.server_url.clone())
            .arg("--api-key")
            .arg(api_key)
            .arg("--type")
            .arg("rtsp")
            .arg("--source")
            .arg(source)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Starting,
    Running,
    Crashed,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StartOutcome {
    Started {
        pid: u32,
    },
    /// A live helper already existed; nothing was launched.
    #[serde(rename = "running")]
    AlreadyRunning {
        pid: u32,
    },
    /// The helper exited inside its grace period.
    Crashed {
        exit_code: Option<i32>,
        log: String,
    },
    #[serde(rename = "error")]
    LaunchFailed {
        message: String,
    },
}

impl StartOutcome {
    pub fn is_started(&self) -> bool {
        matches!(self, StartOutcome::Started { .. })
    }

    pub fn message(&self) -> String {
        match self {
            StartOutcome::Started { pid } => format!("ingestion started (pid {pid})"),
            StartOutcome::AlreadyRunning { pid } => {
                format!("ingestion already running (pid {pid})")
            }
            StartOutcome::Crashed { exit_code, .. } => match exit_code {
                Some(code) => format!("helper exited during startup with code {code}"),
                None => "helper was terminated by a signal during startup".to_string(),
            },
            StartOutcome::LaunchFailed { message } => message.clone(),
        }
    }

    fn metric_label(&self) -> &'static str {
        match self {
            StartOutcome::Started { .. } => "started",
            StartOutcome::AlreadyRunning { .. } => "already_running",
            StartOutcome::Crashed { .. } => "crashed",
            StartOutcome::LaunchFailed { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StopOutcome {
    /// `forced` is set when the helper ignored the termination request and was killed.
    Stopped { forced: bool },
    NotRunning,
    /// The helper had already exited on its own; its entry was purged.
    Crashed { exit_code: Option<i32> },
    #[serde(rename = "error")]
    Failed { message: String },
}

impl StopOutcome {
    pub fn message(&self) -> String {
        match self {
            StopOutcome::Stopped { forced: false } => "ingestion stopped".to_string(),
            StopOutcome::Stopped { forced: true } => {
                "ingestion helper did not exit in time and was killed".to_string()
            }
            StopOutcome::NotRunning => "ingestion not running".to_string(),
            StopOutcome::Crashed { exit_code } => match exit_code {
                Some(code) => format!("helper had already exited with code {code}"),
                None => "helper had already been terminated by a signal".to_string(),
            },
            StopOutcome::Failed { message } => message.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StatusReport {
    Running {
        pid: u32,
        uptime_secs: f64,
        #[serde(with = "time::serde::rfc3339")]
        started_at: OffsetDateTime,
    },
    NotRunning,
    Crashed {
        exit_code: Option<i32>,
    },
}

impl StatusReport {
    pub fn is_running(&self) -> bool {
        matches!(self, StatusReport::Running { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessSummary {
    pub camera_id: CameraId,
    #[serde(flatten)]
    pub report: StatusReport,
}

#[derive(Debug, Error)]
enum LaunchError {
    #[error("failed to prepare log file {path}: {source}")]
    LogSink {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to wait for helper: {0}")]
    Wait(#[source] std::io::Error),
}

/// Open handle on a helper's log file; closed when the helper's entry is dropped.
struct LogSink {
    path: PathBuf,
    _file: File,
}

impl LogSink {
    /// Truncates or creates the log file and returns it with two handles for the child.
    fn create(path: PathBuf) -> Result<(Self, Stdio, Stdio), LaunchError> {
        let sink_error = |source: std::io::Error| LaunchError::LogSink {
            path: path.display().to_string(),
            source,
        };
        let file = File::create(&path).map_err(sink_error)?;
        let stdout = file.try_clone().map_err(sink_error)?;
        let stderr = file.try_clone().map_err(sink_error)?;
        Ok((
            Self {
                path: path.clone(),
                _file: file,
            },
            Stdio::from(stdout),
            Stdio::from(stderr),
        ))
    }
}

impl Drop for LogSink {
    fn drop(&mut self) {
        debug!(path = %self.path.display(), "helper log closed");
    }
}

struct SupervisedProcess {
    child: Child,
    pid: u32,
    log: LogSink,
    started_at: Instant,
    started_wall: OffsetDateTime,
    status: ProcessStatus,
}

impl SupervisedProcess {
    /// Non-blocking exit check. Marks the entry crashed when the helper is gone.
    fn poll_exit(&mut self) -> Option<ExitStatus> {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.status = ProcessStatus::Crashed;
                Some(status)
            }
            Ok(None) => None,
            Err(err) => {
                warn!(pid = self.pid, error = %err, "failed to poll helper state");
                None
            }
        }
    }
}

type Slot = Arc<Mutex<Option<SupervisedProcess>>>;

/// A spawned helper: either alive after its grace period or already gone.
enum Launch {
    Running(SupervisedProcess),
    Exited {
        exit_code: Option<i32>,
        log_path: PathBuf,
    },
}

#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<SupervisorInner>,
}

struct SupervisorInner {
    config: SupervisorConfig,
    slots: DashMap<CameraId, Slot>,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                config,
                slots: DashMap::new(),
            }),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    pub fn log_path(&self, camera_id: CameraId) -> PathBuf {
        self.inner
            .config
            .log_dir
            .join(format!("camera_{camera_id}.log"))
    }

    fn slot(&self, camera_id: CameraId) -> Slot {
        let entry = self
            .inner
            .slots
            .entry(camera_id)
            .or_insert_with(|| Arc::new(Mutex::new(None)));
        Arc::clone(&*entry)
    }

    fn existing_slot(&self, camera_id: CameraId) -> Option<Slot> {
        self.inner
            .slots
            .get(&camera_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Forgets the camera's slot when it is empty and nobody else holds it. Runs under the
    /// map's shard lock, so no new holder can appear between the check and the removal.
    fn release_slot(&self, camera_id: CameraId) {
        self.inner.slots.remove_if(&camera_id, |_, slot| {
            Arc::strong_count(slot) == 1 && slot.try_lock().is_ok_and(|guard| guard.is_none())
        });
    }

    fn known_cameras(&self) -> Vec<CameraId> {
        let mut cameras: Vec<CameraId> = self.inner.slots.iter().map(|entry| *entry.key()).collect();
        cameras.sort();
        cameras
    }

    /// Launches a helper for `camera_id` unless a live one already exists.
    pub async fn start(&self, camera_id: CameraId, spec: &LaunchSpec) -> StartOutcome {
        let slot = self.slot(camera_id);
        let mut guard = slot.lock().await;

        if let Some(entry) = guard.as_mut() {
            match entry.poll_exit() {
                None => {
                    let outcome = StartOutcome::AlreadyRunning { pid: entry.pid };
                    record_start(camera_id, &outcome);
                    return outcome;
                }
                Some(status) => {
                    info!(
                        camera_id = %camera_id,
                        pid = entry.pid,
                        exit_code = ?status.code(),
                        "purging exited ingestion helper"
                    );
                    guard.take();
                }
            }
        }

        let outcome = match self.launch(camera_id, spec).await {
            Ok(Launch::Running(entry)) => {
                let pid = entry.pid;
                *guard = Some(entry);
                StartOutcome::Started { pid }
            }
            Ok(Launch::Exited {
                exit_code,
                log_path,
            }) => StartOutcome::Crashed {
                exit_code,
                log: read_log_tail(&log_path).await,
            },
            Err(err) => StartOutcome::LaunchFailed {
                message: err.to_string(),
            },
        };
        drop(guard);
        drop(slot);
        self.release_slot(camera_id);
        record_start(camera_id, &outcome);
        self.publish_running_gauge();
        outcome
    }

    async fn launch(&self, camera_id: CameraId, spec: &LaunchSpec) -> Result<Launch, LaunchError> {
        let log_path = self.log_path(camera_id);
        tokio::fs::create_dir_all(&self.inner.config.log_dir)
            .await
            .map_err(|source| LaunchError::LogSink {
                path: self.inner.config.log_dir.display().to_string(),
                source,
            })?;
        let (log, stdout, stderr) = LogSink::create(log_path.clone())?;

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true);
        let child = command.spawn().map_err(|source| LaunchError::Spawn {
            program: spec.program.display().to_string(),
            source,
        })?;
        let pid = child.id().unwrap_or_default();
        info!(
            camera_id = %camera_id,
            pid,
            program = %spec.program.display(),
            log = %log_path.display(),
            "ingestion helper launched"
        );

        let mut entry = SupervisedProcess {
            child,
            pid,
            log,
            started_at: Instant::now(),
            started_wall: OffsetDateTime::now_utc(),
            status: ProcessStatus::Starting,
        };

        match tokio::time::timeout(self.inner.config.grace_period, entry.child.wait()).await {
            Err(_) => {
                entry.status = ProcessStatus::Running;
                Ok(Launch::Running(entry))
            }
            Ok(Ok(status)) => {
                entry.status = ProcessStatus::Crashed;
                warn!(
                    camera_id = %camera_id,
                    pid,
                    exit_code = ?status.code(),
                    "ingestion helper exited during grace period"
                );
                drop(entry);
                Ok(Launch::Exited {
                    exit_code: status.code(),
                    log_path,
                })
            }
            Ok(Err(err)) => Err(LaunchError::Wait(err)),
        }
    }

    /// Asks the helper to exit, killing it once the stop timeout passes.
    pub async fn stop(&self, camera_id: CameraId) -> StopOutcome {
        let Some(slot) = self.existing_slot(camera_id) else {
            return StopOutcome::NotRunning;
        };
        let mut guard = slot.lock().await;
        let Some(mut entry) = guard.take() else {
            drop(guard);
            drop(slot);
            self.release_slot(camera_id);
            return StopOutcome::NotRunning;
        };

        let outcome = if let Some(status) = entry.poll_exit() {
            info!(
                camera_id = %camera_id,
                pid = entry.pid,
                exit_code = ?status.code(),
                "ingestion helper had already exited"
            );
            StopOutcome::Crashed {
                exit_code: status.code(),
            }
        } else {
            match terminate(&mut entry, self.inner.config.stop_timeout).await {
                Ok(forced) => {
                    entry.status = ProcessStatus::Stopped;
                    info!(
                        camera_id = %camera_id,
                        pid = entry.pid,
                        forced,
                        uptime_secs = entry.started_at.elapsed().as_secs(),
                        "ingestion helper stopped"
                    );
                    StopOutcome::Stopped { forced }
                }
                Err(err) => {
                    warn!(camera_id = %camera_id, pid = entry.pid, error = %err, "failed to stop ingestion helper");
                    StopOutcome::Failed {
                        message: format!("failed to stop helper: {err}"),
                    }
                }
            }
        };
        drop(entry);
        drop(guard);
        drop(slot);
        self.release_slot(camera_id);
        self.publish_running_gauge();
        outcome
    }

    /// Reports a helper's state, purging the entry when the helper has exited.
    pub async fn status(&self, camera_id: CameraId) -> StatusReport {
        let Some(slot) = self.existing_slot(camera_id) else {
            return StatusReport::NotRunning;
        };
        let mut guard = slot.lock().await;
        let Some(entry) = guard.as_mut() else {
            drop(guard);
            drop(slot);
            self.release_slot(camera_id);
            return StatusReport::NotRunning;
        };

        if let Some(status) = entry.poll_exit() {
            info!(
                camera_id = %camera_id,
                pid = entry.pid,
                exit_code = ?status.code(),
                log = %entry.log.path.display(),
                "ingestion helper exited unexpectedly"
            );
            guard.take();
            drop(guard);
            drop(slot);
            self.release_slot(camera_id);
            return StatusReport::Crashed {
                exit_code: status.code(),
            };
        }

        StatusReport::Running {
            pid: entry.pid,
            uptime_secs: entry.started_at.elapsed().as_secs_f64(),
            started_at: entry.started_wall,
        }
    }

    /// Status of every camera that currently has a helper entry.
    pub async fn list(&self) -> Vec<ProcessSummary> {
        let mut summaries = Vec::new();
        for camera_id in self.known_cameras() {
            let report = self.status(camera_id).await;
            if report != StatusReport::NotRunning {
                summaries.push(ProcessSummary { camera_id, report });
            }
        }
        summaries
    }

    /// Stops every helper concurrently. Used on shutdown.
    pub async fn stop_all(&self) -> Vec<(CameraId, StopOutcome)> {
        let cameras = self.known_cameras();
        let outcomes = join_all(cameras.iter().map(|camera_id| self.stop(*camera_id))).await;
        cameras
            .into_iter()
            .zip(outcomes)
            .filter(|(_, outcome)| *outcome != StopOutcome::NotRunning)
            .collect()
    }

    /// Busy slots are skipped; the gauge is refreshed again once their operation finishes.
    fn publish_running_gauge(&self) {
        let slots: Vec<Slot> = self
            .inner
            .slots
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let running = slots
            .iter()
            .filter_map(|slot| slot.try_lock().ok())
            .filter(|guard| {
                guard
                    .as_ref()
                    .is_some_and(|entry| entry.status == ProcessStatus::Running)
            })
            .count();
        gauge!("smokewatch_ingest_helpers_running", running as f64);
    }
}

fn record_start(camera_id: CameraId, outcome: &StartOutcome) {
    counter!(
        "smokewatch_ingest_launches_total",
        1,
        "outcome" => outcome.metric_label()
    );
    match outcome {
        StartOutcome::Started { .. } | StartOutcome::AlreadyRunning { .. } => {
            debug!(camera_id = %camera_id, outcome = outcome.metric_label(), "ingest start handled")
        }
        StartOutcome::Crashed { .. } | StartOutcome::LaunchFailed { .. } => {
            warn!(camera_id = %camera_id, outcome = outcome.metric_label(), message = %outcome.message(), "ingest start failed")
        }
    }
}

/// Returns `true` when the helper had to be killed.
async fn terminate(entry: &mut SupervisedProcess, stop_timeout: Duration) -> std::io::Result<bool> {
    if request_exit(&entry.child) {
        match tokio::time::timeout(stop_timeout, entry.child.wait()).await {
            Ok(Ok(_)) => return Ok(false),
            Ok(Err(err)) => {
                warn!(pid = entry.pid, error = %err, "failed waiting for helper; killing");
            }
            Err(_) => {
                warn!(
                    pid = entry.pid,
                    timeout_secs = stop_timeout.as_secs_f64(),
                    "helper ignored termination request; killing"
                );
            }
        }
    }
    entry.child.kill().await?;
    Ok(true)
}

#[cfg(unix)]
fn request_exit(child: &Child) -> bool {
    let Some(pid) = child.id() else {
        return false;
    };
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: `pid` is a child we spawned and have not reaped yet (`id()` returned Some).
    unsafe { libc::kill(pid, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
fn request_exit(_child: &Child) -> bool {
    false
}

/// Last few KiB of a helper log, decoded lossily.
pub async fn read_log_tail(path: &Path) -> String {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let start = bytes.len().saturating_sub(LOG_TAIL_BYTES);
            let tail = String::from_utf8_lossy(&bytes[start..]);
            let tail = tail.trim();
            if tail.is_empty() {
                NO_OUTPUT_CAPTURED.to_string()
            } else {
                tail.to_string()
            }
        }
        Err(err) => format!("unable to read {}: {err}", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn helper_launch_appends_session_arguments() {
        let template = HelperTemplate {
            program: PathBuf::from("python3"),
            base_args: vec!["client/camera_client.py".into()],
            server_url: "ws://127.0.0.1:8000".into(),
        };
        let spec = template.launch_spec("key-1", "rtsp://cam/1");
        assert_eq!(spec.program, PathBuf::from("python3"));
        assert_eq!(
            spec.args,
            vec![
                "client/camera_client.py",
                "--server",
                "ws://127.0.0.1:8000",
                "--api-key",
                "key-1",
                "--type",
                "rtsp",
                "--source",
                "rtsp://cam/1",
            ]
        );
    }

    #[test_timeout::timeout]
    fn outcomes_serialize_with_status_tag() {
        let started = serde_json::to_value(StartOutcome::Started { pid: 42 }).unwrap();
        assert_eq!(started["status"], "started");
        assert_eq!(started["pid"], 42);

        let running = serde_json::to_value(StartOutcome::AlreadyRunning { pid: 42 }).unwrap();
        assert_eq!(running["status"], "running");

        let failed = serde_json::to_value(StartOutcome::LaunchFailed {
            message: "nope".into(),
        })
        .unwrap();
        assert_eq!(failed["status"], "error");

        let stopped = serde_json::to_value(StopOutcome::NotRunning).unwrap();
        assert_eq!(stopped["status"], "not_running");

        let summary = serde_json::to_value(ProcessSummary {
            camera_id: CameraId(3),
            report: StatusReport::Crashed { exit_code: Some(3) },
        })
        .unwrap();
        assert_eq!(summary["camera_id"], 3);
        assert_eq!(summary["status"], "crashed");
        assert_eq!(summary["exit_code"], 3);
    }

    #[test_timeout::tokio_timeout_test]
    async fn log_tail_is_bounded_and_never_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("camera_1.log");

        tokio::fs::write(&path, b"").await.unwrap();
        assert_eq!(read_log_tail(&path).await, NO_OUTPUT_CAPTURED);

        let mut content = "x".repeat(10_000).into_bytes();
        content.extend_from_slice(b"\nlast line\n");
        tokio::fs::write(&path, &content).await.unwrap();
        let tail = read_log_tail(&path).await;
        assert!(tail.len() <= LOG_TAIL_BYTES);
        assert!(tail.ends_with("last line"));

        assert!(read_log_tail(&dir.path().join("missing.log"))
            .await
            .starts_with("unable to read"));
    }

    #[cfg(unix)]
    #[test_timeout::tokio_timeout_test(20)]
    async fn purged_helpers_leave_no_slot_behind() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = ProcessSupervisor::new(SupervisorConfig {
            log_dir: dir.path().join("logs"),
            grace_period: Duration::from_millis(200),
            stop_timeout: Duration::from_secs(2),
        });
        let crashing = LaunchSpec::new("sh").arg("-c").arg("exit 2");
        let long_running = LaunchSpec::new("sh").arg("-c").arg("exec sleep 30");

        assert!(matches!(
            supervisor.start(CameraId(1), &crashing).await,
            StartOutcome::Crashed { .. }
        ));
        assert!(supervisor.start(CameraId(2), &long_running).await.is_started());
        assert_eq!(supervisor.stop(CameraId(3)).await, StopOutcome::NotRunning);
        assert_eq!(supervisor.known_cameras(), vec![CameraId(2)]);

        assert!(matches!(
            supervisor.stop(CameraId(2)).await,
            StopOutcome::Stopped { .. }
        ));
        assert!(supervisor.known_cameras().is_empty());
        assert!(supervisor.stop_all().await.is_empty());
    }
}

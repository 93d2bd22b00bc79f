use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use dashmap::{mapref::entry::Entry, DashMap};
use futures_util::{Stream, StreamExt};
use metrics::{counter, gauge};
use serde::Serialize;
use smokewatch_core::{
    classify, AlertEvent, AlertReport, CameraId, CameraIdentity, ClassifierConfig, ClientMessage,
    CooldownWindow, DetectedObject, DetectionReport, Frame, ServerMessage, SmokingVerdict, StabilityFilter,
    StabilityPolicy, CLOSE_REASON_IDLE, CLOSE_REASON_UNAUTHORIZED,
};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::detector::Detector;
use crate::error::{CollaboratorError, FrameError, SessionError, TransportError};
use crate::screenshot::ScreenshotStore;
use crate::store::{CameraStore, DetectionStore};

const DEFAULT_OUTBOUND_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Upper bound on resolving the capability token; expiry counts as unauthorized.
    pub validation_timeout: Duration,
    /// A streaming session with no inbound traffic for this long is closed.
    pub idle_timeout: Duration,
    pub outbound_buffer: usize,
    pub stability: StabilityPolicy,
    pub classifier: ClassifierConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            validation_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(120),
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            stability: StabilityPolicy::default(),
            classifier: ClassifierConfig::default(),
        }
    }
}

/// External services a session talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub cameras: Arc<dyn CameraStore>,
    pub detections: Arc<dyn DetectionStore>,
    pub detector: Arc<dyn Detector>,
    pub screenshots: Arc<dyn ScreenshotStore>,
}

/// Transport-neutral inbound traffic of one session.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Text(String),
    Binary(Vec<u8>),
    /// Transport keepalive; only resets the idle timer.
    Ping,
    Close(Option<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(ServerMessage),
    /// Ends the session with a policy close carrying `reason`.
    Close { reason: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Connecting,
    Validating,
    Streaming,
    Closed,
    Crashed,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Connecting => "connecting",
            SessionPhase::Validating => "validating",
            SessionPhase::Streaming => "streaming",
            SessionPhase::Closed => "closed",
            SessionPhase::Crashed => "crashed",
        }
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub connection_id: Uuid,
    /// `None` when the token was rejected.
    pub camera_id: Option<CameraId>,
    pub phase: SessionPhase,
    pub frames_processed: u64,
    pub alerts_fired: u64,
}

impl SessionSummary {
    fn new(connection_id: Uuid) -> Self {
        Self {
            connection_id,
            camera_id: None,
            phase: SessionPhase::Connecting,
            frames_processed: 0,
            alerts_fired: 0,
        }
    }

    fn advance(&mut self, phase: SessionPhase) {
        debug!(
            connection_id = %self.connection_id,
            from = self.phase.as_str(),
            to = phase.as_str(),
            "session phase change"
        );
        self.phase = phase;
    }
}

#[derive(Debug, Clone)]
struct CameraPresence {
    connections: usize,
    connected_at: OffsetDateTime,
    last_frame_at: Option<OffsetDateTime>,
    frames_processed: u64,
    alerts_fired: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CameraSessionSnapshot {
    pub camera_id: CameraId,
    pub connections: usize,
    #[serde(with = "time::serde::rfc3339")]
    pub connected_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_frame_at: Option<OffsetDateTime>,
    pub frames_processed: u64,
    pub alerts_fired: u64,
}

/// Live sessions per camera. A camera stays listed while at least one session is streaming.
///
/// Alert cooldowns are tracked per camera and outlive the sessions, so neither a second
/// concurrent stream nor a reconnect can alert inside an open window.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    cameras: Arc<DashMap<CameraId, CameraPresence>>,
    cooldowns: Arc<DashMap<CameraId, CooldownWindow>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of live sessions for the camera after registering this one.
    pub fn register(&self, camera_id: CameraId, now: OffsetDateTime) -> usize {
        let mut presence = self.cameras.entry(camera_id).or_insert_with(|| CameraPresence {
            connections: 0,
            connected_at: now,
            last_frame_at: None,
            frames_processed: 0,
            alerts_fired: 0,
        });
        presence.connections += 1;
        presence.connections
    }

    /// Returns the number of live sessions left for the camera.
    pub fn unregister(&self, camera_id: CameraId) -> usize {
        match self.cameras.entry(camera_id) {
            Entry::Occupied(mut entry) => {
                let remaining = entry.get().connections.saturating_sub(1);
                if remaining == 0 {
                    entry.remove();
                } else {
                    entry.get_mut().connections = remaining;
                }
                remaining
            }
            Entry::Vacant(_) => 0,
        }
    }

    pub fn record_frame(&self, camera_id: CameraId, at: OffsetDateTime) {
        if let Some(mut presence) = self.cameras.get_mut(&camera_id) {
            presence.frames_processed += 1;
            presence.last_frame_at = Some(at);
        }
    }

    pub fn record_alert(&self, camera_id: CameraId) {
        if let Some(mut presence) = self.cameras.get_mut(&camera_id) {
            presence.alerts_fired += 1;
        }
    }

    /// Takes the camera's alert window at `now` if `cooldown` has passed since its last alert.
    /// Check and update happen under the entry's shard lock.
    pub fn try_claim_alert(&self, camera_id: CameraId, now: Instant, cooldown: Duration) -> bool {
        self.cooldowns
            .entry(camera_id)
            .or_default()
            .try_claim(now, cooldown)
    }

    pub fn connections(&self, camera_id: CameraId) -> usize {
        self.cameras
            .get(&camera_id)
            .map(|presence| presence.connections)
            .unwrap_or(0)
    }

    pub fn active_connections(&self) -> usize {
        self.cameras.iter().map(|entry| entry.connections).sum()
    }

    pub fn snapshot(&self) -> Vec<CameraSessionSnapshot> {
        let mut cameras: Vec<CameraSessionSnapshot> = self
            .cameras
            .iter()
            .map(|entry| CameraSessionSnapshot {
                camera_id: *entry.key(),
                connections: entry.connections,
                connected_at: entry.connected_at,
                last_frame_at: entry.last_frame_at,
                frames_processed: entry.frames_processed,
                alerts_fired: entry.alerts_fired,
            })
            .collect();
        cameras.sort_by_key(|snapshot| snapshot.camera_id);
        cameras
    }
}

/// Accepts raw base64 or a `data:<mime>;base64,` URL.
pub fn decode_frame_payload(data: &str) -> Result<Vec<u8>, FrameError> {
    let encoded = match data.split_once(";base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => data,
    };
    let bytes = STANDARD.decode(encoded.trim())?;
    if bytes.is_empty() {
        return Err(FrameError::Empty);
    }
    Ok(bytes)
}

/// Runs camera upload sessions: token validation, per-frame detection and alerting.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionShared>,
}

struct SessionShared {
    config: SessionConfig,
    collaborators: Collaborators,
    registry: SessionRegistry,
}

impl SessionManager {
    pub fn new(config: SessionConfig, collaborators: Collaborators) -> Self {
        Self {
            inner: Arc::new(SessionShared {
                config,
                collaborators,
                registry: SessionRegistry::new(),
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.inner.collaborators
    }

    /// Drives one session to completion.
    ///
    /// `outbound` receives every message for the peer; a rejected or idle session ends with
    /// an [`Outbound::Close`]. Returns once the session is closed and its camera bookkeeping
    /// has been released.
    pub async fn run<S>(
        &self,
        token: &str,
        inbound: S,
        outbound: mpsc::Sender<Outbound>,
    ) -> SessionSummary
    where
        S: Stream<Item = Result<Inbound, TransportError>> + Unpin + Send,
    {
        let mut summary = SessionSummary::new(Uuid::new_v4());
        let connection_id = summary.connection_id;

        summary.advance(SessionPhase::Validating);
        let identity = match self.validate(token).await {
            Ok(identity) => identity,
            Err(err) => {
                counter!("smokewatch_sessions_rejected_total", 1, "reason" => err.metric_label());
                warn!(connection_id = %connection_id, error = %err, "session rejected");
                let _ = outbound
                    .send(Outbound::Close {
                        reason: CLOSE_REASON_UNAUTHORIZED,
                    })
                    .await;
                summary.advance(SessionPhase::Closed);
                return summary;
            }
        };

        summary.camera_id = Some(identity.id);
        summary.advance(SessionPhase::Streaming);
        self.connected(&identity, connection_id).await;

        let mut stream = StreamingSession {
            shared: Arc::clone(&self.inner),
            filter: StabilityFilter::new(self.inner.config.stability),
            identity,
            connection_id,
            outbound,
            frames_processed: 0,
            alerts_fired: 0,
        };
        let end = stream.pump(inbound).await;

        summary.frames_processed = stream.frames_processed;
        summary.alerts_fired = stream.alerts_fired;
        self.disconnected(&stream.identity, connection_id, end).await;
        summary.advance(end);
        summary
    }

    async fn validate(&self, token: &str) -> Result<CameraIdentity, SessionError> {
        if token.trim().is_empty() {
            return Err(SessionError::Unauthorized);
        }
        let lookup = self.inner.collaborators.cameras.resolve_token(token);
        match tokio::time::timeout(self.inner.config.validation_timeout, lookup).await {
            Ok(Ok(Some(identity))) => Ok(identity),
            Ok(Ok(None)) => Err(SessionError::Unauthorized),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(CollaboratorError::TimedOut {
                collaborator: "camera store",
            }
            .into()),
        }
    }

    async fn connected(&self, identity: &CameraIdentity, connection_id: Uuid) {
        let now = OffsetDateTime::now_utc();
        let connections = self.inner.registry.register(identity.id, now);
        gauge!(
            "smokewatch_sessions_active",
            self.inner.registry.active_connections() as f64
        );
        if let Err(err) = self
            .inner
            .collaborators
            .cameras
            .set_online(identity.id, true, now)
            .await
        {
            warn!(camera_id = %identity.id, error = %err, "failed to mark camera online");
        }
        info!(
            camera_id = %identity.id,
            camera = %identity.name,
            kind = identity.kind.as_str(),
            connection_id = %connection_id,
            connections,
            "camera session streaming"
        );
    }

    async fn disconnected(&self, identity: &CameraIdentity, connection_id: Uuid, end: SessionPhase) {
        let remaining = self.inner.registry.unregister(identity.id);
        gauge!(
            "smokewatch_sessions_active",
            self.inner.registry.active_connections() as f64
        );
        counter!("smokewatch_sessions_closed_total", 1, "phase" => end.as_str());
        if remaining == 0 {
            if let Err(err) = self
                .inner
                .collaborators
                .cameras
                .set_online(identity.id, false, OffsetDateTime::now_utc())
                .await
            {
                warn!(camera_id = %identity.id, error = %err, "failed to mark camera offline");
            }
        }
        info!(
            camera_id = %identity.id,
            connection_id = %connection_id,
            remaining,
            phase = end.as_str(),
            "camera session ended"
        );
    }
}

/// Per-connection state once the token has been accepted.
struct StreamingSession {
    shared: Arc<SessionShared>,
    identity: CameraIdentity,
    connection_id: Uuid,
    filter: StabilityFilter,
    outbound: mpsc::Sender<Outbound>,
    frames_processed: u64,
    alerts_fired: u64,
}

impl StreamingSession {
    async fn pump<S>(&mut self, mut inbound: S) -> SessionPhase
    where
        S: Stream<Item = Result<Inbound, TransportError>> + Unpin + Send,
    {
        let idle_timeout = self.shared.config.idle_timeout;
        loop {
            let next = match tokio::time::timeout(idle_timeout, inbound.next()).await {
                Ok(next) => next,
                Err(_) => {
                    info!(
                        camera_id = %self.identity.id,
                        connection_id = %self.connection_id,
                        idle_secs = idle_timeout.as_secs(),
                        "closing idle session"
                    );
                    let _ = self
                        .outbound
                        .send(Outbound::Close {
                            reason: CLOSE_REASON_IDLE,
                        })
                        .await;
                    return SessionPhase::Closed;
                }
            };

            let message = match next {
                None => return SessionPhase::Closed,
                Some(Err(err)) => {
                    warn!(
                        camera_id = %self.identity.id,
                        connection_id = %self.connection_id,
                        error = %err,
                        "session transport failed"
                    );
                    return SessionPhase::Crashed;
                }
                Some(Ok(message)) => message,
            };

            match self.handle(message).await {
                Ok(true) => {}
                Ok(false) => return SessionPhase::Closed,
                Err(err) => {
                    warn!(
                        camera_id = %self.identity.id,
                        connection_id = %self.connection_id,
                        error = %err,
                        "session ended abnormally"
                    );
                    return SessionPhase::Crashed;
                }
            }
        }
    }

    /// Returns `Ok(false)` when the peer closed the session.
    async fn handle(&mut self, message: Inbound) -> Result<bool, SessionError> {
        let payload = match message {
            Inbound::Close(reason) => {
                info!(
                    camera_id = %self.identity.id,
                    connection_id = %self.connection_id,
                    reason = ?reason,
                    "camera closed session"
                );
                return Ok(false);
            }
            Inbound::Ping => return Ok(true),
            Inbound::Binary(bytes) if bytes.is_empty() => {
                self.skip_malformed(FrameError::Empty).await?;
                return Ok(true);
            }
            Inbound::Binary(bytes) => bytes,
            Inbound::Text(text) => match ClientMessage::parse(&text) {
                Ok(ClientMessage::Ping) => {
                    self.send(ServerMessage::Pong).await?;
                    return Ok(true);
                }
                Ok(ClientMessage::Frame { data }) => match decode_frame_payload(&data) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        self.skip_malformed(err).await?;
                        return Ok(true);
                    }
                },
                Err(err) => {
                    self.skip_malformed(err.into()).await?;
                    return Ok(true);
                }
            },
        };

        self.process(Frame::new(payload, OffsetDateTime::now_utc()))
            .await?;
        Ok(true)
    }

    async fn skip_malformed(&self, err: FrameError) -> Result<(), SessionError> {
        let err = SessionError::from(err);
        counter!("smokewatch_frames_malformed_total", 1, "reason" => err.metric_label());
        debug!(
            camera_id = %self.identity.id,
            connection_id = %self.connection_id,
            error = %err,
            "skipping malformed message"
        );
        self.send(ServerMessage::error(err.to_string())).await
    }

    async fn process(&mut self, frame: Frame) -> Result<(), SessionError> {
        let shared = Arc::clone(&self.shared);
        let camera_id = self.identity.id;
        let settings = self.identity.settings;

        let objects = match shared
            .collaborators
            .detector
            .infer(camera_id, &frame, settings.thresholds)
            .await
        {
            Ok(objects) => objects,
            Err(err) => {
                counter!(
                    "smokewatch_detector_failures_total",
                    1,
                    "collaborator" => err.collaborator()
                );
                warn!(camera_id = %camera_id, error = %err, "detection failed; frame treated as empty");
                Vec::new()
            }
        };
        let verdict = classify(&objects, &shared.config.classifier);

        let stable = self.filter.observe_claiming(verdict.is_smoking, |cooldown| {
            shared
                .registry
                .try_claim_alert(camera_id, Instant::now(), cooldown)
        });
        if stable {
            if settings.alert_enabled {
                self.raise_alert(&frame, &verdict, &objects).await?;
            } else {
                debug!(camera_id = %camera_id, "stable smoking detected; alerts disabled for camera");
            }
        }

        self.send(ServerMessage::DetectionResult(DetectionReport {
            verdict,
            boxes: objects,
        }))
        .await?;

        self.frames_processed += 1;
        counter!("smokewatch_frames_processed_total", 1);
        shared.registry.record_frame(camera_id, frame.received_at);
        if let Err(err) = shared
            .collaborators
            .cameras
            .touch(camera_id, frame.received_at)
            .await
        {
            debug!(camera_id = %camera_id, error = %err, "failed to refresh last_seen");
        }
        Ok(())
    }

    async fn raise_alert(
        &mut self,
        frame: &Frame,
        verdict: &SmokingVerdict,
        objects: &[DetectedObject],
    ) -> Result<(), SessionError> {
        let shared = Arc::clone(&self.shared);
        let camera_id = self.identity.id;
        let at = frame.received_at;

        let screenshot = if self.identity.settings.screenshot_enabled {
            match shared
                .collaborators
                .screenshots
                .encode_and_store(frame, camera_id, at)
                .await
            {
                Ok(reference) => Some(reference),
                Err(err) => {
                    warn!(camera_id = %camera_id, error = %err, "failed to store alert screenshot");
                    None
                }
            }
        } else {
            None
        };

        let event = AlertEvent::new(camera_id, verdict.clone(), objects.to_vec(), at, screenshot);
        let detection_id = match shared.collaborators.detections.save(&event).await {
            Ok(id) => Some(id),
            Err(err) => {
                warn!(
                    camera_id = %camera_id,
                    alert_id = %event.alert_id(),
                    error = %err,
                    "failed to persist detection"
                );
                None
            }
        };

        self.alerts_fired += 1;
        shared.registry.record_alert(camera_id);
        counter!("smokewatch_alerts_fired_total", 1, "camera_id" => camera_id.to_string());
        info!(
            camera_id = %camera_id,
            alert_id = %event.alert_id(),
            detection_id = ?detection_id,
            pairs = event.verdict().paired_ids.len(),
            confidence = event.verdict().max_confidence,
            "stable smoking detected"
        );

        self.send(ServerMessage::Alert(AlertReport::from_event(&event, detection_id)))
            .await
    }

    async fn send(&self, message: ServerMessage) -> Result<(), SessionError> {
        self.outbound
            .send(Outbound::Message(message))
            .await
            .map_err(|_| SessionError::ChannelClosed)
    }
}

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use smokewatch_core::CameraId;
use tracing::warn;

use crate::screenshot::resolve_screenshot;
use crate::state::AppState;
use crate::supervisor::{StartOutcome, StopOutcome};
use crate::websocket::upload_handler;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics))
        .route("/ws/upload/:api_key", get(upload_handler))
        .route("/cameras/:camera_id/ingest/start", post(start_ingest))
        .route("/cameras/:camera_id/ingest/stop", post(stop_ingest))
        .route("/cameras/:camera_id/ingest/status", get(ingest_status))
        .route("/ingest", get(list_ingest))
        .route("/debug/sessions", get(debug_sessions))
        .route("/screenshots/:filename", get(screenshot))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct IngestResponse<T: Serialize> {
    camera_id: CameraId,
    success: bool,
    message: String,
    #[serde(flatten)]
    outcome: T,
}

fn ingest_error(status: StatusCode, camera_id: CameraId, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({
            "camera_id": camera_id,
            "success": false,
            "status": "error",
            "message": message.into(),
        })),
    )
        .into_response()
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "status": "ok", "uptime_secs": state.uptime_secs() }))
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.render_metrics(),
    )
}

async fn start_ingest(State(state): State<AppState>, Path(camera_id): Path<CameraId>) -> Response {
    let record = match state.sessions().collaborators().cameras.camera(camera_id).await {
        Ok(Some(record)) => record,
        Ok(None) => return ingest_error(StatusCode::NOT_FOUND, camera_id, "camera not found"),
        Err(err) => {
            warn!(camera_id = %camera_id, error = %err, "camera lookup failed");
            return ingest_error(StatusCode::SERVICE_UNAVAILABLE, camera_id, err.to_string());
        }
    };
    if !record.kind.requires_helper() {
        return ingest_error(
            StatusCode::CONFLICT,
            camera_id,
            format!(
                "{} cameras push their own frames; only rtsp sources can be ingested",
                record.kind.as_str()
            ),
        );
    }
    if !record.active {
        return ingest_error(StatusCode::CONFLICT, camera_id, "camera is disabled");
    }

    let spec = state.helper().launch_spec(&record.api_key, &record.source);
    let outcome = state.supervisor().start(camera_id, &spec).await;
    let status = match outcome {
        StartOutcome::Started { .. } => StatusCode::OK,
        StartOutcome::AlreadyRunning { .. } => StatusCode::CONFLICT,
        StartOutcome::Crashed { .. } | StartOutcome::LaunchFailed { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    let body = IngestResponse {
        camera_id,
        success: outcome.is_started(),
        message: outcome.message(),
        outcome,
    };
    (status, Json(body)).into_response()
}

async fn stop_ingest(State(state): State<AppState>, Path(camera_id): Path<CameraId>) -> Response {
    let outcome = state.supervisor().stop(camera_id).await;
    let (status, success) = match outcome {
        StopOutcome::Stopped { .. } => (StatusCode::OK, true),
        StopOutcome::Crashed { .. } => (StatusCode::OK, false),
        StopOutcome::NotRunning => (StatusCode::NOT_FOUND, false),
        StopOutcome::Failed { .. } => (StatusCode::INTERNAL_SERVER_ERROR, false),
    };
    let body = IngestResponse {
        camera_id,
        success,
        message: outcome.message(),
        outcome,
    };
    (status, Json(body)).into_response()
}

async fn ingest_status(
    State(state): State<AppState>,
    Path(camera_id): Path<CameraId>,
) -> impl IntoResponse {
    let report = state.supervisor().status(camera_id).await;
    Json(json!({
        "camera_id": camera_id,
        "running": report.is_running(),
        "report": report,
    }))
}

async fn list_ingest(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "processes": state.supervisor().list().await }))
}

async fn debug_sessions(State(state): State<AppState>) -> impl IntoResponse {
    let registry = state.sessions().registry();
    Json(json!({
        "active_connections": registry.active_connections(),
        "cameras": registry.snapshot(),
    }))
}

async fn screenshot(State(state): State<AppState>, Path(filename): Path<String>) -> Response {
    let Some(path) = resolve_screenshot(state.screenshot_dir(), &filename) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    match tokio::fs::read(&path).await {
        Ok(bytes) => ([(header::CONTENT_TYPE, "image/jpeg")], bytes).into_response(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            StatusCode::NOT_FOUND.into_response()
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed to read screenshot");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

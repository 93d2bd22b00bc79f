use std::borrow::Cow;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::session::{Inbound, Outbound};
use crate::state::AppState;

/// Time the writer gets to flush pending messages and the close frame after a session ends.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn upload_handler(
    State(state): State<AppState>,
    Path(api_key): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_upload(socket, state, api_key))
}

impl From<Message> for Inbound {
    fn from(message: Message) -> Self {
        match message {
            Message::Text(text) => Inbound::Text(text),
            Message::Binary(bytes) => Inbound::Binary(bytes),
            Message::Ping(_) | Message::Pong(_) => Inbound::Ping,
            Message::Close(frame) => Inbound::Close(frame.map(|frame| frame.reason.to_string())),
        }
    }
}

fn outbound_message(outbound: Outbound) -> Option<Message> {
    match outbound {
        Outbound::Message(message) => match message.to_json() {
            Ok(json) => Some(Message::Text(json)),
            Err(err) => {
                warn!(kind = message.kind(), error = %err, "dropping unencodable server message");
                None
            }
        },
        Outbound::Close { reason } => Some(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: Cow::Borrowed(reason),
        }))),
    }
}

async fn handle_upload(socket: WebSocket, state: AppState, api_key: String) {
    let (mut ws_tx, ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Outbound>(state.sessions().config().outbound_buffer);

    let writer = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            let closing = matches!(outbound, Outbound::Close { .. });
            let Some(message) = outbound_message(outbound) else {
                continue;
            };
            if ws_tx.send(message).await.is_err() || closing {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let inbound = ws_rx.map(|message| {
        message
            .map(Inbound::from)
            .map_err(|err| TransportError(err.to_string()))
    });
    let summary = state.sessions().run(&api_key, inbound, tx).await;

    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        warn!(connection_id = %summary.connection_id, "websocket writer did not drain in time");
    }
    debug!(
        connection_id = %summary.connection_id,
        camera_id = ?summary.camera_id,
        phase = summary.phase.as_str(),
        frames = summary.frames_processed,
        alerts = summary.alerts_fired,
        "upload socket finished"
    );
}

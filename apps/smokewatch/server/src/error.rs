use smokewatch_core::ProtocolError;
use thiserror::Error;

/// Failure of an external collaborator (camera store, detector, persistence, screenshots).
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("{collaborator} unavailable: {message}")]
    Unavailable {
        collaborator: &'static str,
        message: String,
    },
    #[error("{collaborator} timed out")]
    TimedOut { collaborator: &'static str },
    #[error("{collaborator} returned an invalid response: {message}")]
    InvalidResponse {
        collaborator: &'static str,
        message: String,
    },
}

impl CollaboratorError {
    pub fn unavailable(collaborator: &'static str, err: impl std::fmt::Display) -> Self {
        CollaboratorError::Unavailable {
            collaborator,
            message: err.to_string(),
        }
    }

    pub fn invalid_response(collaborator: &'static str, err: impl std::fmt::Display) -> Self {
        CollaboratorError::InvalidResponse {
            collaborator,
            message: err.to_string(),
        }
    }

    pub fn collaborator(&self) -> &'static str {
        match self {
            CollaboratorError::Unavailable { collaborator, .. }
            | CollaboratorError::TimedOut { collaborator }
            | CollaboratorError::InvalidResponse { collaborator, .. } => collaborator,
        }
    }
}

/// Why an inbound message could not be turned into a frame.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("invalid base64 frame payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("empty frame payload")]
    Empty,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("capability token rejected")]
    Unauthorized,
    #[error("malformed input: {0}")]
    MalformedInput(#[from] FrameError),
    #[error(transparent)]
    CollaboratorUnavailable(#[from] CollaboratorError),
    #[error("session channel closed")]
    ChannelClosed,
}

impl SessionError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            SessionError::Unauthorized => "unauthorized",
            SessionError::MalformedInput(_) => "malformed_input",
            SessionError::CollaboratorUnavailable(_) => "collaborator_unavailable",
            SessionError::ChannelClosed => "channel_closed",
        }
    }
}

/// Error surfaced by the transport carrying a session (websocket read failure and similar).
#[derive(Debug, Error)]
#[error("transport error: {0}")]
pub struct TransportError(pub String);

//! Smokewatch server: camera upload sessions, smoking alerts and supervision of RTSP
//! ingestion helpers.

pub mod config;
pub mod detector;
pub mod error;
pub mod redis_store;
pub mod routes;
pub mod screenshot;
pub mod session;
pub mod state;
pub mod store;
pub mod supervisor;
pub mod telemetry;
pub mod websocket;

pub use config::{Cli, ServerConfig, StoreBackend};
pub use error::{CollaboratorError, FrameError, SessionError, TransportError};
pub use routes::router;
pub use session::{
    Collaborators, Inbound, Outbound, SessionConfig, SessionManager, SessionPhase,
    SessionRegistry, SessionSummary,
};
pub use state::{build_collaborators, AppState};
pub use supervisor::{
    HelperTemplate, LaunchSpec, ProcessSupervisor, StartOutcome, StatusReport, StopOutcome,
    SupervisorConfig,
};

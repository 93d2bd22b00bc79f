use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use smokewatch_core::{ClassifierConfig, StabilityPolicy};

use crate::session::SessionConfig;
use crate::supervisor::{HelperTemplate, SupervisorConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreBackend {
    /// Cameras seeded from a JSON file, detections kept in process memory.
    Memory,
    Redis,
}

#[derive(Debug, Parser)]
#[command(
    name = "smokewatch",
    author,
    version,
    about = "Camera upload sessions, smoking alerts and RTSP ingestion supervision"
)]
pub struct Cli {
    /// Address the HTTP/websocket listener binds to.
    #[arg(long, env = "SMOKEWATCH_LISTEN_ADDR", default_value = "0.0.0.0:8000")]
    pub listen_addr: String,

    /// Where camera records and detections live.
    #[arg(long, env = "SMOKEWATCH_STORE", value_enum, default_value_t = StoreBackend::Memory)]
    pub store: StoreBackend,

    #[arg(long, env = "SMOKEWATCH_REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    /// JSON array of camera records loaded at startup.
    #[arg(long, env = "SMOKEWATCH_CAMERA_SEED")]
    pub camera_seed: Option<PathBuf>,

    /// Base URL of the object detection service. Without it every frame is treated as empty.
    #[arg(long, env = "SMOKEWATCH_DETECTOR_URL")]
    pub detector_url: Option<String>,

    #[arg(long, env = "SMOKEWATCH_DETECTOR_TIMEOUT_MS", default_value_t = 2000)]
    pub detector_timeout_ms: u64,

    #[arg(long, env = "SMOKEWATCH_SCREENSHOT_DIR", default_value = "screenshots")]
    pub screenshot_dir: PathBuf,

    /// Directory holding one log file per ingestion helper.
    #[arg(long, env = "SMOKEWATCH_LOG_DIR", default_value = "logs")]
    pub log_dir: PathBuf,

    /// Executable started for RTSP cameras.
    #[arg(long, env = "SMOKEWATCH_HELPER_PROGRAM", default_value = "camera-client")]
    pub helper_program: PathBuf,

    /// Extra leading arguments for the helper, comma separated.
    #[arg(
        long,
        env = "SMOKEWATCH_HELPER_ARGS",
        value_delimiter = ',',
        allow_hyphen_values = true
    )]
    pub helper_args: Vec<String>,

    /// Websocket base URL helpers use to reach this server.
    #[arg(long, env = "SMOKEWATCH_PUBLIC_WS_URL", default_value = "ws://127.0.0.1:8000")]
    pub public_ws_url: String,

    #[arg(long, env = "SMOKEWATCH_STABLE_FRAMES", default_value_t = 3)]
    pub stable_frames: u32,

    #[arg(long, env = "SMOKEWATCH_ALERT_COOLDOWN_SECS", default_value_t = 10)]
    pub alert_cooldown_secs: u64,

    /// Pixels added around a person box when looking for a cigarette.
    #[arg(long, env = "SMOKEWATCH_PROXIMITY_MARGIN", default_value_t = 50.0)]
    pub proximity_margin: f32,

    /// How long a freshly started helper must survive before it counts as running.
    #[arg(long, env = "SMOKEWATCH_HELPER_GRACE_MS", default_value_t = 1000)]
    pub helper_grace_ms: u64,

    #[arg(long, env = "SMOKEWATCH_HELPER_STOP_TIMEOUT_SECS", default_value_t = 5)]
    pub helper_stop_timeout_secs: u64,

    #[arg(long, env = "SMOKEWATCH_VALIDATION_TIMEOUT_SECS", default_value_t = 5)]
    pub validation_timeout_secs: u64,

    #[arg(long, env = "SMOKEWATCH_IDLE_TIMEOUT_SECS", default_value_t = 120)]
    pub idle_timeout_secs: u64,

    /// Upper bound on stopping helpers once a shutdown signal arrives.
    #[arg(long, env = "SMOKEWATCH_SHUTDOWN_GRACE_SECS", default_value_t = 10)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub store: StoreBackend,
    pub redis_url: String,
    pub camera_seed: Option<PathBuf>,
    pub detector_url: Option<String>,
    pub detector_timeout: Duration,
    pub screenshot_dir: PathBuf,
    pub session: SessionConfig,
    pub supervisor: SupervisorConfig,
    pub helper: HelperTemplate,
    pub shutdown_grace: Duration,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        if !cli.proximity_margin.is_finite() || cli.proximity_margin < 0.0 {
            bail!(
                "proximity margin must be a non-negative number, got {}",
                cli.proximity_margin
            );
        }
        if cli.idle_timeout_secs == 0 || cli.validation_timeout_secs == 0 {
            bail!("session timeouts must be greater than zero");
        }
        if !(cli.public_ws_url.starts_with("ws://") || cli.public_ws_url.starts_with("wss://")) {
            bail!(
                "public websocket url must use ws:// or wss://, got {}",
                cli.public_ws_url
            );
        }
        let cooldown = Duration::from_secs(cli.alert_cooldown_secs);

        let session = SessionConfig {
            validation_timeout: Duration::from_secs(cli.validation_timeout_secs),
            idle_timeout: Duration::from_secs(cli.idle_timeout_secs),
            stability: StabilityPolicy::new(cli.stable_frames, cooldown),
            classifier: ClassifierConfig::default().with_margin(cli.proximity_margin),
            ..SessionConfig::default()
        };
        let supervisor = SupervisorConfig {
            log_dir: cli.log_dir,
            grace_period: Duration::from_millis(cli.helper_grace_ms),
            stop_timeout: Duration::from_secs(cli.helper_stop_timeout_secs),
        };
        let helper = HelperTemplate {
            program: cli.helper_program,
            base_args: cli.helper_args,
            server_url: cli.public_ws_url.trim_end_matches('/').to_string(),
        };

        Ok(ServerConfig {
            listen_addr,
            store: cli.store,
            redis_url: cli.redis_url,
            camera_seed: cli.camera_seed,
            detector_url: cli.detector_url.filter(|url| !url.trim().is_empty()),
            detector_timeout: Duration::from_millis(cli.detector_timeout_ms),
            screenshot_dir: cli.screenshot_dir,
            session,
            supervisor,
            helper,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}

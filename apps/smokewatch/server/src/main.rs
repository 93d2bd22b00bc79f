use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal;
use tracing::{info, warn};

use smokewatch_server::telemetry::Telemetry;
use smokewatch_server::{
    build_collaborators, router, AppState, Cli, ProcessSupervisor, ServerConfig, SessionManager,
};

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        store = ?config.store,
        detector = config.detector_url.as_deref().unwrap_or("none"),
        helper = %config.helper.program.display(),
        "starting smokewatch server"
    );

    run(config, telemetry.metrics_handle()).await
}

async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    let collaborators = build_collaborators(&config)
        .await
        .context("failed to initialise collaborators")?;
    let sessions = SessionManager::new(config.session.clone(), collaborators);
    let supervisor = ProcessSupervisor::new(config.supervisor.clone());
    let state = AppState::new(
        sessions,
        supervisor.clone(),
        config.helper.clone(),
        config.screenshot_dir.clone(),
        Some(metrics),
    );

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("smokewatch listening on {}", config.listen_addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; stopping ingestion helpers"
    );
    match tokio::time::timeout(config.shutdown_grace, supervisor.stop_all()).await {
        Ok(stopped) => {
            for (camera_id, outcome) in stopped {
                info!(camera_id = %camera_id, outcome = %outcome.message(), "helper stopped on shutdown");
            }
        }
        Err(_) => warn!("timed out stopping ingestion helpers; remaining helpers are killed on exit"),
    }
    info!("graceful shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

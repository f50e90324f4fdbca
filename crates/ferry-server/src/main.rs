mod config;
mod error;
mod metrics;
mod routes;

use std::net::SocketAddr;

use tracing::{info, warn};

use crate::config::Config;
use crate::routes::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ferry=debug,ferry_core=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;
    if !config.receiver_bin.exists() {
        warn!("Receiver executable not found at {}", config.receiver_bin.display());
    }
    if !config.sender_bin.exists() {
        warn!("Sender executable not found at {}", config.sender_bin.display());
    }

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("Executables: {}", config.bin_dir.display());
    info!("Artifacts: {}", config.data_dir.display());
    if let Some(ui) = &config.ui_dir {
        info!("Serving UI from {}", ui.display());
    }

    let state = AppState::new(config);
    let supervisor = state.supervisor.clone();
    let app = routes::router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Ferry controller listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if supervisor.stop().await {
        info!("Receiver stopped");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    warn!("SIGTERM handler unavailable: {}", e);
                    ctrl_c.await.ok();
                    info!("Received Ctrl+C, shutting down...");
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}

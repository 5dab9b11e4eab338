//! chatgate server binary entry point.

use chatgate::{telemetry::init_tracing, GuardState};
use chatgate_server::{app, ServerConfig};
use std::net::SocketAddr;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Configuration errors are fatal; the secret has no safe default
    let config = ServerConfig::load()?;
    init_tracing(config.log_format);

    tracing::info!("Starting chatgate-server");

    let addr: SocketAddr = config.service.bind_address().parse()?;
    let state = GuardState::initialize(config.security).await?;
    let app = app(state)?;

    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("chatgate-server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
}

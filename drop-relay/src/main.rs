//! sharedrop-relay binary entry point.
//!
//! Usage:
//! ```bash
//! sharedrop-relay --config relay.toml
//! SHAREDROP_CONFIG=relay.toml sharedrop-relay
//! ```

use anyhow::Context;
use sharedrop_relay::cleanup::spawn_reaper;
use sharedrop_relay::config::Config;
use sharedrop_relay::http::build_router;
use sharedrop_relay::server::DropRelay;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::load(get_config_path()).context("loading configuration")?;
    let bind_address = config.server.bind_address.clone();
    tracing::info!("sharedrop-relay v{}", env!("CARGO_PKG_VERSION"));

    let (relay, dispatcher) = DropRelay::start(config);
    let reaper = spawn_reaper(relay.clone(), relay.config().cleanup.clone());

    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("binding {bind_address}"))?;
    tracing::info!("Listening on {}", bind_address);

    axum::serve(
        listener,
        build_router(relay).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("serving HTTP")?;

    reaper.abort();
    dispatcher.abort();
    tracing::info!("Shut down");
    Ok(())
}

fn get_config_path() -> Option<PathBuf> {
    std::env::args()
        .skip_while(|arg| arg != "--config")
        .nth(1)
        .map(PathBuf::from)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}

//! tilawa-edge entry point.
//!
//! Boots the offline-first edge in front of the upstream app: open the store,
//! precache the static shell, activate the current bucket version (even when
//! the precache fails), start the sync manager and serve HTTP until ctrl-c.
//! Logging goes to stderr as JSON.

use std::sync::Arc;

use anyhow::Result;
use tilawa_client::{FetchClient, FetchConfig, Network};
use tilawa_core::{AppConfig, Store};
use tracing_subscriber::EnvFilter;

mod control;
mod error;
mod handler;

use handler::EdgeState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .json()
        .init();

    let config = AppConfig::load()?;
    tracing::info!(
        listen = %config.listen_addr,
        upstream = %config.upstream_url,
        version = %config.cache_version,
        "starting tilawa-edge"
    );

    let store = Store::open(&config.db_path).await?;
    let network: Arc<dyn Network> = Arc::new(FetchClient::new(FetchConfig::from(&config))?);
    let state = EdgeState::build(&config, store, network)?;

    state.router.start().await?;
    state.sync.start()?;

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, handler::app(state.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.router.teardown().await;
    state.sync.settle().await;
    if let Err(e) = state.store.clone().close().await {
        tracing::warn!(error = %e, "store did not close cleanly");
    }
    tracing::info!("shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for shutdown signal");
    }
}

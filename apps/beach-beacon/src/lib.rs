//! Beach Beacon: push-notification relay.
//!
//! Backends `POST /notify` batches addressed to user ids; the relay writes
//! each payload to every WebSocket the user currently holds on `/ws`.

pub mod auth;
pub mod config;
pub mod dispatch;
pub mod handshake;
pub mod registry;
pub mod routes;
pub mod state;
pub mod telemetry;
pub mod token;

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::{net::TcpListener, signal};
use tracing::info;

use crate::{config::ServerConfig, routes::build_router, state::AppState};

pub async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    let state = AppState::from_config(&config)
        .context("failed to build auth client")?
        .with_metrics(metrics);
    let router = build_router(Arc::new(state));

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(
        listen_addr = %config.listen_addr,
        auth_url = %config.auth_url,
        testing = config.testing,
        handshake_timeout = ?config.handshake_timeout,
        "beach-beacon listening"
    );

    serve(listener, router, config.shutdown_grace).await
}

async fn serve(listener: TcpListener, router: axum::Router, grace: Duration) -> Result<()> {
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    info!(
        grace_seconds = grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(grace).await;
    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

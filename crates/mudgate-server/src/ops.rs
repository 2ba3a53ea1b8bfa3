//! Operational HTTP endpoints, served on a dedicated port.
//!
//! `/health` answers liveness probes; `/stats` reports session counts and
//! the effective configuration. Informative only; no part of the proxy
//! contract depends on these.

use crate::config::ProxyConfig;
use crate::session::SessionRegistry;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use mudgate_core::ProxyResult;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

pub struct OpsState {
    pub registry: Arc<SessionRegistry>,
    pub config: ProxyConfig,
    pub started: Instant,
}

pub fn router(state: Arc<OpsState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .with_state(state)
}

/// Bind and serve the ops router until the process exits.
pub async fn serve(state: Arc<OpsState>) -> ProxyResult<()> {
    let listener =
        tokio::net::TcpListener::bind(("0.0.0.0", state.config.ops_port)).await?;
    info!(addr = %listener.local_addr()?, "ops endpoints started");
    serve_with(listener, state).await
}

/// Serve the ops router on an already-bound listener.
pub async fn serve_with(
    listener: tokio::net::TcpListener,
    state: Arc<OpsState>,
) -> ProxyResult<()> {
    axum::serve(listener, router(state))
        .await
        .map_err(|e| mudgate_core::ProxyError::Transport(e.to_string()))
}

async fn health(State(state): State<Arc<OpsState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "uptimeSecs": state.started.elapsed().as_secs(),
        "sessions": state.registry.count().await,
    }))
}

async fn stats(State(state): State<Arc<OpsState>>) -> Json<serde_json::Value> {
    let stats = state.registry.stats().await;
    Json(json!({
        "activeSessions": stats.attached,
        "persistedSessions": stats.persisted,
        "bufferedBytes": stats.buffered_bytes,
        "upstream": state.config.upstream,
        "proxyProtocol": state.config.use_proxy_protocol,
        "defaultConfig": state.config.default_session,
    }))
}

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use serde_json::json;
use tokio::{net::TcpListener, sync::watch};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::backhaul::{
    telemetry,
    tunnel::broker::{ControlCell, SharedRegistry},
};

#[derive(Clone)]
pub struct AdminState {
    pub prom: telemetry::SharedPrometheusHandle,
    pub sessions: telemetry::SharedSessions,
    /// Broker state; `None` when this process only runs the agent.
    pub pending: Option<SharedRegistry>,
    pub control: Option<Arc<ControlCell>>,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/conns", get(conns))
        .route("/tunnel/pending", get(tunnel_pending))
        .route("/tunnel/control", get(tunnel_control))
        .with_state(Arc::new(state))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn serve_with_shutdown(
    addr: SocketAddr,
    state: AdminState,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("admin: bind {addr}"))?;
    serve_listener(listener, state, shutdown).await
}

pub async fn serve_listener(
    listener: TcpListener,
    state: AdminState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    tracing::info!(admin_addr = %listener.local_addr()?, "admin: listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .context("admin: serve")?;

    tracing::info!("admin: stopped");
    Ok(())
}

async fn health(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    let pending = match &st.pending {
        Some(reg) => Some(reg.len().await),
        None => None,
    };
    (
        StatusCode::OK,
        Json(json!({
            "ok": true,
            "active_pipes": st.sessions.len(),
            "pending": pending,
        })),
    )
}

async fn metrics(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        st.prom.render(),
    )
}

async fn conns(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(st.sessions.snapshot()))
}

async fn tunnel_pending(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    let snap = match &st.pending {
        Some(reg) => reg.snapshot().await,
        None => Vec::new(),
    };
    (StatusCode::OK, Json(snap))
}

async fn tunnel_control(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    let current = match &st.control {
        Some(cell) => cell.snapshot().await,
        None => None,
    };
    (
        StatusCode::OK,
        Json(json!({ "connected": current.is_some(), "session": current })),
    )
}

//! Status HTTP Server
//!
//! Read-only JSON view of the orchestrator for dashboards and monitoring tools.

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::monitor::ResourceSnapshot;
use crate::orchestrator::{Orchestrator, ScheduleStatus};
use crate::pool::PoolStatus;
use crate::store::JobRecord;

/// Errors that can occur when running the status server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid bind address {0}")]
    InvalidAddress(String),

    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Serve(#[from] std::io::Error),
}

/// Body of `GET /status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub pool: PoolStatus,
    pub schedule: ScheduleStatus,
    pub queue: Vec<JobRecord>,
}

/// Handler for GET /status
async fn get_status(
    State(orchestrator): State<Orchestrator>,
) -> Result<Json<StatusReport>, StatusCode> {
    let queue = orchestrator.list_queue().map_err(|e| {
        warn!(error = %e, "Failed to list queue");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(Json(StatusReport {
        pool: orchestrator.pool_status(),
        schedule: orchestrator.get_schedule().await,
        queue,
    }))
}

/// Handler for GET /snapshot
async fn get_snapshot(
    State(orchestrator): State<Orchestrator>,
) -> Result<Json<ResourceSnapshot>, StatusCode> {
    orchestrator.get_current_snapshot().await.map(Json).map_err(|e| {
        warn!(error = %e, "Snapshot unavailable");
        StatusCode::SERVICE_UNAVAILABLE
    })
}

/// Creates the axum Router with the status endpoints
pub fn create_status_router(orchestrator: Orchestrator) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/snapshot", get(get_snapshot))
        .with_state(orchestrator)
}

/// Bind the status listener so address errors surface before anything starts
pub async fn bind_status_listener(bind: &str) -> Result<TcpListener, ServerError> {
    let addr: SocketAddr = bind
        .parse()
        .map_err(|_| ServerError::InvalidAddress(bind.to_string()))?;
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })
}

/// Serve the status endpoints on `listener` until `shutdown` fires
pub async fn run_status_server(
    listener: TcpListener,
    orchestrator: Orchestrator,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), ServerError> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Status server listening");
    }
    let app = create_status_router(orchestrator);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;
    Ok(())
}

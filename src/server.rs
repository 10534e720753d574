//! HTTP surface for the daemon
//!
//! - `GET /health`: scheduler liveness as JSON (503 when stopped)
//! - `GET /metrics`: Prometheus text format
//! - `POST /run`, `POST /run/{tenant_id}`: manual trigger, replies with the cycle report

use crate::ids::TenantId;
use crate::sync::{metrics, SchedulerHandle};
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;

/// Server error types
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bind error: {0}")]
    Bind(String),
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

struct AppState {
    scheduler: Option<SchedulerHandle>,
}

/// Health, metrics and manual-trigger endpoint
pub struct StatusServer {
    state: Arc<AppState>,
}

impl StatusServer {
    /// `scheduler` is `None` when no daemon runs in this process; `/run` then answers 503
    pub fn new(scheduler: Option<SchedulerHandle>) -> Self {
        Self {
            state: Arc::new(AppState { scheduler }),
        }
    }

    fn router(state: Arc<AppState>) -> Router {
        Router::new()
            .route("/health", get(health))
            .route("/metrics", get(prometheus_metrics))
            .route("/run", post(run_all))
            .route("/run/{tenant_id}", post(run_tenant))
            .with_state(state)
    }

    /// Bind and serve until the task is dropped
    pub async fn run(self, addr: &str) -> Result<(), ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind(e.to_string()))?;
        self.serve(listener).await
    }

    /// Serve on an already-bound listener
    pub async fn serve(self, listener: TcpListener) -> Result<(), ServerError> {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(addr = %addr, "Status server listening");
        }

        axum::serve(listener, Self::router(self.state))
            .await
            .map_err(ServerError::Io)
    }
}

async fn health() -> impl IntoResponse {
    if metrics::HEALTH_STATUS.get() >= 1.0 {
        (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "stopped" })),
        )
    }
}

async fn prometheus_metrics() -> Response {
    match metrics::encode_metrics() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn run_all(State(state): State<Arc<AppState>>) -> Response {
    trigger(&state, None).await
}

async fn run_tenant(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<String>,
) -> Response {
    trigger(&state, Some(TenantId::new(tenant_id))).await
}

async fn trigger(state: &AppState, tenant: Option<TenantId>) -> Response {
    let Some(handle) = state.scheduler.as_ref() else {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "scheduler is not running in this process",
        );
    };

    match handle.run_now(tenant).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

fn error_response(status: StatusCode, error: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
        .into_response()
}

//! HTTP endpoints for the control plane
//!
//! Read-only surface:
//! - Health check
//! - Reconciliation engine status
//! - Stored challenge instances

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::reconciler::EngineStatus;
use crate::store::InstanceStore;

/// Shared state for request handlers
pub struct ApiState {
    pub store: Arc<dyn InstanceStore>,
    pub engine: Arc<parking_lot::RwLock<EngineStatus>>,
    pub started_at: Instant,
}

impl ApiState {
    pub fn new(
        store: Arc<dyn InstanceStore>,
        engine: Arc<parking_lot::RwLock<EngineStatus>>,
    ) -> Self {
        Self {
            store,
            engine,
            started_at: Instant::now(),
        }
    }
}

/// Create the router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/status", get(get_status))
        .route("/instances", get(get_instances))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Bind and serve until the task is aborted or the listener fails.
pub async fn run_api(state: Arc<ApiState>, host: &str, port: u16) -> anyhow::Result<()> {
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("Control API listening on {}", addr);

    axum::serve(listener, router(state)).await?;

    Ok(())
}

// ==================== Response Types ====================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub cycles_completed: u64,
    pub cycles_failed: u64,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

// ==================== Handlers ====================

async fn get_health(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let engine = state.engine.read().clone();
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.started_at.elapsed().as_secs(),
        cycles_completed: engine.cycles_completed,
        cycles_failed: engine.cycles_failed,
    })
}

async fn get_status(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(state.engine.read().clone())
}

async fn get_instances(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    match state.store.list_instances().await {
        Ok(instances) => (StatusCode::OK, Json(instances)).into_response(),
        Err(e) => {
            error!("Failed to list instances: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryInstanceStore;

    fn test_state() -> Arc<ApiState> {
        Arc::new(ApiState::new(
            Arc::new(MemoryInstanceStore::new()),
            Arc::new(parking_lot::RwLock::new(EngineStatus::default())),
        ))
    }

    #[test]
    fn test_router_builds() {
        let _ = router(test_state());
    }

    #[test]
    fn test_health_response_serializes() {
        let body = HealthResponse {
            status: "ok",
            version: "0.0.0",
            uptime_secs: 12,
            cycles_completed: 3,
            cycles_failed: 1,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["cycles_completed"], 3);
    }
}

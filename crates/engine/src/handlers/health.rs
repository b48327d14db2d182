//! Health check endpoints.

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};

use crate::db::pool::health_check as db_health_check;
use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    pub status: String,
}

/// Detailed health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiHealthResponse {
    /// Overall health status
    pub status: String,

    /// "connected", "disconnected" or "in_memory"
    pub storage: String,

    /// "nats" or "in_memory"
    pub queue: String,

    pub dispatch_mode: String,

    pub uptime_seconds: u64,

    pub version: String,
}

/// `GET /health`
///
/// Liveness only; returns as soon as the server is up.
pub async fn health_check() -> Json<HealthCheckResponse> {
    Json(HealthCheckResponse {
        status: "ok".to_string(),
    })
}

/// `GET /api/health`
///
/// Reports storage and queue wiring. Returns `503` when the PostgreSQL
/// store does not answer.
pub async fn api_health(State(state): State<AppState>) -> (StatusCode, Json<ApiHealthResponse>) {
    let (storage, healthy) = match &state.db {
        Some(pool) => {
            if db_health_check(pool).await {
                ("connected", true)
            } else {
                ("disconnected", false)
            }
        }
        None => ("in_memory", true),
    };

    let response = ApiHealthResponse {
        status: if healthy { "ok" } else { "unhealthy" }.to_string(),
        storage: storage.to_string(),
        queue: if state.nats { "nats" } else { "in_memory" }.to_string(),
        dispatch_mode: format!("{:?}", state.config.dispatch_mode).to_lowercase(),
        uptime_seconds: state.uptime_seconds(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };

    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(response))
}

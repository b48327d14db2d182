//! HTTP handlers for the engine API.

pub mod callback;
pub mod health;
pub mod runs;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub use health::{api_health, health_check};

/// Build the engine router.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let health_routes = Router::new()
        .route("/health", get(health_check))
        .route("/api/health", get(api_health));

    let run_routes = Router::new()
        .route("/api/runs", post(runs::start))
        .route("/api/runs/{uid}", get(runs::get))
        .route("/api/runs/{uid}/stop", post(runs::stop))
        .route("/api/runs/{uid}/pause", post(runs::pause))
        .route("/api/runs/{uid}/resume", post(runs::resume));

    let callback_routes = Router::new()
        .route("/api/callback", post(callback::accept_result))
        .route(
            "/api/callback/{workflow_instance_uid}/{step_instance_uid}",
            post(callback::accept_step_callback),
        );

    Router::new()
        .merge(health_routes)
        .merge(run_routes)
        .merge(callback_routes)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

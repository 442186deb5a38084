//! Route modules for the learning sync server

pub mod admin;
pub mod health;
pub mod sync;

use axum::{routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the full HTTP application
pub fn app(state: AppState) -> Router {
    // Build CORS layer
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/health", get(health::health_check))
        .nest("/api/v1/sync", sync::router())
        .nest("/api/v1/admin", admin::router())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

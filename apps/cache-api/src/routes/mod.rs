pub mod health;

use axum::{
    routing::{get, post},
    Router,
};

use crate::cache::handlers;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        // Document cache
        .route("/api/v1/cache/lookup", post(handlers::handle_lookup))
        .route("/api/v1/cache/entries", post(handlers::handle_store))
        .route("/api/v1/cache/stats", get(handlers::handle_stats))
        .route(
            "/api/v1/cache/maintenance",
            post(handlers::handle_maintenance),
        )
        // Profile
        .route(
            "/api/v1/profile/content-hash",
            get(handlers::handle_profile_hash),
        )
        .with_state(state)
}

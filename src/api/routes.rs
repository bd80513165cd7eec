//! API Routes
//!
//! Configures the Axum router with all cache admin endpoints.

use axum::{
    routing::{get, post, put},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers::{
    delete_handler, get_handler, health_handler, invalidate_pattern_handler,
    invalidate_tag_handler, metrics_handler, mget_handler, set_handler, AppState,
};

/// Creates the main router with all endpoints configured.
///
/// # Endpoints
/// - `PUT /cache` - Store a JSON value with optional TTL and tags
/// - `GET /cache/:key` - Retrieve a value by key
/// - `DELETE /cache/:key` - Delete a key everywhere
/// - `POST /cache/mget` - Retrieve many keys at once
/// - `POST /invalidate/tag/:tag` - Invalidate every key carrying a tag
/// - `POST /invalidate/pattern` - Invalidate keys matching a glob
/// - `GET /metrics` - Metrics snapshot
/// - `GET /health` - Tier health check
///
/// # Middleware
/// - CORS: Allows any origin (configurable for production)
/// - Tracing: Logs all requests for debugging
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/cache", put(set_handler))
        .route("/cache/mget", post(mget_handler))
        .route("/cache/:key", get(get_handler).delete(delete_handler))
        .route("/invalidate/tag/:tag", post(invalidate_tag_handler))
        .route("/invalidate/pattern", post(invalidate_pattern_handler))
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

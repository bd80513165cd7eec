//! API Module
//!
//! HTTP handlers and routing for the cache admin API.
//!
//! # Endpoints
//! - `PUT /cache` - Store a value
//! - `GET /cache/:key` - Retrieve a value by key
//! - `DELETE /cache/:key` - Delete a key
//! - `POST /cache/mget` - Retrieve many keys
//! - `POST /invalidate/tag/:tag` - Tag invalidation
//! - `POST /invalidate/pattern` - Pattern invalidation
//! - `GET /metrics` - Metrics snapshot
//! - `GET /health` - Health check endpoint

pub mod handlers;
pub mod routes;

pub use handlers::*;
pub use routes::create_router;

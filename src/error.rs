//! Error types for the cache manager
//!
//! Provides unified error handling using thiserror.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

// == Cache Error Enum ==
/// Unified error type for the cache manager.
///
/// Only `Config` is fatal. Every other variant is converted into a miss or a
/// no-op at the `CacheManager` boundary.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Backing store unreachable or a call exceeded its deadline
    #[error("Connection error: {0}")]
    Connection(String),

    /// Payload could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A single entry is larger than the whole memory tier
    #[error("Entry of {size} bytes exceeds memory tier capacity of {capacity} bytes")]
    Capacity { size: usize, capacity: usize },

    /// Publishing to the invalidation bus failed
    #[error("Invalidation error: {0}")]
    Invalidation(String),

    /// Malformed configuration, raised at construction time
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid request data
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Key not found in cache
    #[error("Key not found: {0}")]
    NotFound(String),
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        CacheError::Connection(err.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization(err.to_string())
    }
}

// == IntoResponse Implementation ==
impl IntoResponse for CacheError {
    fn into_response(self) -> Response {
        let status = match &self {
            CacheError::NotFound(_) => StatusCode::NOT_FOUND,
            CacheError::InvalidRequest(_) | CacheError::Serialization(_) => {
                StatusCode::BAD_REQUEST
            }
            CacheError::Connection(_) | CacheError::Invalidation(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            CacheError::Capacity { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            CacheError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": self.to_string()
        }));

        (status, body).into_response()
    }
}

// == Result Type Alias ==
/// Convenience Result type for the cache manager.
pub type Result<T> = std::result::Result<T, CacheError>;

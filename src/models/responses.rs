//! Response DTOs for the cache admin API
//!
//! Defines the structure of outgoing HTTP response bodies. Health and
//! metrics are served straight from `HealthReport` and `MetricsSnapshot`.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;

/// Response body for GET /cache/:key
#[derive(Debug, Clone, Serialize)]
pub struct GetResponse {
    pub key: String,
    pub value: Value,
}

impl GetResponse {
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// Response body for PUT /cache
#[derive(Debug, Clone, Serialize)]
pub struct SetResponse {
    /// Success message
    pub message: String,
    /// The key that was set
    pub key: String,
}

impl SetResponse {
    pub fn new(key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            message: format!("Key '{}' set successfully", key),
            key,
        }
    }
}

/// Response body for DELETE /cache/:key
#[derive(Debug, Clone, Serialize)]
pub struct DeleteResponse {
    pub message: String,
    pub key: String,
}

impl DeleteResponse {
    pub fn new(key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            message: format!("Key '{}' deleted successfully", key),
            key,
        }
    }
}

/// Response body for POST /cache/mget
#[derive(Debug, Clone, Serialize)]
pub struct MgetResponse {
    pub values: HashMap<String, Value>,
    /// Requested keys with no cached value, in request order
    pub missing: Vec<String>,
}

impl MgetResponse {
    pub fn new(requested: &[String], values: HashMap<String, Value>) -> Self {
        let mut missing: Vec<String> = requested
            .iter()
            .filter(|key| !values.contains_key(*key))
            .cloned()
            .collect();
        missing.dedup();
        Self { values, missing }
    }
}

/// Response body for the invalidation endpoints
#[derive(Debug, Clone, Serialize)]
pub struct InvalidateResponse {
    pub message: String,
    /// Number of keys removed
    pub invalidated: usize,
}

impl InvalidateResponse {
    pub fn tag(tag: &str, invalidated: usize) -> Self {
        Self {
            message: format!("Tag '{}' invalidated", tag),
            invalidated,
        }
    }

    pub fn pattern(pattern: &str, invalidated: usize) -> Self {
        Self {
            message: format!("Pattern '{}' invalidated", pattern),
            invalidated,
        }
    }
}

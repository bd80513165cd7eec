//! API Handlers
//!
//! HTTP request handlers for the cache admin endpoints. Every handler is a
//! thin adapter over `CacheManager`.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Json,
};
use serde_json::Value;

use crate::cache::{CacheManager, CacheOptions, HealthReport, MetricsSnapshot};
use crate::error::{CacheError, Result};
use crate::models::{
    DeleteResponse, GetResponse, InvalidateResponse, MgetRequest, MgetResponse, PatternRequest,
    SetRequest, SetResponse,
};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<CacheManager>,
}

impl AppState {
    pub fn new(cache: Arc<CacheManager>) -> Self {
        Self { cache }
    }
}

/// Handler for PUT /cache
///
/// Stores a JSON value with optional TTL and tags.
pub async fn set_handler(
    State(state): State<AppState>,
    Json(req): Json<SetRequest>,
) -> Result<Json<SetResponse>> {
    if let Some(error_msg) = req.validate() {
        return Err(CacheError::InvalidRequest(error_msg));
    }

    state.cache.set(&req.key, &req.value, &req.options()).await?;

    Ok(Json(SetResponse::new(req.key)))
}

/// Handler for GET /cache/:key
pub async fn get_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<GetResponse>> {
    match state.cache.get::<Value>(&key).await {
        Some(value) => Ok(Json(GetResponse::new(key, value))),
        None => Err(CacheError::NotFound(key)),
    }
}

/// Handler for DELETE /cache/:key
///
/// Deleting an absent key still succeeds.
pub async fn delete_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Json<DeleteResponse> {
    state.cache.delete(&key).await;
    Json(DeleteResponse::new(key))
}

/// Handler for POST /cache/mget
pub async fn mget_handler(
    State(state): State<AppState>,
    Json(req): Json<MgetRequest>,
) -> Result<Json<MgetResponse>> {
    if let Some(error_msg) = req.validate() {
        return Err(CacheError::InvalidRequest(error_msg));
    }

    let values: HashMap<String, Value> = state.cache.mget(&req.keys).await;
    Ok(Json(MgetResponse::new(&req.keys, values)))
}

/// Handler for POST /invalidate/tag/:tag
pub async fn invalidate_tag_handler(
    State(state): State<AppState>,
    Path(tag): Path<String>,
) -> Json<InvalidateResponse> {
    let invalidated = state.cache.invalidate_tag(&tag).await;
    Json(InvalidateResponse::tag(&tag, invalidated))
}

/// Handler for POST /invalidate/pattern
pub async fn invalidate_pattern_handler(
    State(state): State<AppState>,
    Json(req): Json<PatternRequest>,
) -> Result<Json<InvalidateResponse>> {
    if let Some(error_msg) = req.validate() {
        return Err(CacheError::InvalidRequest(error_msg));
    }

    let invalidated = state.cache.invalidate_pattern(&req.pattern).await?;
    Ok(Json(InvalidateResponse::pattern(&req.pattern, invalidated)))
}

/// Handler for GET /metrics
pub async fn metrics_handler(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.cache.metrics())
}

/// Handler for GET /health
///
/// Always answers 200; a lost distributed tier shows up as `degraded`.
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthReport> {
    Json(state.cache.health().await)
}

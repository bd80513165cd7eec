//! Integration Tests for API Endpoints
//!
//! Tests the full request/response cycle for each admin endpoint against a
//! manager on the in-process backend.

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tiered_cache::cache::LocalBackend;
use tiered_cache::config::BackendKind;
use tiered_cache::{api::create_router, AppState, CacheManager, Config};
use tower::ServiceExt;

// == Helper Functions ==

async fn create_test_app() -> Router {
    create_router(AppState::new(Arc::new(test_manager(LocalBackend::new()).await)))
}

async fn test_manager(backend: LocalBackend) -> CacheManager {
    let config = Config {
        backend: BackendKind::Local,
        metrics_interval: 0,
        ..Config::default()
    };
    CacheManager::with_backend(config, Arc::new(backend))
        .await
        .unwrap()
}

async fn body_to_json(body: Body) -> Value {
    let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn put_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("PUT")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

// == SET Endpoint Tests ==

#[tokio::test]
async fn test_set_endpoint_success() {
    let app = create_test_app().await;

    let response = app
        .oneshot(put_json(
            "/cache",
            json!({"key": "test_key", "value": {"total": 12}}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let json = body_to_json(response.into_body()).await;
    assert!(json["message"].as_str().unwrap().contains("test_key"));
}

#[tokio::test]
async fn test_set_endpoint_rejects_oversized_key() {
    let app = create_test_app().await;

    let response = app
        .oneshot(put_json(
            "/cache",
            json!({"key": "k".repeat(300), "value": 1}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_to_json(response.into_body()).await;
    assert!(json.get("error").is_some());
}

#[tokio::test]
async fn test_set_endpoint_rejects_malformed_json() {
    let app = create_test_app().await;

    let response = app
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/cache")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"key": "k""#))
                .unwrap(),
        )
        .await
        .unwrap();

    assert!(response.status().is_client_error());
}

// == GET Endpoint Tests ==

#[tokio::test]
async fn test_get_endpoint_round_trip() {
    let app = create_test_app().await;

    let set_response = app
        .clone()
        .oneshot(put_json(
            "/cache",
            json!({"key": "order:42", "value": {"status": "open"}, "ttl": 60, "tags": ["orders"]}),
        ))
        .await
        .unwrap();
    assert_eq!(set_response.status(), StatusCode::OK);

    let get_response = app.oneshot(get("/cache/order:42")).await.unwrap();

    assert_eq!(get_response.status(), StatusCode::OK);
    let json = body_to_json(get_response.into_body()).await;
    assert_eq!(json["key"], "order:42");
    assert_eq!(json["value"]["status"], "open");
}

#[tokio::test]
async fn test_get_endpoint_not_found() {
    let app = create_test_app().await;

    let response = app.oneshot(get("/cache/missing")).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = body_to_json(response.into_body()).await;
    assert!(json["error"].as_str().unwrap().contains("missing"));
}

// == DELETE Endpoint Tests ==

#[tokio::test]
async fn test_delete_endpoint_is_idempotent() {
    let app = create_test_app().await;

    app.clone()
        .oneshot(put_json("/cache", json!({"key": "gone", "value": 1})))
        .await
        .unwrap();

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/cache/gone")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app.oneshot(get("/cache/gone")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// == MGET Endpoint Tests ==

#[tokio::test]
async fn test_mget_endpoint() {
    let app = create_test_app().await;

    for (key, value) in [("a", 1), ("b", 2)] {
        app.clone()
            .oneshot(put_json("/cache", json!({"key": key, "value": value})))
            .await
            .unwrap();
    }

    let response = app
        .oneshot(post_json("/cache/mget", json!({"keys": ["a", "b", "c"]})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["values"]["a"], 1);
    assert_eq!(json["values"]["b"], 2);
    assert_eq!(json["missing"], json!(["c"]));
}

// == Invalidation Endpoint Tests ==

#[tokio::test]
async fn test_invalidate_tag_endpoint() {
    let app = create_test_app().await;

    for key in ["order:1", "order:2"] {
        app.clone()
            .oneshot(put_json(
                "/cache",
                json!({"key": key, "value": 1, "tags": ["orders"]}),
            ))
            .await
            .unwrap();
    }

    let response = app
        .clone()
        .oneshot(post_json("/invalidate/tag/orders", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["invalidated"], 2);

    let response = app.oneshot(get("/cache/order:1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_invalidate_pattern_endpoint() {
    let app = create_test_app().await;

    for key in ["sku:1", "sku:2", "user:1"] {
        app.clone()
            .oneshot(put_json("/cache", json!({"key": key, "value": 1})))
            .await
            .unwrap();
    }

    let response = app
        .clone()
        .oneshot(post_json("/invalidate/pattern", json!({"pattern": "sku:*"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["invalidated"], 2);

    let response = app.oneshot(get("/cache/user:1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_invalidate_pattern_rejects_bad_glob() {
    let app = create_test_app().await;

    let response = app
        .oneshot(post_json("/invalidate/pattern", json!({"pattern": "sku:["})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

// == Health & Metrics Endpoint Tests ==

#[tokio::test]
async fn test_health_endpoint_reports_degraded_backend() {
    let backend = LocalBackend::new();
    let app = create_router(AppState::new(Arc::new(test_manager(backend.clone()).await)));

    let response = app.clone().oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["l2"]["reachable"], true);

    backend.set_failing(true);
    let response = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["status"], "degraded");
    assert_eq!(json["l2"]["reachable"], false);
}

#[tokio::test]
async fn test_metrics_endpoint_counts_operations() {
    let app = create_test_app().await;

    app.clone()
        .oneshot(put_json("/cache", json!({"key": "k", "value": 1})))
        .await
        .unwrap();
    app.clone().oneshot(get("/cache/k")).await.unwrap();
    app.clone().oneshot(get("/cache/other")).await.unwrap();

    let response = app.oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["overall"]["hits"], 1);
    assert_eq!(json["overall"]["misses"], 1);
    assert_eq!(json["overall"]["sets"], 1);
    assert_eq!(json["l1"]["hits"], 1);
    assert!(json["taken_at"].is_string());
}

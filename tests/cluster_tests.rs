//! Multi-Instance Tests
//!
//! Two cache managers sharing one in-process backend behave like two
//! processes attached to the same Redis server.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tiered_cache::cache::{CacheEvent, HealthStatus, LocalBackend};
use tiered_cache::config::BackendKind;
use tiered_cache::{CacheManager, CacheOptions, Config};
use tokio_test::assert_ok;

// == Helper Functions ==

fn test_config() -> Config {
    Config {
        backend: BackendKind::Local,
        metrics_interval: 0,
        ..Config::default()
    }
}

async fn manager(config: Config, backend: &LocalBackend) -> CacheManager {
    CacheManager::with_backend(config, Arc::new(backend.clone()))
        .await
        .unwrap()
}

async fn pair() -> (LocalBackend, CacheManager, CacheManager) {
    let backend = LocalBackend::new();
    let a = manager(test_config(), &backend).await;
    let b = manager(test_config(), &backend).await;
    (backend, a, b)
}

/// Polls `check` until it holds or two seconds pass.
async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Product {
    sku: String,
    stock: u32,
}

// == Single-Instance Scenarios ==

#[tokio::test]
async fn test_inventory_scenario() {
    let (_backend, cache, _peer) = pair().await;
    let options = CacheOptions::new()
        .with_ttl(Duration::from_secs(60))
        .with_tags(["inventory"]);

    assert_ok!(cache.set("sku:ABC", &42, &options).await);
    assert_eq!(cache.get::<i32>("sku:ABC").await, Some(42));

    assert_eq!(cache.invalidate_tag("inventory").await, 1);
    assert_eq!(cache.get::<i32>("sku:ABC").await, None);
}

#[tokio::test]
async fn test_tag_invalidation_leaves_nothing_behind() {
    let backend = LocalBackend::new();
    let cache = manager(test_config(), &backend).await;
    let options = CacheOptions::new().with_tags(["orders"]);

    cache
        .set("order:42", &serde_json::json!({"total": 100}), &options)
        .await
        .unwrap();
    // data key, tag set and key -> tags set
    assert_eq!(backend.key_count(), 3);

    cache.invalidate_tag("orders").await;

    assert_eq!(cache.get::<serde_json::Value>("order:42").await, None);
    assert_eq!(cache.memory_usage().await.entries, 0);
    assert_eq!(backend.key_count(), 0);
}

// == Cross-Instance Invalidation ==

#[tokio::test]
async fn test_pattern_invalidation_reaches_peer_memory() {
    let (_backend, a, b) = pair().await;
    let product = Product {
        sku: "ABC".to_string(),
        stock: 5,
    };

    assert_ok!(a.set("sku:ABC", &product, &CacheOptions::new()).await);
    assert_eq!(b.get::<Product>("sku:ABC").await, Some(product));
    assert_eq!(b.memory_usage().await.entries, 1);

    assert_eq!(a.invalidate_pattern("sku:*").await.unwrap(), 1);

    let b_ref = &b;
    assert!(
        eventually(|| async move { b_ref.memory_usage().await.entries == 0 }).await,
        "peer memory tier still holds sku:ABC"
    );
    assert_eq!(b.get::<Product>("sku:ABC").await, None);
}

#[tokio::test]
async fn test_tag_invalidation_reaches_peer_memory() {
    let (_backend, a, b) = pair().await;
    let options = CacheOptions::new().with_tags(["orders", "customer:7"]);

    a.set("order:42", &42u32, &options).await.unwrap();
    a.set("order:43", &43u32, &CacheOptions::new().with_tags(["orders"]))
        .await
        .unwrap();
    assert_eq!(b.get::<u32>("order:42").await, Some(42));
    assert_eq!(b.get::<u32>("order:43").await, Some(43));

    assert_eq!(a.invalidate_tag("customer:7").await, 1);

    let b_ref = &b;
    assert!(eventually(|| async move { b_ref.memory_usage().await.entries == 1 }).await);
    assert_eq!(b.get::<u32>("order:42").await, None);
    assert_eq!(b.get::<u32>("order:43").await, Some(43));

    // order:42 lost every tag link when it was invalidated
    assert_eq!(b.invalidate_tag("orders").await, 1);
    let a_ref = &a;
    assert!(eventually(|| async move { a_ref.get::<u32>("order:43").await.is_none() }).await);
}

#[tokio::test]
async fn test_peer_purges_tagged_keys_without_reading_tags() {
    let backend = LocalBackend::new();
    let peer_backend = backend.handle();
    let a = manager(test_config(), &backend).await;
    let b = manager(test_config(), &peer_backend).await;
    let options = CacheOptions::new().with_tags(["orders"]);

    a.set("order:1", &1u32, &options).await.unwrap();
    a.set("order:2", &2u32, &options).await.unwrap();
    assert_eq!(b.get::<u32>("order:1").await, Some(1));
    assert_eq!(b.get::<u32>("order:2").await, Some(2));
    let reads_before = peer_backend.set_reads();

    assert_eq!(a.invalidate_tag("orders").await, 2);

    let b_ref = &b;
    assert!(eventually(|| async move { b_ref.memory_usage().await.entries == 0 }).await);
    assert_eq!(peer_backend.set_reads(), reads_before);
    assert!(backend.set_reads() > 0);
}

#[tokio::test]
async fn test_delete_reaches_peer_memory() {
    let (_backend, a, b) = pair().await;

    a.set("session:1", &"alice", &CacheOptions::new()).await.unwrap();
    assert_eq!(b.get::<String>("session:1").await, Some("alice".to_string()));

    a.delete("session:1").await;
    a.delete("session:1").await;

    let b_ref = &b;
    assert!(eventually(|| async move { b_ref.memory_usage().await.entries == 0 }).await);
    assert_eq!(b.get::<String>("session:1").await, None);
}

#[tokio::test]
async fn test_overwrite_is_visible_to_peer_after_invalidation() {
    let (_backend, a, b) = pair().await;
    let options = CacheOptions::new().with_tags(["prices"]);

    a.set("price:1", &100u32, &options).await.unwrap();
    assert_eq!(b.get::<u32>("price:1").await, Some(100));

    a.set("price:1", &120u32, &options).await.unwrap();
    a.invalidate_tag("prices").await;
    let b_ref = &b;
    assert!(eventually(|| async move { b_ref.memory_usage().await.entries == 0 }).await);

    a.set("price:1", &130u32, &options).await.unwrap();
    assert_eq!(b.get::<u32>("price:1").await, Some(130));
}

// == Expiry ==

#[tokio::test]
async fn test_entries_expire_in_both_tiers() {
    let (_backend, a, b) = pair().await;
    let options = CacheOptions::new().with_ttl(Duration::from_secs(1));

    a.set("flash", &1u8, &options).await.unwrap();
    assert_eq!(b.get::<u8>("flash").await, Some(1));

    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert_eq!(a.get::<u8>("flash").await, None);
    assert_eq!(b.get::<u8>("flash").await, None);
}

// == Capacity ==

#[tokio::test]
async fn test_memory_tier_evicts_least_recently_used() {
    let backend = LocalBackend::new();
    let config = Config {
        max_memory_items: 2,
        ..test_config()
    };
    let cache = manager(config, &backend).await;

    cache.set("a", &1, &CacheOptions::new()).await.unwrap();
    cache.set("b", &2, &CacheOptions::new()).await.unwrap();
    assert_eq!(cache.get::<i32>("a").await, Some(1));
    cache.set("c", &3, &CacheOptions::new()).await.unwrap();

    assert_eq!(cache.memory_usage().await.entries, 2);
    assert_eq!(cache.metrics().l1.evictions, 1);

    // "b" was evicted from memory but is still served by the distributed tier
    let mut events = cache.subscribe_events();
    assert_eq!(cache.get::<i32>("b").await, Some(2));
    match events.recv().await.unwrap() {
        CacheEvent::CacheHit { key, .. } => assert_eq!(key, "b"),
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(cache.metrics().l2.hits, 1);
}

#[tokio::test]
async fn test_oversized_value_skips_memory_tier() {
    let backend = LocalBackend::new();
    let config = Config {
        max_memory_bytes: 64,
        ..test_config()
    };
    let cache = manager(config, &backend).await;
    let large = "x".repeat(200);

    assert_ok!(cache.set("large", &large, &CacheOptions::new()).await);
    assert_eq!(cache.memory_usage().await.entries, 0);
    assert_eq!(cache.get::<String>("large").await, Some(large));
}

// == Degradation ==

#[tokio::test]
async fn test_memory_tier_serves_while_backend_is_down() {
    let (backend, a, b) = pair().await;

    backend.set_failing(true);
    assert_ok!(a.set("local-only", &7, &CacheOptions::new()).await);
    assert_eq!(a.get::<i32>("local-only").await, Some(7));
    assert_eq!(b.get::<i32>("local-only").await, None);
    assert_eq!(a.invalidate_tag("anything").await, 0);
    assert_eq!(a.health().await.status, HealthStatus::Degraded);

    backend.set_failing(false);
    assert_eq!(a.health().await.status, HealthStatus::Healthy);
    a.set("shared", &8, &CacheOptions::new()).await.unwrap();
    assert_eq!(b.get::<i32>("shared").await, Some(8));
}

#[tokio::test]
async fn test_slow_backend_is_bounded_by_timeout() {
    let backend = LocalBackend::new();
    let config = Config {
        operation_timeout_ms: 50,
        ..test_config()
    };
    let cache = manager(config, &backend).await;
    cache.set("warm", &1, &CacheOptions::new()).await.unwrap();

    backend.set_latency(Duration::from_millis(500));

    let started = Instant::now();
    assert_eq!(cache.get::<i32>("warm").await, Some(1));
    assert_eq!(cache.get::<i32>("cold").await, None);
    assert!(started.elapsed() < Duration::from_millis(400));
    assert!(cache.metrics().l2.errors >= 1);
}

#[tokio::test]
async fn test_get_or_compute_falls_back_when_backend_is_down() {
    let (backend, a, _b) = pair().await;
    backend.set_failing(true);

    let value: Result<u32, std::convert::Infallible> = a
        .get_or_compute("report:daily", &CacheOptions::new(), || async { Ok(99) })
        .await;
    assert_eq!(value.unwrap(), 99);
    assert_eq!(a.get::<u32>("report:daily").await, Some(99));
}

// == Events ==

#[tokio::test]
async fn test_operations_emit_events() {
    let (_backend, a, _b) = pair().await;
    let mut events = a.subscribe_events();

    a.set("evt", &1, &CacheOptions::new().with_tags(["t"]))
        .await
        .unwrap();
    a.invalidate_tag("t").await;

    let mut names = Vec::new();
    while let Ok(event) = events.try_recv() {
        names.push(event.name());
    }
    assert!(names.contains(&"cacheSet"));
    assert!(names.contains(&"tagInvalidated"));
}

#[tokio::test]
async fn test_shutdown_then_drop() {
    let (_backend, a, b) = pair().await;

    a.shutdown().await;
    b.shutdown().await;
    assert!(a.is_shut_down());
    assert_ne!(a.instance_id(), b.instance_id());
}

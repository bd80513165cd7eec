//! Cache Events Module
//!
//! Structured observability events, delivered to subscribers over a
//! broadcast channel and mirrored into the tracing log.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::cache::MetricsSnapshot;

/// Default event channel capacity
const DEFAULT_CAPACITY: usize = 1024;

/// Storage tier an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    L1,
    L2,
    Bus,
}

/// An event describing a completed cache operation.
///
/// Events are emitted after the operation they describe has finished.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum CacheEvent {
    #[serde(rename_all = "camelCase")]
    CacheHit {
        key: String,
        tier: Tier,
        latency_ms: f64,
    },
    #[serde(rename_all = "camelCase")]
    CacheMiss { key: String, latency_ms: f64 },
    #[serde(rename_all = "camelCase")]
    CacheSet {
        key: String,
        tags: Vec<String>,
        ttl_ms: Option<u64>,
        latency_ms: f64,
    },
    #[serde(rename_all = "camelCase")]
    CacheDelete { key: String, latency_ms: f64 },
    #[serde(rename_all = "camelCase")]
    TagInvalidated {
        tag: String,
        keys: usize,
        latency_ms: f64,
    },
    #[serde(rename_all = "camelCase")]
    PatternInvalidated {
        pattern: String,
        keys: usize,
        latency_ms: f64,
    },
    #[serde(rename_all = "camelCase")]
    CacheError {
        tier: Tier,
        operation: String,
        key: Option<String>,
        message: String,
    },
    MetricsSnapshot(MetricsSnapshot),
}

impl CacheEvent {
    /// Event name as seen by consumers.
    pub fn name(&self) -> &'static str {
        match self {
            CacheEvent::CacheHit { .. } => "cacheHit",
            CacheEvent::CacheMiss { .. } => "cacheMiss",
            CacheEvent::CacheSet { .. } => "cacheSet",
            CacheEvent::CacheDelete { .. } => "cacheDelete",
            CacheEvent::TagInvalidated { .. } => "tagInvalidated",
            CacheEvent::PatternInvalidated { .. } => "patternInvalidated",
            CacheEvent::CacheError { .. } => "cacheError",
            CacheEvent::MetricsSnapshot(_) => "metricsSnapshot",
        }
    }
}

// == Event Emitter ==
/// Fan-out of cache events to any number of subscribers.
///
/// When nobody is subscribed events are only logged. Slow subscribers lose
/// the oldest events once the channel is full.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    sender: broadcast::Sender<CacheEvent>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: CacheEvent) {
        match &event {
            CacheEvent::CacheError {
                tier,
                operation,
                key,
                message,
            } => warn!(?tier, %operation, key = ?key, error = %message, "cache error"),
            CacheEvent::MetricsSnapshot(_) => {}
            other => debug!(event = other.name(), "{:?}", other),
        }
        let _ = self.sender.send(event);
    }

    pub fn error(&self, tier: Tier, operation: &str, key: Option<&str>, message: impl Into<String>) {
        self.emit(CacheEvent::CacheError {
            tier,
            operation: operation.to_string(),
            key: key.map(str::to_string),
            message: message.into(),
        });
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

//! Invalidation Bus Module
//!
//! Cross-instance invalidation over the backing store's pub/sub.
//!
//! ```text
//! Instance A: invalidate_tag("orders")
//!   -> resolve keys in L2, delete from L1 + L2
//!   -> PUBLISH {prefix}invalidate {"origin": A, "keys": [...]}
//! Instance B: listener receives message -> purges keys from its own L1
//! ```
//!
//! Messages carry resolved keys, never the tag or pattern, so peers never
//! query the distributed tier themselves.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::cache::backend::MessageStream;
use crate::cache::events::{EventEmitter, Tier};
use crate::cache::{DistributedTier, MemoryTier, TagIndex};
use crate::error::{CacheError, Result};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Why keys were invalidated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum InvalidationReason {
    Tag(String),
    Pattern(String),
    Key,
}

/// Wire message published on the invalidation channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidationMessage {
    pub origin: Uuid,
    pub keys: Vec<String>,
    pub reason: InvalidationReason,
    pub sent_at: DateTime<Utc>,
}

impl InvalidationMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Publishes invalidations and applies those published by peers.
#[derive(Debug)]
pub struct InvalidationBus {
    tier: Arc<DistributedTier>,
    instance_id: Uuid,
    events: EventEmitter,
}

impl InvalidationBus {
    pub fn new(tier: Arc<DistributedTier>, instance_id: Uuid, events: EventEmitter) -> Self {
        Self {
            tier,
            instance_id,
            events,
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Announces `keys` to every peer.
    ///
    /// Failure is reported as a `cacheError` event and returned as
    /// `CacheError::Invalidation`; local state is never affected.
    pub async fn publish(&self, keys: Vec<String>, reason: InvalidationReason) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let message = InvalidationMessage {
            origin: self.instance_id,
            keys,
            reason,
            sent_at: Utc::now(),
        };

        let outcome = match message.encode() {
            Ok(payload) => self.tier.publish(&payload).await,
            Err(e) => Err(e),
        };
        outcome.map_err(|e| {
            let err = CacheError::Invalidation(e.to_string());
            self.events.error(Tier::Bus, "publish", None, err.to_string());
            err
        })
    }

    /// Opens the subscription. Called once at startup so the channel is live
    /// before the manager is handed out.
    pub async fn subscribe(&self) -> Result<MessageStream> {
        self.tier.subscribe().await
    }

    /// Spawns the listener that purges peer-invalidated keys from `memory`.
    ///
    /// `initial` is the subscription opened at startup, if that succeeded.
    /// When the stream ends or cannot be opened the listener re-subscribes
    /// with exponential backoff. Aborting the handle unsubscribes.
    pub fn spawn_listener(
        self: &Arc<Self>,
        initial: Option<MessageStream>,
        memory: Arc<MemoryTier>,
        tags: Arc<TagIndex>,
    ) -> JoinHandle<()> {
        let bus = Arc::clone(self);

        tokio::spawn(async move {
            let mut backoff = INITIAL_BACKOFF;
            let mut pending = initial;

            loop {
                let stream = match pending.take() {
                    Some(stream) => Ok(stream),
                    None => bus.subscribe().await,
                };

                match stream {
                    Ok(stream) => {
                        backoff = INITIAL_BACKOFF;
                        bus.drain(stream, &memory, &tags).await;
                        warn!("Invalidation subscription closed, reconnecting");
                    }
                    Err(e) => {
                        error!(
                            error = %e,
                            backoff_secs = backoff.as_secs(),
                            "Invalidation listener error, reconnecting..."
                        );
                    }
                }

                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        })
    }

    async fn drain(&self, mut stream: MessageStream, memory: &MemoryTier, tags: &TagIndex) {
        while let Some(payload) = stream.next().await {
            match InvalidationMessage::decode(&payload) {
                Ok(message) => self.apply(message, memory, tags).await,
                Err(e) => {
                    warn!(error = %e, "Failed to parse invalidation message payload");
                    self.events
                        .error(Tier::Bus, "receive", None, e.to_string());
                }
            }
        }
    }

    /// Purges a peer's keys from the local memory tier. Idempotent.
    pub async fn apply(&self, message: InvalidationMessage, memory: &MemoryTier, tags: &TagIndex) {
        if message.origin == self.instance_id {
            return;
        }
        let purged = memory.purge(&message.keys).await;
        tags.forget_local(&message.keys);
        debug!(
            origin = %message.origin,
            keys = message.keys.len(),
            purged,
            reason = ?message.reason,
            "Applied peer invalidation"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheEntry, LocalBackend, MetricsCollector};
    use crate::config::Config;

    fn bus_with(backend: LocalBackend) -> (Arc<InvalidationBus>, Arc<TagIndex>) {
        let tier = Arc::new(DistributedTier::new(
            Arc::new(backend),
            &Config::default(),
            Arc::new(MetricsCollector::new()),
            EventEmitter::new(),
        ));
        let tags = Arc::new(TagIndex::new(tier.clone()));
        let bus = Arc::new(InvalidationBus::new(tier, Uuid::new_v4(), EventEmitter::new()));
        (bus, tags)
    }

    #[test]
    fn test_message_round_trip() {
        let message = InvalidationMessage {
            origin: Uuid::new_v4(),
            keys: vec!["order:42".to_string()],
            reason: InvalidationReason::Tag("orders".to_string()),
            sent_at: Utc::now(),
        };
        let decoded = InvalidationMessage::decode(&message.encode().unwrap()).unwrap();
        assert_eq!(decoded, message);
    }

    #[tokio::test]
    async fn test_apply_ignores_own_messages() {
        let (bus, tags) = bus_with(LocalBackend::new());
        let memory = MemoryTier::new(1024, 10);
        memory.set(CacheEntry::new("k", vec![1], None)).await.unwrap();

        let own = InvalidationMessage {
            origin: bus.instance_id(),
            keys: vec!["k".to_string()],
            reason: InvalidationReason::Key,
            sent_at: Utc::now(),
        };
        bus.apply(own.clone(), &memory, &tags).await;
        assert!(memory.get("k").await.is_some());

        let peer = InvalidationMessage {
            origin: Uuid::new_v4(),
            ..own
        };
        bus.apply(peer.clone(), &memory, &tags).await;
        bus.apply(peer, &memory, &tags).await;
        assert!(memory.get("k").await.is_none());
    }

    #[tokio::test]
    async fn test_listener_purges_peer_keys() {
        let backend = LocalBackend::new();
        let (bus_a, _) = bus_with(backend.clone());
        let (bus_b, tags_b) = bus_with(backend);

        let memory_b = Arc::new(MemoryTier::new(1024, 10));
        memory_b
            .set(CacheEntry::new("sku:ABC", vec![1], None))
            .await
            .unwrap();

        let stream = bus_b.subscribe().await.unwrap();
        let handle = bus_b.spawn_listener(Some(stream), memory_b.clone(), tags_b);

        bus_a
            .publish(vec!["sku:ABC".to_string()], InvalidationReason::Key)
            .await
            .unwrap();

        let mut purged = false;
        for _ in 0..50 {
            if memory_b.get("sku:ABC").await.is_none() {
                purged = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();
        assert!(purged, "peer listener should purge the key");
    }

    #[tokio::test]
    async fn test_publish_failure_is_invalidation_error() {
        let backend = LocalBackend::new();
        let (bus, _) = bus_with(backend.clone());
        backend.set_failing(true);

        let result = bus
            .publish(vec!["k".to_string()], InvalidationReason::Key)
            .await;
        assert!(matches!(result, Err(CacheError::Invalidation(_))));
    }
}

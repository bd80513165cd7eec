//! Cache Module
//!
//! Two-tier cache: a bounded in-process LRU tier (L1) in front of a shared
//! distributed tier (L2), with tag-based and pattern-based invalidation
//! propagated to every process over pub/sub.

mod backend;
mod bus;
mod distributed;
mod entry;
mod events;
mod local_backend;
mod lru;
mod manager;
mod memory;
mod metrics;
mod redis_backend;
mod serializer;
mod tags;


// Re-export public types
pub use backend::{KvBackend, MessageStream, StoredValue, WriteOp};
pub use bus::{InvalidationBus, InvalidationMessage, InvalidationReason};
pub use distributed::{DistributedTier, Namespace};
pub use entry::CacheEntry;
pub use events::{CacheEvent, EventEmitter, Tier};
pub use local_backend::LocalBackend;
pub use lru::LruTracker;
pub use manager::{
    validate_key, CacheManager, CacheOptions, DistributedHealth, HealthReport, HealthStatus,
    MemoryHealth,
};
pub use memory::{MemoryLookup, MemoryTier, MemoryUsage};
pub use metrics::{MetricsCollector, MetricsSnapshot, TierMetrics, TierSnapshot};
pub use redis_backend::RedisBackend;
pub use serializer::Serializer;
pub use tags::TagIndex;

// == Public Constants ==
/// Maximum allowed key length in bytes
pub const MAX_KEY_LENGTH: usize = 256;

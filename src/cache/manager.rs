//! Cache Manager Module
//!
//! Public face of the cache. Composes the memory tier (L1), the distributed
//! tier (L2), the tag index and the invalidation bus behind one API.
//!
//! ```text
//! get:  L1 hit ─────────────────────────────────────> value
//!       L1 miss -> L2 hit -> promote into L1 ───────> value
//!       L1 miss -> L2 miss/unavailable ─────────────> miss
//! set:  L1 write, L2 write, tag links in L2
//! invalidate: resolve keys -> delete L2 -> purge L1 -> publish to peers
//! ```
//!
//! Distributed tier failures never reach callers: they surface as misses,
//! `cacheError` events and error counters.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use glob::Pattern;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::backend::{KvBackend, StoredValue};
use crate::cache::bus::{InvalidationBus, InvalidationReason};
use crate::cache::events::{CacheEvent, EventEmitter, Tier};
use crate::cache::memory::{MemoryLookup, MemoryUsage};
use crate::cache::{
    CacheEntry, DistributedTier, LocalBackend, MemoryTier, MetricsCollector, MetricsSnapshot,
    RedisBackend, Serializer, TagIndex, MAX_KEY_LENGTH,
};
use crate::config::{BackendKind, Config};
use crate::error::{CacheError, Result};
use crate::tasks::{spawn_cleanup_task, spawn_metrics_task};

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_micros() as f64 / 1000.0
}

/// Rejects keys that could never be stored.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(CacheError::InvalidRequest("Key cannot be empty".to_string()));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(CacheError::InvalidRequest(format!(
            "Key exceeds maximum length of {} bytes",
            MAX_KEY_LENGTH
        )));
    }
    Ok(())
}

// == Options ==
/// Per-write options. Unset TTL falls back to the configured default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheOptions {
    pub ttl: Option<Duration>,
    pub tags: Vec<String>,
}

impl CacheOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }
}

// == Health ==
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryHealth {
    pub latency_ms: f64,
    pub entries: usize,
    pub bytes: usize,
    pub max_bytes: usize,
    pub max_items: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DistributedHealth {
    pub backend: &'static str,
    pub reachable: bool,
    pub latency_ms: Option<f64>,
}

/// Result of a live check of both tiers.
///
/// The cache keeps serving from memory while the distributed tier is down,
/// so an unreachable L2 reports `degraded` rather than an error.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub instance_id: Uuid,
    pub l1: MemoryHealth,
    pub l2: DistributedHealth,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct BackgroundTasks {
    listener: Option<JoinHandle<()>>,
    periodic: Vec<JoinHandle<()>>,
}

// == Cache Manager ==
#[derive(Debug)]
pub struct CacheManager {
    config: Config,
    memory: Arc<MemoryTier>,
    distributed: Arc<DistributedTier>,
    tags: Arc<TagIndex>,
    bus: Arc<InvalidationBus>,
    serializer: Serializer,
    metrics: Arc<MetricsCollector>,
    events: EventEmitter,
    tasks: Mutex<BackgroundTasks>,
    shutting_down: AtomicBool,
}

impl CacheManager {
    // == Constructors ==
    /// Connects to the backend named in `config`.
    ///
    /// An unreachable Redis server does not fail startup: the manager comes
    /// up degraded and the bus listener keeps retrying.
    pub async fn connect(config: Config) -> Result<Self> {
        config.validate()?;
        let backend: Arc<dyn KvBackend> = match config.backend {
            BackendKind::Redis => Arc::new(RedisBackend::new(&config.redis_url())?),
            BackendKind::Local => Arc::new(LocalBackend::new()),
        };
        Self::with_backend(config, backend).await
    }

    /// Builds a manager on an existing backend and starts its background tasks.
    pub async fn with_backend(config: Config, backend: Arc<dyn KvBackend>) -> Result<Self> {
        config.validate()?;

        let metrics = Arc::new(MetricsCollector::new());
        let events = EventEmitter::new();
        let memory = Arc::new(MemoryTier::new(
            config.max_memory_bytes,
            config.max_memory_items,
        ));
        let distributed = Arc::new(DistributedTier::new(
            backend,
            &config,
            metrics.clone(),
            events.clone(),
        ));
        let tags = Arc::new(TagIndex::new(distributed.clone()));
        let bus = Arc::new(InvalidationBus::new(
            distributed.clone(),
            Uuid::new_v4(),
            events.clone(),
        ));

        let initial = match bus.subscribe().await {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!(error = %e, "Invalidation bus unavailable at startup, will retry");
                None
            }
        };
        let listener = bus.spawn_listener(initial, memory.clone(), tags.clone());

        let mut periodic = vec![spawn_cleanup_task(memory.clone(), config.cleanup_interval)];
        if config.metrics_interval > 0 {
            periodic.push(spawn_metrics_task(
                metrics.clone(),
                events.clone(),
                config.metrics_interval,
            ));
        }

        info!(
            instance_id = %bus.instance_id(),
            backend = distributed.backend_name(),
            max_memory_bytes = config.max_memory_bytes,
            max_memory_items = config.max_memory_items,
            "Cache manager started"
        );

        Ok(Self {
            serializer: Serializer::new(config.compression_threshold_bytes),
            config,
            memory,
            distributed,
            tags,
            bus,
            metrics,
            events,
            tasks: Mutex::new(BackgroundTasks {
                listener: Some(listener),
                periodic,
            }),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn instance_id(&self) -> Uuid {
        self.bus.instance_id()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    pub async fn memory_usage(&self) -> MemoryUsage {
        self.memory.usage().await
    }

    fn effective_ttl(&self, options: &CacheOptions) -> Option<Duration> {
        options
            .ttl
            .filter(|ttl| !ttl.is_zero())
            .or_else(|| self.config.default_ttl())
    }

    // == Get ==
    /// Returns the cached value for `key`, or `None` on a miss.
    ///
    /// A value that no longer decodes as `T` is reported and treated as a miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let started = Instant::now();

        let found = if validate_key(key).is_ok() {
            self.lookup(key).await
        } else {
            None
        };

        let value = found.and_then(|(bytes, tier)| match self.serializer.deserialize(&bytes) {
            Ok(value) => Some((value, tier)),
            Err(e) => {
                self.events.error(tier, "deserialize", Some(key), e.to_string());
                None
            }
        });

        self.metrics.overall.record_latency(started.elapsed());
        match value {
            Some((value, tier)) => {
                self.metrics.overall.record_hit();
                self.events.emit(CacheEvent::CacheHit {
                    key: key.to_string(),
                    tier,
                    latency_ms: elapsed_ms(started),
                });
                Some(value)
            }
            None => {
                self.metrics.overall.record_miss();
                self.events.emit(CacheEvent::CacheMiss {
                    key: key.to_string(),
                    latency_ms: elapsed_ms(started),
                });
                None
            }
        }
    }

    async fn lookup(&self, key: &str) -> Option<(Vec<u8>, Tier)> {
        let l1_started = Instant::now();
        let lookup = self.memory.get_or_reserve(key).await;
        self.metrics.l1.record_latency(l1_started.elapsed());

        let fill = match lookup {
            MemoryLookup::Hit(bytes) => {
                self.metrics.l1.record_hit();
                return Some((bytes, Tier::L1));
            }
            MemoryLookup::Miss { fill } => fill,
        };
        self.metrics.l1.record_miss();

        match self.distributed.get(key).await {
            Some(stored) => {
                let bytes = stored.data.clone();
                self.promote(key, stored, fill).await;
                Some((bytes, Tier::L2))
            }
            None => {
                self.memory.cancel_fill(key, fill).await;
                None
            }
        }
    }

    /// Copies an L2 value into L1 with the TTL the L2 copy has left.
    async fn promote(&self, key: &str, stored: StoredValue, fill: u64) {
        let entry = CacheEntry::new(key, stored.data, stored.ttl);
        match self.memory.promote(entry, fill).await {
            Ok(Some(evicted)) => self.record_evictions(&evicted),
            Ok(None) => debug!(key = %key, "Skipped promotion, key written concurrently"),
            Err(e) => debug!(key = %key, error = %e, "Value too large to promote"),
        }
    }

    fn record_evictions(&self, evicted: &[String]) {
        if !evicted.is_empty() {
            self.metrics.l1.record_evictions(evicted.len() as u64);
            debug!(count = evicted.len(), "Evicted least recently used entries");
        }
    }

    // == Set ==
    /// Stores `value` in both tiers.
    ///
    /// Only an invalid key or an unserializable value is an error; tier
    /// failures are absorbed.
    pub async fn set<T>(&self, key: &str, value: &T, options: &CacheOptions) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        validate_key(key)?;
        let data = self.serializer.serialize(value)?;
        self.store(key, data, options).await;
        Ok(())
    }

    async fn store(&self, key: &str, data: Vec<u8>, options: &CacheOptions) {
        let started = Instant::now();
        let ttl = self.effective_ttl(options);
        let tags: BTreeSet<String> = options.tags.iter().cloned().collect();

        self.write_memory(key, data.clone(), ttl, &tags).await;
        self.distributed.set(key, data, ttl).await;
        // an untagged write still drops the links of the value it replaced
        self.tags.set_tags(key, &tags, ttl).await;

        self.metrics.overall.record_set();
        self.metrics.overall.record_latency(started.elapsed());
        self.events.emit(CacheEvent::CacheSet {
            key: key.to_string(),
            tags: tags.into_iter().collect(),
            ttl_ms: ttl.map(|ttl| ttl.as_millis() as u64),
            latency_ms: elapsed_ms(started),
        });
    }

    async fn write_memory(
        &self,
        key: &str,
        data: Vec<u8>,
        ttl: Option<Duration>,
        tags: &BTreeSet<String>,
    ) {
        let started = Instant::now();
        let entry = CacheEntry::new(key, data, ttl).with_tags(tags.iter().cloned());
        match self.memory.set(entry).await {
            Ok(evicted) => {
                self.metrics.l1.record_set();
                self.record_evictions(&evicted);
            }
            Err(e) => {
                self.metrics.l1.record_error();
                self.events.error(Tier::L1, "set", Some(key), e.to_string());
            }
        }
        self.metrics.l1.record_latency(started.elapsed());
    }

    // == Delete ==
    /// Removes `key` from both tiers and from peers' memory tiers. Idempotent.
    pub async fn delete(&self, key: &str) {
        let started = Instant::now();
        if validate_key(key).is_err() {
            return;
        }
        let keys = vec![key.to_string()];

        // L2 before L1, so a concurrent read cannot promote the old value back
        self.distributed.delete(&keys).await;
        self.tags.forget_key(key).await;
        if self.memory.delete(key).await {
            self.metrics.l1.record_delete();
        }
        let _ = self.bus.publish(keys, InvalidationReason::Key).await;

        self.metrics.overall.record_delete();
        self.metrics.overall.record_latency(started.elapsed());
        self.events.emit(CacheEvent::CacheDelete {
            key: key.to_string(),
            latency_ms: elapsed_ms(started),
        });
    }

    // == Get Or Compute ==
    /// Returns the cached value, or runs `compute`, caches and returns its result.
    ///
    /// A compute error is returned unchanged and nothing is cached. Concurrent
    /// callers missing on the same key each run `compute`.
    pub async fn get_or_compute<T, E, F, Fut>(
        &self,
        key: &str,
        options: &CacheOptions,
        compute: F,
    ) -> std::result::Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        if let Some(value) = self.get(key).await {
            return Ok(value);
        }

        let value = compute().await?;
        if let Err(e) = self.set(key, &value, options).await {
            warn!(key = %key, error = %e, "Computed value could not be cached");
        }
        Ok(value)
    }

    // == Multi Get ==
    /// Looks up many keys at once. Missing keys are absent from the result.
    pub async fn mget<T, K>(&self, keys: &[K]) -> HashMap<String, T>
    where
        T: DeserializeOwned,
        K: AsRef<str>,
    {
        let started = Instant::now();

        let mut found: HashMap<String, (Vec<u8>, Tier)> = HashMap::with_capacity(keys.len());
        let mut misses = Vec::new();
        let mut fills = HashMap::new();
        let mut seen = HashSet::with_capacity(keys.len());
        let mut requested = Vec::with_capacity(keys.len());
        for key in keys.iter().map(AsRef::as_ref) {
            if !seen.insert(key) {
                continue;
            }
            requested.push(key);
            if validate_key(key).is_err() {
                continue;
            }
            match self.memory.get_or_reserve(key).await {
                MemoryLookup::Hit(bytes) => {
                    self.metrics.l1.record_hit();
                    found.insert(key.to_string(), (bytes, Tier::L1));
                }
                MemoryLookup::Miss { fill } => {
                    self.metrics.l1.record_miss();
                    misses.push(key.to_string());
                    fills.insert(key.to_string(), fill);
                }
            }
        }
        self.metrics.l1.record_latency(started.elapsed());

        if !misses.is_empty() {
            for (key, stored) in self.distributed.mget(&misses).await {
                if let Some(fill) = fills.remove(&key) {
                    let bytes = stored.data.clone();
                    self.promote(&key, stored, fill).await;
                    found.insert(key, (bytes, Tier::L2));
                }
            }
            for (key, fill) in fills {
                self.memory.cancel_fill(&key, fill).await;
            }
        }

        let mut values = HashMap::with_capacity(found.len());
        for key in requested {
            let decoded = found.remove(key).and_then(|(bytes, tier)| {
                match self.serializer.deserialize::<T>(&bytes) {
                    Ok(value) => Some((value, tier)),
                    Err(e) => {
                        self.events.error(tier, "deserialize", Some(key), e.to_string());
                        None
                    }
                }
            });
            match decoded {
                Some((value, tier)) => {
                    self.metrics.overall.record_hit();
                    self.events.emit(CacheEvent::CacheHit {
                        key: key.to_string(),
                        tier,
                        latency_ms: elapsed_ms(started),
                    });
                    values.insert(key.to_string(), value);
                }
                None => {
                    self.metrics.overall.record_miss();
                    self.events.emit(CacheEvent::CacheMiss {
                        key: key.to_string(),
                        latency_ms: elapsed_ms(started),
                    });
                }
            }
        }
        self.metrics.overall.record_latency(started.elapsed());
        values
    }

    // == Multi Set ==
    /// Stores many values with shared options. Returns how many reached the
    /// distributed tier.
    ///
    /// Every key and value is checked before anything is written.
    pub async fn mset<T, I, K>(&self, pairs: I, options: &CacheOptions) -> Result<usize>
    where
        T: Serialize,
        I: IntoIterator<Item = (K, T)>,
        K: Into<String>,
    {
        let started = Instant::now();
        let mut encoded = Vec::new();
        for (key, value) in pairs {
            let key = key.into();
            validate_key(&key)?;
            encoded.push((key, self.serializer.serialize(&value)?));
        }

        let ttl = self.effective_ttl(options);
        let tags: BTreeSet<String> = options.tags.iter().cloned().collect();

        for (key, data) in &encoded {
            self.write_memory(key, data.clone(), ttl, &tags).await;
        }
        let keys: Vec<String> = encoded.iter().map(|(key, _)| key.clone()).collect();
        let stored = self
            .distributed
            .mset(encoded.into_iter().map(|(key, data)| (key, data, ttl)).collect())
            .await;
        self.tags.set_tags_many(&keys, &tags, ttl).await;

        for key in &keys {
            self.metrics.overall.record_set();
            self.events.emit(CacheEvent::CacheSet {
                key: key.clone(),
                tags: tags.iter().cloned().collect(),
                ttl_ms: ttl.map(|ttl| ttl.as_millis() as u64),
                latency_ms: elapsed_ms(started),
            });
        }
        self.metrics.overall.record_latency(started.elapsed());
        Ok(stored)
    }

    // == Invalidate Tag ==
    /// Removes every entry carrying `tag`, here and on every peer.
    /// Returns the number of keys invalidated.
    pub async fn invalidate_tag(&self, tag: &str) -> usize {
        let started = Instant::now();

        let in_memory: BTreeSet<String> = self.memory.keys_tagged(tag).await.into_iter().collect();
        let mut linked: BTreeSet<String> = self.tags.resolve(tag).await.into_iter().collect();
        linked.extend(self.tags.local_keys(tag));
        linked.extend(in_memory.iter().cloned());
        let linked: Vec<String> = linked.into_iter().collect();

        // tag set members whose own key -> tags link is gone have expired
        let links = self.tags.links(&linked).await;
        let keys: Vec<String> = match &links {
            Some(links) => linked
                .iter()
                .filter(|key| {
                    in_memory.contains(*key)
                        || links.get(*key).map_or(false, |tags| tags.iter().any(|t| t == tag))
                })
                .cloned()
                .collect(),
            None => linked.clone(),
        };

        if !keys.is_empty() {
            self.distributed.delete(&keys).await;
        }
        self.memory.purge(&keys).await;
        self.tags.clear_tag(tag, &linked, links.as_ref()).await;
        let _ = self
            .bus
            .publish(keys.clone(), InvalidationReason::Tag(tag.to_string()))
            .await;

        info!(tag = %tag, keys = keys.len(), "Invalidated tag");
        self.events.emit(CacheEvent::TagInvalidated {
            tag: tag.to_string(),
            keys: keys.len(),
            latency_ms: elapsed_ms(started),
        });
        keys.len()
    }

    // == Invalidate Pattern ==
    /// Removes every entry whose key matches the glob `pattern`, here and on
    /// every peer. Returns the number of keys invalidated.
    ///
    /// The distributed scan stops after `max_pattern_matches` keys.
    pub async fn invalidate_pattern(&self, pattern: &str) -> Result<usize> {
        let started = Instant::now();
        let matcher = Pattern::new(pattern)
            .map_err(|e| CacheError::InvalidRequest(format!("invalid pattern '{pattern}': {e}")))?;

        let mut keys: BTreeSet<String> = self
            .distributed
            .scan_keys(pattern)
            .await
            .unwrap_or_default()
            .into_iter()
            .collect();
        keys.extend(self.memory.keys_matching(&matcher).await);
        let keys: Vec<String> = keys.into_iter().collect();

        if !keys.is_empty() {
            self.distributed.delete(&keys).await;
        }
        self.memory.purge(&keys).await;
        self.tags.forget_local(&keys);
        let _ = self
            .bus
            .publish(keys.clone(), InvalidationReason::Pattern(pattern.to_string()))
            .await;

        info!(pattern = %pattern, keys = keys.len(), "Invalidated pattern");
        self.events.emit(CacheEvent::PatternInvalidated {
            pattern: pattern.to_string(),
            keys: keys.len(),
            latency_ms: elapsed_ms(started),
        });
        Ok(keys.len())
    }

    // == Health ==
    pub async fn health(&self) -> HealthReport {
        let started = Instant::now();
        let usage = self.memory.usage().await;
        let l1_latency = elapsed_ms(started);

        let ping = self.distributed.ping().await;
        let status = if ping.is_some() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };

        HealthReport {
            status,
            instance_id: self.instance_id(),
            l1: MemoryHealth {
                latency_ms: l1_latency,
                entries: usage.entries,
                bytes: usage.bytes,
                max_bytes: self.memory.max_bytes(),
                max_items: self.memory.max_items(),
            },
            l2: DistributedHealth {
                backend: self.distributed.backend_name(),
                reachable: ping.is_some(),
                latency_ms: ping.map(|latency| latency.as_micros() as f64 / 1000.0),
            },
            checked_at: Utc::now(),
        }
    }

    // == Metrics ==
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    // == Shutdown ==
    /// Stops the bus listener and background tasks, then closes backend
    /// connections. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down cache manager...");

        let (listener, periodic) = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
            (tasks.listener.take(), std::mem::take(&mut tasks.periodic))
        };

        if let Some(listener) = listener {
            listener.abort();
            let _ = listener.await;
            info!("Unsubscribed from invalidation bus");
        }
        for task in periodic {
            task.abort();
            let _ = task.await;
        }

        self.distributed.close().await;
        info!("Cache manager shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}

impl Drop for CacheManager {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(|p| p.into_inner());
        if let Some(listener) = tasks.listener.take() {
            listener.abort();
        }
        for task in tasks.periodic.drain(..) {
            task.abort();
        }
    }
}

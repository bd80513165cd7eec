//! Distributed Tier Module
//!
//! The shared L2 tier. Wraps a `KvBackend` with key namespacing, per-call
//! deadlines, chunked batches and failure-to-miss conversion: no backend
//! failure ever reaches the caller as an error.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::timeout;
use tracing::warn;

use crate::cache::backend::{KvBackend, MessageStream, StoredValue, WriteOp};
use crate::cache::events::{EventEmitter, Tier};
use crate::cache::MetricsCollector;
use crate::config::Config;
use crate::error::{CacheError, Result};

// == Namespace ==
/// Maps cache keys, tags and the bus channel into the deployment's keyspace.
#[derive(Debug, Clone)]
pub struct Namespace {
    prefix: String,
}

impl Namespace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn data_key(&self, key: &str) -> String {
        format!("{}data:{}", self.prefix, key)
    }

    /// Inverse of `data_key`.
    pub fn cache_key<'a>(&self, stored: &'a str) -> Option<&'a str> {
        stored
            .strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix("data:"))
    }

    /// Set of keys carrying `tag`.
    pub fn tag_key(&self, tag: &str) -> String {
        format!("{}tag:{}", self.prefix, tag)
    }

    /// Set of tags carried by `key`.
    pub fn key_tags_key(&self, key: &str) -> String {
        format!("{}keytags:{}", self.prefix, key)
    }

    pub fn channel(&self) -> String {
        format!("{}invalidate", self.prefix)
    }

    /// Glob matching data keys whose cache key matches `pattern`.
    pub fn data_pattern(&self, pattern: &str) -> String {
        let mut escaped = String::with_capacity(self.prefix.len() + pattern.len() + 5);
        for ch in self.prefix.chars() {
            if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
                escaped.push('\\');
            }
            escaped.push(ch);
        }
        escaped.push_str("data:");
        escaped.push_str(pattern);
        escaped
    }
}

// == Distributed Tier ==
pub struct DistributedTier {
    backend: Arc<dyn KvBackend>,
    namespace: Namespace,
    timeout: Duration,
    batch_size: usize,
    scan_count: usize,
    max_matches: usize,
    metrics: Arc<MetricsCollector>,
    events: EventEmitter,
}

impl DistributedTier {
    pub fn new(
        backend: Arc<dyn KvBackend>,
        config: &Config,
        metrics: Arc<MetricsCollector>,
        events: EventEmitter,
    ) -> Self {
        Self {
            backend,
            namespace: Namespace::new(config.key_prefix.clone()),
            timeout: config.operation_timeout(),
            batch_size: config.batch_size,
            scan_count: config.scan_count,
            max_matches: config.max_pattern_matches,
            metrics,
            events,
        }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Runs one backend call under the deadline. Failures are counted,
    /// reported as `cacheError` events and turned into `None`.
    async fn call<T, F>(&self, operation: &str, key: Option<&str>, fut: F) -> Option<T>
    where
        F: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let result = match timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Connection(format!(
                "{operation} exceeded {}ms deadline",
                self.timeout.as_millis()
            ))),
        };
        self.metrics.l2.record_latency(started.elapsed());

        match result {
            Ok(value) => Some(value),
            Err(e) => {
                self.metrics.l2.record_error();
                self.events.error(Tier::L2, operation, key, e.to_string());
                None
            }
        }
    }

    // == Get ==
    pub async fn get(&self, key: &str) -> Option<StoredValue> {
        let stored = vec![self.namespace.data_key(key)];
        let value = self
            .call("get", Some(key), self.backend.get_many(&stored))
            .await
            .and_then(|mut values| values.pop().flatten());

        match value {
            Some(_) => self.metrics.l2.record_hit(),
            None => self.metrics.l2.record_miss(),
        }
        value
    }

    // == Multi Get ==
    /// Reads `keys` in pipelined chunks. A failed chunk only loses its own keys.
    pub async fn mget(&self, keys: &[String]) -> HashMap<String, StoredValue> {
        let mut found = HashMap::with_capacity(keys.len());

        for chunk in keys.chunks(self.batch_size) {
            let stored: Vec<String> = chunk.iter().map(|k| self.namespace.data_key(k)).collect();
            let values = self
                .call("mget", None, self.backend.get_many(&stored))
                .await
                .unwrap_or_default();

            for (i, key) in chunk.iter().enumerate() {
                match values.get(i).cloned().flatten() {
                    Some(value) => {
                        self.metrics.l2.record_hit();
                        found.insert(key.clone(), value);
                    }
                    None => self.metrics.l2.record_miss(),
                }
            }
        }
        found
    }

    // == Set ==
    pub async fn set(&self, key: &str, data: Vec<u8>, ttl: Option<Duration>) -> bool {
        let ops = [WriteOp::Set {
            key: self.namespace.data_key(key),
            value: data,
            ttl,
        }];
        let stored = self.call("set", Some(key), self.backend.exec(&ops)).await.is_some();
        if stored {
            self.metrics.l2.record_set();
        }
        stored
    }

    // == Multi Set ==
    /// Writes entries in pipelined chunks. Returns how many were stored.
    pub async fn mset(&self, items: Vec<(String, Vec<u8>, Option<Duration>)>) -> usize {
        let mut stored = 0;

        for chunk in items.chunks(self.batch_size) {
            let ops: Vec<WriteOp> = chunk
                .iter()
                .map(|(key, data, ttl)| WriteOp::Set {
                    key: self.namespace.data_key(key),
                    value: data.clone(),
                    ttl: *ttl,
                })
                .collect();
            if self.call("mset", None, self.backend.exec(&ops)).await.is_some() {
                for _ in chunk {
                    self.metrics.l2.record_set();
                }
                stored += chunk.len();
            }
        }
        stored
    }

    // == Delete ==
    /// Deletes the data entries for `keys`. Deleting absent keys succeeds.
    pub async fn delete(&self, keys: &[String]) -> bool {
        let mut all_ok = true;

        for chunk in keys.chunks(self.batch_size) {
            let ops = [WriteOp::Delete {
                keys: chunk.iter().map(|k| self.namespace.data_key(k)).collect(),
            }];
            let key = (chunk.len() == 1).then(|| chunk[0].as_str());
            if self.call("delete", key, self.backend.exec(&ops)).await.is_some() {
                for _ in chunk {
                    self.metrics.l2.record_delete();
                }
            } else {
                all_ok = false;
            }
        }
        all_ok
    }

    /// Applies already-namespaced ops atomically.
    pub async fn exec(&self, operation: &str, key: Option<&str>, ops: &[WriteOp]) -> bool {
        self.call(operation, key, self.backend.exec(ops)).await.is_some()
    }

    /// Members of an already-namespaced set, `None` when the store failed.
    pub async fn members(&self, set_key: &str) -> Option<Vec<String>> {
        self.call("smembers", None, self.backend.set_members(set_key)).await
    }

    /// Members of several already-namespaced sets, pipelined in chunks.
    /// `None` when any chunk failed.
    pub async fn members_many(&self, set_keys: &[String]) -> Option<Vec<Vec<String>>> {
        let mut all = Vec::with_capacity(set_keys.len());
        for chunk in set_keys.chunks(self.batch_size) {
            let members = self
                .call("smembers", None, self.backend.set_members_many(chunk))
                .await?;
            all.extend(members);
        }
        Some(all)
    }

    // == Scan ==
    /// Cache keys matching the glob `pattern`, gathered by cursor scan.
    ///
    /// Stops at the configured match cap; returns `None` if the store failed
    /// before the scan completed.
    pub async fn scan_keys(&self, pattern: &str) -> Option<Vec<String>> {
        let glob = self.namespace.data_pattern(pattern);
        let mut keys = Vec::new();
        let mut cursor = 0u64;

        loop {
            let (next, batch) = self
                .call("scan", None, self.backend.scan(&glob, cursor, self.scan_count))
                .await?;

            for stored in batch {
                if let Some(key) = self.namespace.cache_key(&stored) {
                    keys.push(key.to_string());
                }
            }

            if keys.len() >= self.max_matches {
                warn!(
                    pattern = %pattern,
                    cap = self.max_matches,
                    "Pattern scan hit the match cap, remaining keys left in place"
                );
                keys.truncate(self.max_matches);
                break;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }

        keys.sort();
        keys.dedup();
        Some(keys)
    }

    // == Pub/Sub ==
    pub async fn publish(&self, payload: &[u8]) -> Result<()> {
        let channel = self.namespace.channel();
        match timeout(self.timeout, self.backend.publish(&channel, payload)).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Connection(format!(
                "publish exceeded {}ms deadline",
                self.timeout.as_millis()
            ))),
        }
    }

    pub async fn subscribe(&self) -> Result<MessageStream> {
        let channel = self.namespace.channel();
        match timeout(self.timeout, self.backend.subscribe(&channel)).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Connection(format!(
                "subscribe exceeded {}ms deadline",
                self.timeout.as_millis()
            ))),
        }
    }

    // == Health ==
    /// Round-trip latency to the backing store.
    pub async fn ping(&self) -> Option<Duration> {
        let started = Instant::now();
        self.call("ping", None, self.backend.ping())
            .await
            .map(|_| started.elapsed())
    }

    pub async fn close(&self) {
        self.backend.close().await;
    }
}

impl std::fmt::Debug for DistributedTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedTier")
            .field("backend", &self.backend.name())
            .field("prefix", &self.namespace.prefix())
            .field("timeout", &self.timeout)
            .finish()
    }
}

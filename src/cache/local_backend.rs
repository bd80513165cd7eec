//! Local Backend Module
//!
//! In-process `KvBackend` with Redis-like semantics. Clones share state, so
//! several cache managers holding clones behave like processes attached to
//! the same server. Failure and latency injection support degradation tests.
//! Each handle counts its own set reads so tests can tell which manager
//! consulted the tag index.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::stream;
use glob::Pattern;
use tokio::sync::broadcast;
use tracing::warn;

use crate::cache::backend::{KvBackend, MessageStream, StoredValue, WriteOp};
use crate::error::{CacheError, Result};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug)]
struct StoredEntry {
    data: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

#[derive(Debug, Default)]
struct Keyspace {
    values: HashMap<String, StoredEntry>,
    sets: HashMap<String, HashSet<String>>,
    set_expiry: HashMap<String, Instant>,
}

impl Keyspace {
    fn purge_expired(&mut self, now: Instant) {
        self.values.retain(|_, entry| entry.is_live(now));
        let expired: Vec<String> = self
            .set_expiry
            .iter()
            .filter(|(_, at)| now >= **at)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.set_expiry.remove(&key);
            self.sets.remove(&key);
        }
    }

    fn apply(&mut self, op: &WriteOp, now: Instant) {
        match op {
            WriteOp::Set { key, value, ttl } => {
                self.sets.remove(key);
                self.set_expiry.remove(key);
                self.values.insert(
                    key.clone(),
                    StoredEntry {
                        data: value.clone(),
                        expires_at: ttl.map(|ttl| now + ttl),
                    },
                );
            }
            WriteOp::Delete { keys } => {
                for key in keys {
                    self.values.remove(key);
                    self.sets.remove(key);
                    self.set_expiry.remove(key);
                }
            }
            WriteOp::SetAdd { key, members } => {
                self.values.remove(key);
                self.sets
                    .entry(key.clone())
                    .or_default()
                    .extend(members.iter().cloned());
            }
            WriteOp::SetAddExtend { key, member, ttl } => {
                self.values.remove(key);
                let existed = self.sets.contains_key(key);
                self.sets
                    .entry(key.clone())
                    .or_default()
                    .insert(member.clone());
                match ttl {
                    None => {
                        self.set_expiry.remove(key);
                    }
                    Some(ttl) => {
                        let wanted = now + *ttl;
                        let current = self.set_expiry.get(key).copied();
                        if !existed || current.map_or(false, |at| at < wanted) {
                            self.set_expiry.insert(key.clone(), wanted);
                        }
                    }
                }
            }
            WriteOp::SetRemove { key, members } => {
                if let Some(set) = self.sets.get_mut(key) {
                    for member in members {
                        set.remove(member);
                    }
                    if set.is_empty() {
                        self.sets.remove(key);
                        self.set_expiry.remove(key);
                    }
                }
            }
            WriteOp::Expire { key, ttl } => {
                if let Some(entry) = self.values.get_mut(key) {
                    entry.expires_at = Some(now + *ttl);
                } else if self.sets.contains_key(key) {
                    self.set_expiry.insert(key.clone(), now + *ttl);
                }
            }
        }
    }

    fn all_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .values
            .keys()
            .chain(self.sets.keys())
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}

#[derive(Debug, Default)]
struct Shared {
    keyspace: Mutex<Keyspace>,
    channels: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
    failing: AtomicBool,
    latency_ms: AtomicU64,
}

/// Turns a Redis MATCH pattern into a `glob` pattern. Redis escapes
/// metacharacters with a backslash, glob with a one-character class.
fn glob_from_redis(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(escaped @ ('*' | '?' | '[' | ']')) => {
                out.push('[');
                out.push(escaped);
                out.push(']');
            }
            Some(escaped) => out.push(escaped),
            None => out.push('\\'),
        }
    }
    out
}

/// In-process stand-in for a shared Redis server.
#[derive(Debug, Clone, Default)]
pub struct LocalBackend {
    shared: Arc<Shared>,
    set_reads: Arc<AtomicU64>,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Another connection to the same keyspace with its own set-read counter.
    pub fn handle(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            set_reads: Arc::default(),
        }
    }

    /// Set reads (SMEMBERS) issued through this handle and its clones.
    pub fn set_reads(&self) -> u64 {
        self.set_reads.load(Ordering::SeqCst)
    }

    /// When set, every data and pub/sub call fails with a connection error.
    pub fn set_failing(&self, failing: bool) {
        self.shared.failing.store(failing, Ordering::SeqCst);
    }

    /// Adds an artificial delay to every call.
    pub fn set_latency(&self, latency: Duration) {
        self.shared
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of live keys, sets included.
    pub fn key_count(&self) -> usize {
        let mut keyspace = self.keyspace();
        keyspace.purge_expired(Instant::now());
        keyspace.values.len() + keyspace.sets.len()
    }

    fn keyspace(&self) -> MutexGuard<'_, Keyspace> {
        self.shared
            .keyspace
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn enter(&self, operation: &str) -> Result<()> {
        let latency = self.shared.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.shared.failing.load(Ordering::SeqCst) {
            return Err(CacheError::Connection(format!(
                "local backend unavailable during {operation}"
            )));
        }
        Ok(())
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Vec<u8>> {
        let mut channels = self
            .shared
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl KvBackend for LocalBackend {
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<StoredValue>>> {
        self.enter("get").await?;
        let now = Instant::now();
        let keyspace = self.keyspace();

        Ok(keys
            .iter()
            .map(|key| {
                keyspace
                    .values
                    .get(key)
                    .filter(|entry| entry.is_live(now))
                    .map(|entry| StoredValue {
                        data: entry.data.clone(),
                        ttl: entry.expires_at.map(|at| at.saturating_duration_since(now)),
                    })
            })
            .collect())
    }

    async fn exec(&self, ops: &[WriteOp]) -> Result<()> {
        self.enter("exec").await?;
        let now = Instant::now();
        let mut keyspace = self.keyspace();
        keyspace.purge_expired(now);
        for op in ops {
            keyspace.apply(op, now);
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let mut members = self.set_members_many(&[key.to_string()]).await?;
        Ok(members.pop().unwrap_or_default())
    }

    async fn set_members_many(&self, keys: &[String]) -> Result<Vec<Vec<String>>> {
        self.enter("smembers").await?;
        self.set_reads.fetch_add(keys.len() as u64, Ordering::SeqCst);
        let mut keyspace = self.keyspace();
        keyspace.purge_expired(Instant::now());

        Ok(keys
            .iter()
            .map(|key| {
                let mut members: Vec<String> = keyspace
                    .sets
                    .get(key)
                    .map(|set| set.iter().cloned().collect())
                    .unwrap_or_default();
                members.sort();
                members
            })
            .collect())
    }

    async fn scan(&self, pattern: &str, cursor: u64, count: usize) -> Result<(u64, Vec<String>)> {
        self.enter("scan").await?;
        let matcher = Pattern::new(&glob_from_redis(pattern))
            .map_err(|e| CacheError::InvalidRequest(format!("invalid pattern '{pattern}': {e}")))?;

        let mut keyspace = self.keyspace();
        keyspace.purge_expired(Instant::now());
        let all = keyspace.all_keys();

        let start = cursor as usize;
        let end = (start + count.max(1)).min(all.len());
        let page = all
            .get(start..end)
            .unwrap_or_default()
            .iter()
            .filter(|key| matcher.matches(key))
            .cloned()
            .collect();
        let next = if end >= all.len() { 0 } else { end as u64 };
        Ok((next, page))
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        self.enter("publish").await?;
        // no subscribers is not an error
        let _ = self.sender(channel).send(payload.to_vec());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream> {
        self.enter("subscribe").await?;
        let receiver = self.sender(channel).subscribe();

        let stream = stream::unfold(receiver, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => return Some((payload, rx)),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Invalidation stream lagged by {} messages", n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(stream))
    }

    async fn ping(&self) -> Result<()> {
        self.enter("ping").await
    }

    async fn close(&self) {}

    fn name(&self) -> &'static str {
        "local"
    }
}

//! Memory Tier Module
//!
//! Bounded per-process cache (L1) combining HashMap storage with LRU tracking
//! and lazy TTL expiration.

use std::collections::HashMap;

use glob::Pattern;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::cache::entry::current_timestamp_ms;
use crate::cache::{CacheEntry, LruTracker};
use crate::error::{CacheError, Result};

/// Reservations older than this are dropped by the expiry sweep.
const FILL_TIMEOUT_MS: u64 = 60_000;

/// Outcome of a memory tier lookup that may be followed by a fill.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryLookup {
    Hit(Vec<u8>),
    /// Absent; pass `fill` back to `promote` or `cancel_fill`
    Miss { fill: u64 },
}

/// Current occupancy of the memory tier.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct MemoryUsage {
    pub entries: usize,
    pub bytes: usize,
}

#[derive(Debug, Default)]
struct MemoryState {
    entries: HashMap<String, CacheEntry>,
    lru: LruTracker,
    total_bytes: usize,
    /// Outstanding fills from a slower tier, by key
    fills: HashMap<String, PendingFill>,
    next_fill: u64,
}

#[derive(Debug, Clone, Copy)]
struct PendingFill {
    token: u64,
    reserved_at: u64,
}

impl MemoryState {
    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.lru.remove(key);
        self.total_bytes -= entry.size_bytes;
        Some(entry)
    }
}

// == Memory Tier ==
/// In-process LRU cache bounded by both byte size and item count.
///
/// Reads, writes, evictions and the expiry sweep all go through one mutex,
/// so every mutation is linearized.
#[derive(Debug)]
pub struct MemoryTier {
    state: Mutex<MemoryState>,
    max_bytes: usize,
    max_items: usize,
}

impl MemoryTier {
    // == Constructor ==
    pub fn new(max_bytes: usize, max_items: usize) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            max_bytes,
            max_items,
        }
    }

    // == Get ==
    /// Returns the payload for `key` and refreshes its recency.
    ///
    /// Expired entries are removed on sight and reported as absent.
    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let mut state = self.state.lock().await;

        let expired = state.entries.get(key)?.is_expired();
        if expired {
            state.remove(key);
            return None;
        }

        state.lru.touch(key);
        state.entries.get(key).map(|entry| entry.value.clone())
    }

    // == Set ==
    /// Stores an entry, replacing any previous entry for the same key.
    ///
    /// Least recently used entries are evicted until the new entry fits.
    /// Returns the keys that were evicted. An entry larger than the whole
    /// tier is rejected with `CacheError::Capacity`, and any older value for
    /// that key is dropped so it can never be served again.
    pub async fn set(&self, entry: CacheEntry) -> Result<Vec<String>> {
        let mut state = self.state.lock().await;
        Self::insert(&mut state, entry, self.max_bytes, self.max_items)
    }

    /// Looks `key` up and, on a miss, reserves a fill for it in the same
    /// critical section.
    ///
    /// Any later set, delete or purge of `key` cancels the reservation, so a
    /// value read from a slower tier before that write can never be promoted
    /// over it. Writes to other keys leave it alone.
    pub async fn get_or_reserve(&self, key: &str) -> MemoryLookup {
        let mut state = self.state.lock().await;

        let now = current_timestamp_ms();
        let live = match state.entries.get(key) {
            Some(entry) => !entry.is_expired_at(now),
            None => false,
        };
        if live {
            state.lru.touch(key);
            if let Some(entry) = state.entries.get(key) {
                return MemoryLookup::Hit(entry.value.clone());
            }
        }
        state.remove(key);

        state.next_fill += 1;
        let token = state.next_fill;
        state.fills.insert(
            key.to_string(),
            PendingFill {
                token,
                reserved_at: now,
            },
        );
        MemoryLookup::Miss { fill: token }
    }

    /// Stores an entry read from a slower tier if its reservation is still
    /// current. Returns `Ok(None)` when the key was written in the meantime.
    pub async fn promote(&self, entry: CacheEntry, fill: u64) -> Result<Option<Vec<String>>> {
        let mut state = self.state.lock().await;
        let current = matches!(state.fills.get(&entry.key), Some(pending) if pending.token == fill);
        if !current {
            return Ok(None);
        }
        Self::insert(&mut state, entry, self.max_bytes, self.max_items).map(Some)
    }

    /// Releases a reservation that will not be promoted.
    pub async fn cancel_fill(&self, key: &str, fill: u64) {
        let mut state = self.state.lock().await;
        if matches!(state.fills.get(key), Some(pending) if pending.token == fill) {
            state.fills.remove(key);
        }
    }

    fn insert(
        state: &mut MemoryState,
        entry: CacheEntry,
        max_bytes: usize,
        max_items: usize,
    ) -> Result<Vec<String>> {
        state.fills.remove(&entry.key);
        state.remove(&entry.key);

        if entry.size_bytes > max_bytes {
            return Err(CacheError::Capacity {
                size: entry.size_bytes,
                capacity: max_bytes,
            });
        }

        let mut evicted = Vec::new();
        while state.total_bytes + entry.size_bytes > max_bytes
            || state.entries.len() + 1 > max_items
        {
            match state.lru.evict_oldest() {
                Some(victim) => {
                    if let Some(old) = state.entries.remove(&victim) {
                        state.total_bytes -= old.size_bytes;
                    }
                    evicted.push(victim);
                }
                None => break,
            }
        }

        state.total_bytes += entry.size_bytes;
        state.lru.touch(&entry.key);
        state.entries.insert(entry.key.clone(), entry);

        Ok(evicted)
    }

    // == Delete ==
    /// Removes an entry by key. Returns whether anything was removed.
    pub async fn delete(&self, key: &str) -> bool {
        let mut state = self.state.lock().await;
        state.fills.remove(key);
        state.remove(key).is_some()
    }

    // == Purge ==
    /// Removes every listed key; absent keys are ignored.
    pub async fn purge<S: AsRef<str>>(&self, keys: &[S]) -> usize {
        let mut state = self.state.lock().await;
        keys.iter()
            .filter(|key| {
                state.fills.remove(key.as_ref());
                state.remove(key.as_ref()).is_some()
            })
            .count()
    }

    /// Keys of live entries carrying `tag`.
    pub async fn keys_tagged(&self, tag: &str) -> Vec<String> {
        let state = self.state.lock().await;
        let now = current_timestamp_ms();
        state
            .entries
            .values()
            .filter(|entry| entry.tags.contains(tag) && !entry.is_expired_at(now))
            .map(|entry| entry.key.clone())
            .collect()
    }

    /// Keys of entries whose key matches `pattern`.
    pub async fn keys_matching(&self, pattern: &Pattern) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .entries
            .keys()
            .filter(|key| pattern.matches(key))
            .cloned()
            .collect()
    }

    // == Cleanup Expired ==
    /// Removes all expired entries. Returns the number removed.
    pub async fn cleanup_expired(&self) -> usize {
        let mut state = self.state.lock().await;
        let now = current_timestamp_ms();

        let expired_keys: Vec<String> = state
            .entries
            .values()
            .filter(|entry| entry.is_expired_at(now))
            .map(|entry| entry.key.clone())
            .collect();

        for key in &expired_keys {
            state.remove(key);
        }
        // reservations whose reader went away
        state
            .fills
            .retain(|_, pending| now.saturating_sub(pending.reserved_at) < FILL_TIMEOUT_MS);
        expired_keys.len()
    }

    pub async fn usage(&self) -> MemoryUsage {
        let state = self.state.lock().await;
        MemoryUsage {
            entries: state.entries.len(),
            bytes: state.total_bytes,
        }
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn max_items(&self) -> usize {
        self.max_items
    }
}

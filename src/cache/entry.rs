//! Cache Entry Module
//!
//! Defines the structure for individual memory tier entries with TTL support.

use std::collections::BTreeSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

// == Cache Entry ==
/// A single memory tier entry: the encoded payload plus its metadata.
///
/// Each tier owns its own copy; a later `set` replaces the whole entry.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Cache key (without namespace prefix)
    pub key: String,
    /// Encoded payload as produced by the serializer
    pub value: Vec<u8>,
    /// Bytes charged against the memory tier budget (key + payload)
    pub size_bytes: usize,
    /// Creation timestamp (Unix milliseconds)
    pub created_at: u64,
    /// Expiration timestamp (Unix milliseconds), None = no expiration
    pub expires_at: Option<u64>,
    /// Group labels attached by the writer
    pub tags: BTreeSet<String>,
}

impl CacheEntry {
    // == Constructor ==
    /// Creates a new cache entry with optional TTL.
    pub fn new(key: impl Into<String>, value: Vec<u8>, ttl: Option<Duration>) -> Self {
        let key = key.into();
        let now = current_timestamp_ms();
        let expires_at = ttl.map(|ttl| now + ttl.as_millis() as u64);
        let size_bytes = key.len() + value.len();

        Self {
            key,
            value,
            size_bytes,
            created_at: now,
            expires_at,
            tags: BTreeSet::new(),
        }
    }

    /// Attaches tags to the entry.
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    // == Is Expired ==
    /// Checks if the entry has expired.
    ///
    /// An entry is expired once the current time reaches `expires_at`.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(current_timestamp_ms())
    }

    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        match self.expires_at {
            Some(expires) => now_ms >= expires,
            None => false,
        }
    }
}

// == Utility Functions ==
/// Returns current Unix timestamp in milliseconds.
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn test_entry_creation_no_ttl() {
        let entry = CacheEntry::new("k", b"value".to_vec(), None);

        assert_eq!(entry.value, b"value");
        assert_eq!(entry.size_bytes, 1 + 5);
        assert!(entry.expires_at.is_none());
        assert!(!entry.is_expired());
    }

    #[test]
    fn test_entry_with_tags() {
        let entry = CacheEntry::new("order:1", vec![1], None).with_tags(["orders", "shop:7"]);
        assert!(entry.tags.contains("orders"));
        assert!(entry.tags.contains("shop:7"));
    }

    #[test]
    fn test_entry_expiration() {
        let entry = CacheEntry::new("k", vec![1], Some(Duration::from_millis(200)));

        assert!(!entry.is_expired());
        sleep(Duration::from_millis(250));
        assert!(entry.is_expired());
    }

    #[test]
    fn test_expiration_boundary_condition() {
        let now = current_timestamp_ms();
        let mut entry = CacheEntry::new("k", vec![1], None);
        entry.expires_at = Some(now);

        assert!(entry.is_expired_at(now), "Entry should be expired at boundary");
        assert!(!entry.is_expired_at(now - 1));
    }
}

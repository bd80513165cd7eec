//! Backing Store Module
//!
//! The primitive operations the distributed tier needs from a
//! Redis-compatible key/value service.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::Stream;

use crate::error::Result;

/// Stream of raw pub/sub payloads.
pub type MessageStream = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

/// A value read from the backing store with its remaining time to live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredValue {
    pub data: Vec<u8>,
    /// `None` when the key has no expiry
    pub ttl: Option<Duration>,
}

/// One write in an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Set {
        key: String,
        value: Vec<u8>,
        ttl: Option<Duration>,
    },
    Delete {
        keys: Vec<String>,
    },
    SetAdd {
        key: String,
        members: Vec<String>,
    },
    /// Adds `member` and keeps the set alive at least until `ttl` from now.
    /// `None` makes the set persistent.
    SetAddExtend {
        key: String,
        member: String,
        ttl: Option<Duration>,
    },
    SetRemove {
        key: String,
        members: Vec<String>,
    },
    Expire {
        key: String,
        ttl: Duration,
    },
}

/// Key/value + set + pub/sub primitives of the shared store.
///
/// Implementations report failures as `CacheError::Connection`; timeouts and
/// failure-to-miss conversion are the caller's concern.
#[async_trait]
pub trait KvBackend: Send + Sync + 'static {
    /// Reads several keys in one round trip. Output order matches `keys`.
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<StoredValue>>>;

    /// Applies every op or none of them.
    async fn exec(&self, ops: &[WriteOp]) -> Result<()>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>>;

    /// Members of several sets in one round trip. Output order matches `keys`.
    async fn set_members_many(&self, keys: &[String]) -> Result<Vec<Vec<String>>>;

    /// One step of a cursor-based key scan. A returned cursor of 0 ends the scan.
    async fn scan(&self, pattern: &str, cursor: u64, count: usize) -> Result<(u64, Vec<String>)>;

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()>;

    async fn subscribe(&self, channel: &str) -> Result<MessageStream>;

    async fn ping(&self) -> Result<()>;

    /// Releases connections held by this handle.
    async fn close(&self);

    fn name(&self) -> &'static str;
}

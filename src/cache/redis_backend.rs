//! Redis Backend Module
//!
//! `KvBackend` over a Redis-compatible server. Data commands share one
//! auto-reconnecting multiplexed connection; every subscription gets its own
//! pub/sub connection.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Value};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::cache::backend::{KvBackend, MessageStream, StoredValue, WriteOp};
use crate::error::{CacheError, Result};

/// Redis-backed distributed store.
pub struct RedisBackend {
    client: Client,
    connection: Mutex<Option<ConnectionManager>>,
}

impl RedisBackend {
    /// Creates a backend for `url` without connecting.
    ///
    /// An unparsable URL is a configuration error; an unreachable server is not,
    /// the connection is established on first use.
    pub fn new(url: &str) -> Result<Self> {
        let client = Client::open(url)
            .map_err(|e| CacheError::Config(format!("invalid backing store address: {e}")))?;
        Ok(Self {
            client,
            connection: Mutex::new(None),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.client.get_connection_manager().await?;
        info!("Connected to backing store");
        *guard = Some(conn.clone());
        Ok(conn)
    }
}

/// SADD that only ever lengthens the set's expiry. A member without TTL
/// makes the whole set persistent.
const SADD_EXTEND_SCRIPT: &str = r#"
local existed = redis.call('EXISTS', KEYS[1])
redis.call('SADD', KEYS[1], ARGV[1])
local ttl = tonumber(ARGV[2])
if ttl < 0 then
  redis.call('PERSIST', KEYS[1])
else
  local current = redis.call('PTTL', KEYS[1])
  if existed == 0 or (current >= 0 and current < ttl) then
    redis.call('PEXPIRE', KEYS[1], ttl)
  end
end
return 1
"#;

fn ttl_from_pttl(pttl: i64) -> Option<Duration> {
    // -1: no expiry, -2: missing key
    (pttl >= 0).then(|| Duration::from_millis(pttl as u64))
}

#[async_trait]
impl KvBackend for RedisBackend {
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<StoredValue>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.connection().await?;

        let mut pipe = redis::pipe();
        for key in keys {
            pipe.get(key).pttl(key);
        }
        let replies: Vec<Value> = pipe.query_async(&mut conn).await?;

        replies
            .chunks(2)
            .map(|pair| {
                let [data, pttl] = pair else {
                    return Err(CacheError::Connection(
                        "truncated pipeline reply".to_string(),
                    ));
                };
                let data: Option<Vec<u8>> = redis::from_redis_value(data)?;
                let pttl: i64 = redis::from_redis_value(pttl)?;
                Ok(data.map(|data| StoredValue {
                    data,
                    ttl: ttl_from_pttl(pttl),
                }))
            })
            .collect()
    }

    async fn exec(&self, ops: &[WriteOp]) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection().await?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in ops {
            match op {
                WriteOp::Set {
                    key,
                    value,
                    ttl: Some(ttl),
                } => {
                    let millis = (ttl.as_millis() as u64).max(1);
                    pipe.pset_ex(key, value.as_slice(), millis).ignore();
                }
                WriteOp::Set {
                    key,
                    value,
                    ttl: None,
                } => {
                    pipe.set(key, value.as_slice()).ignore();
                }
                WriteOp::Delete { keys } if !keys.is_empty() => {
                    pipe.del(keys).ignore();
                }
                WriteOp::SetAdd { key, members } if !members.is_empty() => {
                    pipe.sadd(key, members).ignore();
                }
                WriteOp::SetAddExtend { key, member, ttl } => {
                    let millis = ttl.map_or(-1, |ttl| (ttl.as_millis() as i64).max(1));
                    pipe.cmd("EVAL")
                        .arg(SADD_EXTEND_SCRIPT)
                        .arg(1)
                        .arg(key)
                        .arg(member)
                        .arg(millis)
                        .ignore();
                }
                WriteOp::SetRemove { key, members } if !members.is_empty() => {
                    pipe.srem(key, members).ignore();
                }
                WriteOp::Expire { key, ttl } => {
                    let millis = (ttl.as_millis() as i64).max(1);
                    pipe.pexpire(key, millis).ignore();
                }
                _ => {}
            }
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.connection().await?;
        let members: Vec<String> = conn.smembers(key).await?;
        Ok(members)
    }

    async fn set_members_many(&self, keys: &[String]) -> Result<Vec<Vec<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.connection().await?;

        let mut pipe = redis::pipe();
        for key in keys {
            pipe.smembers(key);
        }
        let members: Vec<Vec<String>> = pipe.query_async(&mut conn).await?;
        Ok(members)
    }

    async fn scan(&self, pattern: &str, cursor: u64, count: usize) -> Result<(u64, Vec<String>)> {
        let mut conn = self.connection().await?;
        let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;
        Ok((next, keys))
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        let mut conn = self.connection().await?;
        let receivers: i64 = conn.publish(channel, payload).await?;
        debug!(channel = %channel, receivers, "published invalidation");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        info!(channel = %channel, "Subscribed to invalidation channel");

        let stream = pubsub
            .into_on_message()
            .map(|msg| msg.get_payload_bytes().to_vec());
        Ok(Box::pin(stream))
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn close(&self) {
        if self.connection.lock().await.take().is_some() {
            info!("Closed backing store connection");
        }
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("address", &self.client.get_connection_info().addr)
            .finish()
    }
}

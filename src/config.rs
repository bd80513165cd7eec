//! Configuration Module
//!
//! Handles loading and validating cache configuration from environment variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{CacheError, Result};

/// Which implementation backs the distributed tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Redis-compatible network service shared by all instances
    Redis,
    /// In-process store, for single-node deployments and tests
    Local,
}

impl FromStr for BackendKind {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(BackendKind::Redis),
            "local" | "memory" => Ok(BackendKind::Local),
            other => Err(CacheError::Config(format!("unknown cache backend '{other}'"))),
        }
    }
}

/// Cache configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Upper bound on the total payload bytes held by the memory tier
    pub max_memory_bytes: usize,
    /// Upper bound on the number of entries held by the memory tier
    pub max_memory_items: usize,
    /// Default TTL in seconds for entries without explicit TTL (0 = never expire)
    pub default_ttl: u64,
    /// Encoded payloads larger than this are gzip-compressed
    pub compression_threshold_bytes: usize,
    /// Namespace prepended to every backing-store key
    pub key_prefix: String,
    /// Distributed tier implementation
    pub backend: BackendKind,
    /// Full connection URL; overrides host/port/password/db when set
    pub redis_url: Option<String>,
    pub redis_host: String,
    pub redis_port: u16,
    pub redis_password: Option<String>,
    pub redis_db: u32,
    /// Deadline for every distributed tier call, in milliseconds
    pub operation_timeout_ms: u64,
    /// Maximum keys per pipelined batch
    pub batch_size: usize,
    /// COUNT hint passed to each SCAN step
    pub scan_count: usize,
    /// Hard cap on keys matched by a single pattern invalidation
    pub max_pattern_matches: usize,
    /// Memory tier expiry sweep interval in seconds
    pub cleanup_interval: u64,
    /// Metrics snapshot interval in seconds (0 = disabled)
    pub metrics_interval: u64,
    /// Admin HTTP server port
    pub server_port: u16,
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `CACHE_MAX_MEMORY_BYTES` (default: 64 MiB)
    /// - `CACHE_MAX_MEMORY_ITEMS` (default: 10000)
    /// - `CACHE_DEFAULT_TTL` - seconds (default: 300)
    /// - `CACHE_COMPRESSION_THRESHOLD` - bytes (default: 1024)
    /// - `CACHE_KEY_PREFIX` (default: `bizdash:`)
    /// - `CACHE_BACKEND` - `redis` or `local` (default: redis)
    /// - `REDIS_URL`, or `REDIS_HOST` / `REDIS_PORT` / `REDIS_PASSWORD` / `REDIS_DB`
    /// - `CACHE_OPERATION_TIMEOUT_MS` (default: 2000)
    /// - `CACHE_BATCH_SIZE` (default: 100)
    /// - `CACHE_SCAN_COUNT` (default: 500)
    /// - `CACHE_MAX_PATTERN_MATCHES` (default: 10000)
    /// - `CACHE_CLEANUP_INTERVAL` - seconds (default: 1)
    /// - `CACHE_METRICS_INTERVAL` - seconds (default: 60)
    /// - `SERVER_PORT` (default: 3000)
    ///
    /// Unparsable values are a fatal configuration error.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds a Config from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            max_memory_bytes: parse_or(&lookup, "CACHE_MAX_MEMORY_BYTES", defaults.max_memory_bytes)?,
            max_memory_items: parse_or(&lookup, "CACHE_MAX_MEMORY_ITEMS", defaults.max_memory_items)?,
            default_ttl: parse_or(&lookup, "CACHE_DEFAULT_TTL", defaults.default_ttl)?,
            compression_threshold_bytes: parse_or(
                &lookup,
                "CACHE_COMPRESSION_THRESHOLD",
                defaults.compression_threshold_bytes,
            )?,
            key_prefix: lookup("CACHE_KEY_PREFIX").unwrap_or(defaults.key_prefix),
            backend: parse_or(&lookup, "CACHE_BACKEND", defaults.backend)?,
            redis_url: lookup("REDIS_URL").filter(|v| !v.is_empty()),
            redis_host: lookup("REDIS_HOST").unwrap_or(defaults.redis_host),
            redis_port: parse_or(&lookup, "REDIS_PORT", defaults.redis_port)?,
            redis_password: lookup("REDIS_PASSWORD").filter(|v| !v.is_empty()),
            redis_db: parse_or(&lookup, "REDIS_DB", defaults.redis_db)?,
            operation_timeout_ms: parse_or(
                &lookup,
                "CACHE_OPERATION_TIMEOUT_MS",
                defaults.operation_timeout_ms,
            )?,
            batch_size: parse_or(&lookup, "CACHE_BATCH_SIZE", defaults.batch_size)?,
            scan_count: parse_or(&lookup, "CACHE_SCAN_COUNT", defaults.scan_count)?,
            max_pattern_matches: parse_or(
                &lookup,
                "CACHE_MAX_PATTERN_MATCHES",
                defaults.max_pattern_matches,
            )?,
            cleanup_interval: parse_or(&lookup, "CACHE_CLEANUP_INTERVAL", defaults.cleanup_interval)?,
            metrics_interval: parse_or(&lookup, "CACHE_METRICS_INTERVAL", defaults.metrics_interval)?,
            server_port: parse_or(&lookup, "SERVER_PORT", defaults.server_port)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks the invariants the cache relies on.
    pub fn validate(&self) -> Result<()> {
        if self.max_memory_bytes == 0 || self.max_memory_items == 0 {
            return Err(CacheError::Config(
                "memory tier capacity must be greater than zero".to_string(),
            ));
        }
        if self.operation_timeout_ms == 0 {
            return Err(CacheError::Config(
                "operation timeout must be greater than zero".to_string(),
            ));
        }
        if self.batch_size == 0 || self.scan_count == 0 || self.max_pattern_matches == 0 {
            return Err(CacheError::Config(
                "batch size, scan count and match cap must be greater than zero".to_string(),
            ));
        }
        if self.cleanup_interval == 0 {
            return Err(CacheError::Config(
                "cleanup interval must be greater than zero".to_string(),
            ));
        }
        if self.backend == BackendKind::Redis {
            redis::Client::open(self.redis_url()).map_err(|e| {
                CacheError::Config(format!("invalid backing store address: {e}"))
            })?;
        }
        Ok(())
    }

    /// Connection URL for the backing store.
    pub fn redis_url(&self) -> String {
        if let Some(url) = &self.redis_url {
            return url.clone();
        }
        match &self.redis_password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.redis_host, self.redis_port, self.redis_db
            ),
            None => format!(
                "redis://{}:{}/{}",
                self.redis_host, self.redis_port, self.redis_db
            ),
        }
    }

    /// Default TTL as a duration, `None` when entries should not expire.
    pub fn default_ttl(&self) -> Option<Duration> {
        (self.default_ttl > 0).then(|| Duration::from_secs(self.default_ttl))
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

fn parse_or<F, T>(lookup: &F, name: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| CacheError::Config(format!("{name} has an invalid value '{raw}'"))),
        None => Ok(default),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_memory_bytes: 64 * 1024 * 1024,
            max_memory_items: 10_000,
            default_ttl: 300,
            compression_threshold_bytes: 1024,
            key_prefix: "bizdash:".to_string(),
            backend: BackendKind::Redis,
            redis_url: None,
            redis_host: "127.0.0.1".to_string(),
            redis_port: 6379,
            redis_password: None,
            redis_db: 0,
            operation_timeout_ms: 2000,
            batch_size: 100,
            scan_count: 500,
            max_pattern_matches: 10_000,
            cleanup_interval: 1,
            metrics_interval: 60,
            server_port: 3000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.max_memory_items, 10_000);
        assert_eq!(config.default_ttl, 300);
        assert_eq!(config.server_port, 3000);
        assert_eq!(config.cleanup_interval, 1);
        assert_eq!(config.backend, BackendKind::Redis);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_lookup_defaults() {
        let config = Config::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.max_memory_bytes, 64 * 1024 * 1024);
        assert_eq!(config.key_prefix, "bizdash:");
        assert_eq!(config.redis_url(), "redis://127.0.0.1:6379/0");
    }

    #[test]
    fn test_config_overrides() {
        let config = Config::from_lookup(lookup_from(&[
            ("CACHE_MAX_MEMORY_ITEMS", "50"),
            ("CACHE_KEY_PREFIX", "staging:"),
            ("CACHE_BACKEND", "local"),
            ("REDIS_PASSWORD", "secret"),
            ("REDIS_HOST", "cache.internal"),
        ]))
        .unwrap();
        assert_eq!(config.max_memory_items, 50);
        assert_eq!(config.key_prefix, "staging:");
        assert_eq!(config.backend, BackendKind::Local);
        assert_eq!(config.redis_url(), "redis://:secret@cache.internal:6379/0");
    }

    #[test]
    fn test_config_unparsable_value_is_fatal() {
        let result = Config::from_lookup(lookup_from(&[("CACHE_DEFAULT_TTL", "soon")]));
        assert!(matches!(result, Err(CacheError::Config(_))));
    }

    #[test]
    fn test_config_bad_redis_url_is_fatal() {
        let result = Config::from_lookup(lookup_from(&[("REDIS_URL", "not a url")]));
        assert!(matches!(result, Err(CacheError::Config(_))));
    }

    #[test]
    fn test_config_zero_capacity_rejected() {
        let config = Config {
            max_memory_items: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_ttl_zero_means_no_expiry() {
        let config = Config {
            default_ttl: 0,
            ..Config::default()
        };
        assert!(config.default_ttl().is_none());
    }
}

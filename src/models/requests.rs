//! Request DTOs for the cache admin API
//!
//! Defines the structure of incoming HTTP request bodies.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::cache::{validate_key, CacheOptions};

/// Upper bound on keys in one multi-get request
pub const MAX_MGET_KEYS: usize = 1000;

/// Request body for PUT /cache
///
/// # Fields
/// - `key`: The cache key to store the value under
/// - `value`: Any JSON value
/// - `ttl`: Optional TTL in seconds (uses default if not specified)
/// - `tags`: Tags for group invalidation
#[derive(Debug, Clone, Deserialize)]
pub struct SetRequest {
    pub key: String,
    pub value: Value,
    #[serde(default)]
    pub ttl: Option<u64>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl SetRequest {
    /// Returns an error message if validation fails, None if valid.
    pub fn validate(&self) -> Option<String> {
        if let Err(e) = validate_key(&self.key) {
            return Some(e.to_string());
        }
        if self.tags.iter().any(|tag| tag.is_empty()) {
            return Some("Tags cannot be empty".to_string());
        }
        None
    }

    pub fn options(&self) -> CacheOptions {
        let mut options = CacheOptions::new().with_tags(self.tags.iter().cloned());
        if let Some(ttl) = self.ttl {
            options = options.with_ttl(Duration::from_secs(ttl));
        }
        options
    }
}

/// Request body for POST /cache/mget
#[derive(Debug, Clone, Deserialize)]
pub struct MgetRequest {
    pub keys: Vec<String>,
}

impl MgetRequest {
    pub fn validate(&self) -> Option<String> {
        if self.keys.is_empty() {
            return Some("At least one key is required".to_string());
        }
        if self.keys.len() > MAX_MGET_KEYS {
            return Some(format!("At most {} keys per request", MAX_MGET_KEYS));
        }
        None
    }
}

/// Request body for POST /invalidate/pattern
#[derive(Debug, Clone, Deserialize)]
pub struct PatternRequest {
    /// Glob over cache keys, e.g. `sku:*`
    pub pattern: String,
}

impl PatternRequest {
    pub fn validate(&self) -> Option<String> {
        if self.pattern.is_empty() {
            return Some("Pattern cannot be empty".to_string());
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_request_deserialize() {
        let json = r#"{"key": "order:42", "value": {"total": 99.5}}"#;
        let req: SetRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.key, "order:42");
        assert_eq!(req.value["total"], 99.5);
        assert!(req.ttl.is_none());
        assert!(req.tags.is_empty());
    }

    #[test]
    fn test_set_request_options() {
        let json = r#"{"key": "order:42", "value": 1, "ttl": 60, "tags": ["orders"]}"#;
        let req: SetRequest = serde_json::from_str(json).unwrap();
        let options = req.options();
        assert_eq!(options.ttl, Some(Duration::from_secs(60)));
        assert_eq!(options.tags, vec!["orders".to_string()]);
    }

    #[test]
    fn test_validate_empty_key() {
        let req = SetRequest {
            key: "".to_string(),
            value: Value::Null,
            ttl: None,
            tags: vec![],
        };
        assert!(req.validate().is_some());
    }

    #[test]
    fn test_validate_empty_tag() {
        let req = SetRequest {
            key: "k".to_string(),
            value: Value::Null,
            ttl: None,
            tags: vec!["".to_string()],
        };
        assert!(req.validate().is_some());
    }

    #[test]
    fn test_mget_request_limits() {
        assert!(MgetRequest { keys: vec![] }.validate().is_some());
        assert!(MgetRequest {
            keys: vec!["a".to_string()]
        }
        .validate()
        .is_none());
        assert!(MgetRequest {
            keys: vec!["a".to_string(); MAX_MGET_KEYS + 1]
        }
        .validate()
        .is_some());
    }

    #[test]
    fn test_pattern_request_validate() {
        let req: PatternRequest = serde_json::from_str(r#"{"pattern": "sku:*"}"#).unwrap();
        assert!(req.validate().is_none());
        assert!(PatternRequest {
            pattern: String::new()
        }
        .validate()
        .is_some());
    }
}

//! Tiered Cache - A two-tier cache manager for horizontally scaled services
//!
//! Serves reads from a bounded in-process LRU tier backed by a shared
//! distributed tier, with tag and pattern invalidation propagated to every
//! process over pub/sub.

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod models;
pub mod tasks;

pub use api::AppState;
pub use cache::{CacheManager, CacheOptions};
pub use config::Config;
pub use error::{CacheError, Result};

//! Background Tasks Module
//!
//! Periodic work started alongside each cache manager.
//!
//! # Tasks
//! - Expiry sweep: Removes expired memory tier entries at configured intervals
//! - Metrics report: Publishes a metrics snapshot at configured intervals

mod cleanup;
mod metrics;

pub use cleanup::spawn_cleanup_task;
pub use metrics::spawn_metrics_task;

//! Expiry Sweep Task
//!
//! Background task that periodically removes expired memory tier entries.
//! Reads already skip expired entries; the sweep only reclaims their space.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::MemoryTier;

/// Spawns a background task that periodically sweeps expired entries.
///
/// The task runs until aborted, sleeping for the specified interval between
/// sweeps.
///
/// # Arguments
/// * `memory` - shared memory tier to sweep
/// * `cleanup_interval_secs` - interval in seconds between sweeps
///
/// # Example
/// ```ignore
/// let memory = Arc::new(MemoryTier::new(64 * 1024 * 1024, 10_000));
/// let cleanup_handle = spawn_cleanup_task(memory.clone(), 1);
/// // Later, during shutdown:
/// cleanup_handle.abort();
/// ```
pub fn spawn_cleanup_task(memory: Arc<MemoryTier>, cleanup_interval_secs: u64) -> JoinHandle<()> {
    let interval = Duration::from_secs(cleanup_interval_secs);

    tokio::spawn(async move {
        info!(
            "Starting expiry sweep with interval of {} seconds",
            cleanup_interval_secs
        );

        loop {
            tokio::time::sleep(interval).await;

            let removed = memory.cleanup_expired().await;

            if removed > 0 {
                info!("Expiry sweep: removed {} expired entries", removed);
            } else {
                debug!("Expiry sweep: no expired entries found");
            }
        }
    })
}

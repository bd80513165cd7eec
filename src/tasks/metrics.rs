//! Metrics Report Task
//!
//! Background task that periodically publishes a `metricsSnapshot` event and
//! logs a one-line summary.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::info;

use crate::cache::{CacheEvent, EventEmitter, MetricsCollector};

/// Spawns a background task that reports a metrics snapshot every
/// `interval_secs` seconds until aborted.
pub fn spawn_metrics_task(
    metrics: Arc<MetricsCollector>,
    events: EventEmitter,
    interval_secs: u64,
) -> JoinHandle<()> {
    let interval = Duration::from_secs(interval_secs);

    tokio::spawn(async move {
        info!(
            "Starting metrics report with interval of {} seconds",
            interval_secs
        );

        loop {
            tokio::time::sleep(interval).await;

            let snapshot = metrics.snapshot();
            info!(
                hit_rate = snapshot.overall.hit_rate,
                hits = snapshot.overall.hits,
                misses = snapshot.overall.misses,
                l1_p95_ms = snapshot.l1.p95_latency_ms,
                l2_p95_ms = snapshot.l2.p95_latency_ms,
                l2_errors = snapshot.l2.errors,
                "Cache metrics"
            );
            events.emit(CacheEvent::MetricsSnapshot(snapshot));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_metrics_task_emits_snapshots() {
        let metrics = Arc::new(MetricsCollector::new());
        let events = EventEmitter::new();
        let mut receiver = events.subscribe();

        metrics.overall.record_hit();
        let handle = spawn_metrics_task(metrics, events, 1);

        let event = tokio::time::timeout(Duration::from_secs(3), receiver.recv())
            .await
            .expect("snapshot within timeout")
            .unwrap();
        match event {
            CacheEvent::MetricsSnapshot(snapshot) => assert_eq!(snapshot.overall.hits, 1),
            other => panic!("unexpected event {:?}", other),
        }

        handle.abort();
    }
}

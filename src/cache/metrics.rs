//! Cache Metrics Module
//!
//! Tracks per-tier counters and recent operation latencies.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Number of latency samples retained per tier.
pub const LATENCY_WINDOW: usize = 1000;

// == Latency Window ==
/// Bounded ring buffer of latency samples in milliseconds.
#[derive(Debug)]
pub struct LatencyWindow {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl LatencyWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record(&mut self, latency: Duration) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(latency.as_micros() as f64 / 1000.0);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    /// Nearest-rank 95th percentile over the current window.
    pub fn p95(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let rank = ((sorted.len() as f64) * 0.95).ceil() as usize;
        sorted[rank.saturating_sub(1)]
    }
}

// == Tier Metrics ==
/// Live counters for one tier.
#[derive(Debug)]
pub struct TierMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    evictions: AtomicU64,
    errors: AtomicU64,
    latencies: Mutex<LatencyWindow>,
}

impl Default for TierMetrics {
    fn default() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            latencies: Mutex::new(LatencyWindow::new(LATENCY_WINDOW)),
        }
    }
}

impl TierMetrics {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_latency(&self, latency: Duration) {
        let mut window = self
            .latencies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        window.record(latency);
    }

    pub fn snapshot(&self) -> TierSnapshot {
        let (avg_latency_ms, p95_latency_ms, samples) = {
            let window = self
                .latencies
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            (window.average(), window.p95(), window.len())
        };
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);

        TierSnapshot {
            hits,
            misses,
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            hit_rate: hit_rate(hits, misses),
            avg_latency_ms,
            p95_latency_ms,
            latency_samples: samples,
        }
    }
}

/// Calculates hits / (hits + misses), or 0.0 if no requests have been made.
pub fn hit_rate(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

// == Snapshots ==
/// Point-in-time view of one tier.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct TierSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub evictions: u64,
    pub errors: u64,
    pub hit_rate: f64,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub latency_samples: usize,
}

/// Point-in-time view of the whole cache.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricsSnapshot {
    pub l1: TierSnapshot,
    pub l2: TierSnapshot,
    /// Outcome of manager-level operations across both tiers
    pub overall: TierSnapshot,
    pub taken_at: DateTime<Utc>,
}

// == Metrics Collector ==
/// Counters for L1, L2 and the combined manager view.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    pub l1: TierMetrics,
    pub l2: TierMetrics,
    pub overall: TierMetrics,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            l1: self.l1.snapshot(),
            l2: self.l2.snapshot(),
            overall: self.overall.snapshot(),
            taken_at: Utc::now(),
        }
    }
}

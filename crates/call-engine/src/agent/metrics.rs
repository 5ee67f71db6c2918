//! Per-agent performance counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Lock-free counters updated by the agent run loop.
#[derive(Debug, Default)]
pub struct AgentMetrics {
    processed: AtomicU64,
    failed: AtomicU64,
    /// Cumulative processing time in microseconds.
    total_latency_us: AtomicU64,
}

/// Serializable point-in-time view of [`AgentMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub processed: u64,
    pub failed: u64,
    pub avg_latency_ms: f64,
}

impl AgentMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, latency: Duration) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.total_latency_us
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_failure(&self, latency: Duration) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.total_latency_us
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.processed.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        self.total_latency_us.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let processed = self.processed.load(Ordering::Relaxed);
        let total_us = self.total_latency_us.load(Ordering::Relaxed);
        MetricsSnapshot {
            processed,
            failed: self.failed.load(Ordering::Relaxed),
            avg_latency_ms: if processed == 0 {
                0.0
            } else {
                (total_us as f64 / processed as f64) / 1000.0
            },
        }
    }
}

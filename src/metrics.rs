//! Relay request counters.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::error::PipelineError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub failures_by_kind: BTreeMap<String, u64>,
    pub average_processing_ms: f64,
    pub last_processing_ms: u64,
    pub uptime_secs: u64,
}

/// Every request is recorded exactly once, after its outcome is final.
pub struct RelayMetrics {
    started_at: Instant,
    processed: AtomicU64,
    succeeded: AtomicU64,
    total_processing_ms: AtomicU64,
    last_processing_ms: AtomicU64,
    failures: DashMap<&'static str, u64>,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            processed: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            total_processing_ms: AtomicU64::new(0),
            last_processing_ms: AtomicU64::new(0),
            failures: DashMap::new(),
        }
    }

    pub fn record_success(&self, processing_ms: u64) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
        self.record_processed(processing_ms);
    }

    pub fn record_failure(&self, error: &PipelineError, processing_ms: u64) {
        *self.failures.entry(error.kind()).or_insert(0) += 1;
        self.record_processed(processing_ms);
    }

    fn record_processed(&self, processing_ms: u64) {
        self.total_processing_ms
            .fetch_add(processing_ms, Ordering::Relaxed);
        self.last_processing_ms
            .store(processing_ms, Ordering::Relaxed);
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let processed = self.processed.load(Ordering::Relaxed);
        let succeeded = self.succeeded.load(Ordering::Relaxed);
        let total_ms = self.total_processing_ms.load(Ordering::Relaxed);
        let failures_by_kind: BTreeMap<String, u64> = self
            .failures
            .iter()
            .map(|e| (e.key().to_string(), *e.value()))
            .collect();

        MetricsSnapshot {
            processed,
            succeeded,
            failed: failures_by_kind.values().sum(),
            failures_by_kind,
            average_processing_ms: if processed == 0 {
                0.0
            } else {
                total_ms as f64 / processed as f64
            },
            last_processing_ms: self.last_processing_ms.load(Ordering::Relaxed),
            uptime_secs: self.uptime_secs(),
        }
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

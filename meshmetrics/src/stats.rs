//! Operational counters for the fabric itself, kept as plain atomics so
//! the hot paths never block on telemetry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters for the import surface.
#[derive(Debug, Default)]
pub struct ImportStats {
    /// Metrics received over SendMetrics, including ones later rejected by
    /// a worker.
    pub metrics_total: AtomicU64,
    /// Metrics that could not be routed to a worker.
    pub metrics_unroutable: AtomicU64,
    /// Nanoseconds spent answering the most recent SendMetrics call.
    pub response_duration_ns: AtomicU64,
}

impl ImportStats {
    pub(crate) fn record_request(&self, metrics: usize, elapsed: Duration) {
        self.metrics_total
            .fetch_add(metrics as u64, Ordering::Relaxed);
        self.response_duration_ns
            .store(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_unroutable(&self) {
        self.metrics_unroutable.fetch_add(1, Ordering::Relaxed);
    }
}

/// Counters for the forwarding proxy.
#[derive(Debug, Default)]
pub struct ProxyStats {
    /// Metrics accepted for proxying.
    pub proxied_metrics_total: AtomicU64,
    /// Metrics lost to any failure cause.
    pub proxied_metrics_failed: AtomicU64,
    /// Distinct forwarding failures, one per failed destination or
    /// no-destination batch.
    pub forward_errors: AtomicU64,
    /// Nanoseconds spent on the most recent forwarding pass.
    pub duration_ns: AtomicU64,
}

impl ProxyStats {
    pub(crate) fn record_batch(&self, metrics: usize, elapsed: Duration) {
        self.proxied_metrics_total
            .fetch_add(metrics as u64, Ordering::Relaxed);
        self.duration_ns
            .store(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self, metrics: usize) {
        self.proxied_metrics_failed
            .fetch_add(metrics as u64, Ordering::Relaxed);
        self.forward_errors.fetch_add(1, Ordering::Relaxed);
    }
}

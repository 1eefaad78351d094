//! Job counters for the generation backend.
//!
//! All counters are backed by atomics for lock-free concurrent access.

use std::sync::atomic::{AtomicU64, Ordering};

/// Aggregated job metrics.
///
/// Thread-safe via atomics; cloneable via `Arc<Metrics>`.
pub struct Metrics {
    /// Jobs accepted into the queue.
    pub jobs_received: AtomicU64,
    /// Jobs answered from the prompt cache.
    pub cache_hits: AtomicU64,
    /// Jobs that produced a fresh image upstream.
    pub images_generated: AtomicU64,
    /// Jobs that ended in a failure outcome.
    pub jobs_failed: AtomicU64,
    /// Sum of fresh-generation latencies in milliseconds (for computing average).
    pub generation_latency_sum_ms: AtomicU64,
}

impl Metrics {
    /// Create a new metrics instance with all counters at zero.
    pub fn new() -> Self {
        Self {
            jobs_received: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            images_generated: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            generation_latency_sum_ms: AtomicU64::new(0),
        }
    }

    /// Record a job accepted into the queue.
    pub fn record_job(&self) {
        self.jobs_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a job answered from the prompt cache.
    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a fresh generation with its end-to-end latency.
    pub fn record_generation(&self, latency_ms: u64) {
        self.images_generated.fetch_add(1, Ordering::Relaxed);
        self.generation_latency_sum_ms
            .fetch_add(latency_ms, Ordering::Relaxed);
    }

    /// Record a job that ended in failure.
    pub fn record_failure(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Average fresh-generation latency in milliseconds, or 0 if none.
    pub fn avg_latency_ms(&self) -> u64 {
        let count = self.images_generated.load(Ordering::Relaxed);
        if count == 0 {
            return 0;
        }
        self.generation_latency_sum_ms.load(Ordering::Relaxed) / count
    }

    /// Export all metrics as a JSON value for the `/status` endpoint.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "jobs_received": self.jobs_received.load(Ordering::Relaxed),
            "cache_hits": self.cache_hits.load(Ordering::Relaxed),
            "images_generated": self.images_generated.load(Ordering::Relaxed),
            "jobs_failed": self.jobs_failed.load(Ordering::Relaxed),
            "avg_generation_latency_ms": self.avg_latency_ms(),
        })
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

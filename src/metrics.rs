//! Process-wide performance counters
//!
//! All counters live behind one lock so every operation updates them at a
//! single synchronization point and readers always get a consistent
//! snapshot. Derived figures are computed from the snapshot.

use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    total_requests: u64,
    total_tokens_generated: u64,
    total_generation_time_ms: u64,
    memory_usage_bytes: u64,
    peak_memory_bytes: u64,
    active_contexts: u64,
    pool_size: u64,
}

/// Live metrics aggregate shared by the registry, pools and workers
#[derive(Debug, Default)]
pub struct Metrics {
    counters: Mutex<Counters>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one finished generation request
    pub fn record_request(&self, tokens: usize, elapsed: Duration) {
        let mut c = self.counters.lock();
        c.total_requests += 1;
        c.total_tokens_generated += tokens as u64;
        c.total_generation_time_ms += elapsed.as_millis() as u64;
    }

    pub(crate) fn add_memory(&self, bytes: u64) {
        let mut c = self.counters.lock();
        c.memory_usage_bytes += bytes;
        c.peak_memory_bytes = c.peak_memory_bytes.max(c.memory_usage_bytes);
    }

    pub(crate) fn sub_memory(&self, bytes: u64) {
        let mut c = self.counters.lock();
        c.memory_usage_bytes = c.memory_usage_bytes.saturating_sub(bytes);
    }

    pub(crate) fn context_checked_out(&self) {
        self.counters.lock().active_contexts += 1;
    }

    pub(crate) fn context_returned(&self) {
        let mut c = self.counters.lock();
        c.active_contexts = c.active_contexts.saturating_sub(1);
    }

    pub(crate) fn contexts_created(&self, n: usize) {
        self.counters.lock().pool_size += n as u64;
    }

    pub(crate) fn contexts_destroyed(&self, n: usize) {
        let mut c = self.counters.lock();
        c.pool_size = c.pool_size.saturating_sub(n as u64);
    }

    /// Immutable copy of the current counters
    pub fn snapshot(&self) -> PerformanceSnapshot {
        let c = *self.counters.lock();
        PerformanceSnapshot {
            total_requests: c.total_requests,
            total_tokens_generated: c.total_tokens_generated,
            total_generation_time_ms: c.total_generation_time_ms,
            memory_usage_bytes: c.memory_usage_bytes,
            peak_memory_bytes: c.peak_memory_bytes,
            active_contexts: c.active_contexts,
            pool_size: c.pool_size,
        }
    }

    /// Zero the request counters
    ///
    /// Gauges (memory in use, active contexts, pool size) describe live
    /// resources and are kept; the peak restarts from current usage.
    pub fn reset(&self) {
        let mut c = self.counters.lock();
        c.total_requests = 0;
        c.total_tokens_generated = 0;
        c.total_generation_time_ms = 0;
        c.peak_memory_bytes = c.memory_usage_bytes;
    }
}

/// Point-in-time view of the metrics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub total_requests: u64,
    pub total_tokens_generated: u64,
    pub total_generation_time_ms: u64,
    pub memory_usage_bytes: u64,
    pub peak_memory_bytes: u64,
    pub active_contexts: u64,
    pub pool_size: u64,
}

impl PerformanceSnapshot {
    pub fn average_tokens_per_second(&self) -> f64 {
        if self.total_requests > 0 && self.total_generation_time_ms > 0 {
            self.total_tokens_generated as f64 / self.total_generation_time_ms as f64 * 1000.0
        } else {
            0.0
        }
    }

    pub fn average_latency_ms(&self) -> f64 {
        if self.total_requests > 0 {
            self.total_generation_time_ms as f64 / self.total_requests as f64
        } else {
            0.0
        }
    }

    pub fn memory_usage_mb(&self) -> u64 {
        self.memory_usage_bytes / (1024 * 1024)
    }

    pub fn peak_memory_mb(&self) -> u64 {
        self.peak_memory_bytes / (1024 * 1024)
    }
}

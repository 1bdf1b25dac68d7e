//! Counters describing how a batcher coalesced its load.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct BatcherStats {
    requests_received: AtomicU64,
    requests_completed: AtomicU64,
    requests_abandoned: AtomicU64,
    batches_sent: AtomicU64,
    items_sent: AtomicU64,
    sink_failures: AtomicU64,
    largest_batch: AtomicU64,
}

impl BatcherStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// A request was handed to the batcher.
    pub fn record_received(&self) {
        self.requests_received.fetch_add(1, Ordering::Relaxed);
    }

    /// One sink call covering `requests` requests and `items` items finished.
    pub fn record_batch(&self, requests: usize, items: usize, ok: bool) {
        self.batches_sent.fetch_add(1, Ordering::Relaxed);
        self.items_sent.fetch_add(items as u64, Ordering::Relaxed);
        self.requests_completed
            .fetch_add(requests as u64, Ordering::Relaxed);
        if !ok {
            self.sink_failures.fetch_add(1, Ordering::Relaxed);
        }
        self.largest_batch
            .fetch_max(requests as u64, Ordering::Relaxed);
    }

    /// Requests dropped unflushed at close time.
    pub fn record_abandoned(&self, requests: usize) {
        self.requests_abandoned
            .fetch_add(requests as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests_received: self.requests_received.load(Ordering::Relaxed),
            requests_completed: self.requests_completed.load(Ordering::Relaxed),
            requests_abandoned: self.requests_abandoned.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            items_sent: self.items_sent.load(Ordering::Relaxed),
            sink_failures: self.sink_failures.load(Ordering::Relaxed),
            largest_batch: self.largest_batch.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`BatcherStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub requests_received: u64,
    pub requests_completed: u64,
    pub requests_abandoned: u64,
    pub batches_sent: u64,
    pub items_sent: u64,
    pub sink_failures: u64,
    /// Most requests folded into a single sink call.
    pub largest_batch: u64,
}

impl StatsSnapshot {
    /// Average requests per sink call
    pub fn avg_batch_size(&self) -> f64 {
        if self.batches_sent == 0 {
            return 0.0;
        }
        self.requests_completed as f64 / self.batches_sent as f64
    }
}

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Atomic counters updated on the hot path and by the background loops.
///
/// Shared (`Arc`) between the batch writer, the scheduler, and the service;
/// read lock-free by [`snapshot`](crate::service::CounterService::metrics).
#[derive(Debug, Default)]
pub struct CoreMetrics {
    /// Write records dropped because the batch intake channel was full.
    pub dropped_enqueues: AtomicU64,
    /// Unix seconds of the last completed flush to the durable store (0 = never).
    pub last_flush_unix: AtomicI64,
    /// Unix seconds of the last completed scheduler run (0 = never).
    pub last_scheduler_run_unix: AtomicI64,
}

impl CoreMetrics {
    pub fn record_dropped_enqueue(&self) {
        self.dropped_enqueues.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush(&self) {
        self.last_flush_unix
            .store(Utc::now().timestamp(), Ordering::Relaxed);
    }

    pub fn record_scheduler_run(&self) {
        self.last_scheduler_run_unix
            .store(Utc::now().timestamp(), Ordering::Relaxed);
    }
}

/// Point-in-time view of the core's observability state, exposed read-only
/// to the RPC layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub in_fallback: bool,
    pub consecutive_failures: u32,
    pub queue_depth: usize,
    pub dropped_enqueues: u64,
    pub last_flush: Option<DateTime<Utc>>,
    pub last_scheduler_run: Option<DateTime<Utc>>,
}

pub(crate) fn unix_to_datetime(secs: i64) -> Option<DateTime<Utc>> {
    if secs == 0 {
        return None;
    }
    DateTime::from_timestamp(secs, 0)
}

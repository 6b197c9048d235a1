use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Live counters updated by the pool, its workers and its timer.
#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    pub(crate) submitted: AtomicU64,
    pub(crate) scheduled: AtomicU64,
    pub(crate) dispatched: AtomicU64,
    pub(crate) completed: AtomicU64,
    pub(crate) failed: AtomicU64,
    pub(crate) skipped: AtomicU64,
    pub(crate) abandoned: AtomicU64,
    pub(crate) active_workers: AtomicUsize,
}

impl PoolCounters {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// Point-in-time view of a pool, for logs and dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct PoolMetrics {
    /// Work items accepted by `submit`.
    pub submitted: u64,
    /// One-shot and periodic events accepted by the timer.
    pub scheduled: u64,
    /// Due events the timer handed to the worker queue (every period counts).
    pub dispatched: u64,
    /// Jobs that ran to completion without a fault.
    pub completed: u64,
    /// Jobs whose body returned an error or panicked.
    pub failed: u64,
    /// Jobs cancelled before or while running; any result was discarded.
    pub skipped: u64,
    /// Queued jobs discarded by shutdown.
    pub abandoned: u64,
    /// Jobs waiting in the worker queue.
    pub queue_depth: usize,
    /// Events waiting in the timer queue.
    pub timer_pending: usize,
    /// Fixed number of worker threads.
    pub workers: usize,
    /// Workers currently executing a job.
    pub active_workers: usize,
    /// Active workers over total workers (0.0 - 1.0).
    pub worker_utilization: f64,
    pub is_shutdown: bool,
    pub started_at: DateTime<Utc>,
}

impl PoolMetrics {
    pub(crate) fn snapshot(
        counters: &PoolCounters,
        queue_depth: usize,
        timer_pending: usize,
        workers: usize,
        is_shutdown: bool,
        started_at: DateTime<Utc>,
    ) -> Self {
        let active_workers = counters.active_workers.load(Ordering::Relaxed);
        let worker_utilization = if workers == 0 {
            0.0
        } else {
            active_workers as f64 / workers as f64
        };
        Self {
            submitted: counters.submitted.load(Ordering::Relaxed),
            scheduled: counters.scheduled.load(Ordering::Relaxed),
            dispatched: counters.dispatched.load(Ordering::Relaxed),
            completed: counters.completed.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            skipped: counters.skipped.load(Ordering::Relaxed),
            abandoned: counters.abandoned.load(Ordering::Relaxed),
            queue_depth,
            timer_pending,
            workers,
            active_workers,
            worker_utilization,
            is_shutdown,
            started_at,
        }
    }

    /// Jobs that reached a final outcome on a worker.
    pub fn finished(&self) -> u64 {
        self.completed + self.failed + self.skipped
    }
}

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use spindle_core::{PoolConfig, SpindleError};
use tracing::{debug, info, warn};

use crate::future::TaskFuture;
use crate::job::Dispatcher;
use crate::metrics::{PoolCounters, PoolMetrics};
use crate::task::WorkItem;
use crate::thread::TaskThread;
use crate::timer::Timer;

use super::worker::PoolWorker;

/// A fixed set of worker threads draining one shared FIFO queue, plus a
/// timer thread for delayed and periodic work.
///
/// Dropping the pool shuts it down.
pub struct ThreadPool {
    pub(super) config: PoolConfig,
    pub(super) workers: Vec<TaskThread>,
    pub(super) dispatcher: Arc<Dispatcher>,
    pub(super) timer: Timer,
    pub(super) shutdown: AtomicBool,
    pub(super) started_at: DateTime<Utc>,
}

impl ThreadPool {
    /// Start `config.resolved_size()` workers and the timer thread.
    pub fn new(config: PoolConfig) -> Result<Self, SpindleError> {
        let size = config.resolved_size();
        let counters = Arc::new(PoolCounters::default());
        let dispatcher = Arc::new(Dispatcher::new(config.queue_warn_threshold, counters));

        let mut workers = Vec::with_capacity(size);
        for n in 1..=size {
            let name = format!("{}-{}", config.thread_name_prefix, n);
            let worker = Arc::new(PoolWorker::new(Arc::clone(&dispatcher)));
            match TaskThread::spawn(name, worker) {
                Ok(thread) => workers.push(thread),
                Err(e) => {
                    stop_workers(&dispatcher, &workers);
                    return Err(e);
                }
            }
        }

        let timer_name = format!("{}-timer", config.thread_name_prefix);
        let timer = match Timer::start(timer_name, Arc::clone(&dispatcher)) {
            Ok(timer) => timer,
            Err(e) => {
                stop_workers(&dispatcher, &workers);
                return Err(e);
            }
        };

        info!(
            workers = size,
            prefix = %config.thread_name_prefix,
            queue_warn_threshold = config.queue_warn_threshold,
            "thread pool started"
        );

        Ok(Self {
            config,
            workers,
            dispatcher,
            timer,
            shutdown: AtomicBool::new(false),
            started_at: Utc::now(),
        })
    }

    /// Pool with `size` workers and default settings otherwise.
    pub fn with_size(size: usize) -> Result<Self, SpindleError> {
        Self::new(PoolConfig::with_size(size))
    }

    /// Queue `item` for the next idle worker.
    pub fn submit<T: Send + 'static>(&self, item: WorkItem<T>) -> Result<TaskFuture<T>, SpindleError> {
        if self.is_shutdown() {
            return Err(SpindleError::Shutdown);
        }
        debug!(id = %item.id(), kind = ?item.kind(), "submitting work");
        let future = TaskFuture::new(item);
        self.dispatcher.dispatch(future.as_job())?;
        PoolCounters::incr(&self.dispatcher.counters.submitted);
        Ok(future)
    }

    /// Number of worker threads.
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Jobs waiting for a worker.
    pub fn queue_depth(&self) -> usize {
        self.dispatcher.depth()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// The timer feeding this pool.
    pub fn timer(&self) -> &Timer {
        &self.timer
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> PoolMetrics {
        PoolMetrics::snapshot(
            &self.dispatcher.counters,
            self.dispatcher.depth(),
            self.timer.pending(),
            self.workers.len(),
            self.is_shutdown(),
            self.started_at,
        )
    }

    /// Stop the timer and the workers and wait for them to exit.
    ///
    /// Queued work that never started is cancelled; work already running
    /// has its cancel token tripped and is allowed to return. Calling this
    /// again is a no-op.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("thread pool shutdown requested");

        self.timer.shutdown();
        // Closed before the workers are told to stop: a worker resets its
        // token before each take, and a closed queue hands it nothing.
        let discarded = self.dispatcher.close_and_abandon();
        if discarded > 0 {
            warn!(count = discarded, "discarded queued work at shutdown");
        }
        for worker in &self.workers {
            worker.terminate();
        }
        for worker in &self.workers {
            worker.join();
        }
        info!(workers = self.workers.len(), "thread pool stopped");
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn stop_workers(dispatcher: &Dispatcher, workers: &[TaskThread]) {
    dispatcher.close_and_abandon();
    for worker in workers {
        worker.terminate();
    }
    for worker in workers {
        worker.join();
    }
}

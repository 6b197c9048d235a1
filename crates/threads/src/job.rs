use std::sync::Arc;

use spindle_core::{SpindleError, TaskFault};
use tracing::{trace, warn};

use crate::cancel::CancelToken;
use crate::metrics::PoolCounters;
use crate::queue::BlockingQueue;

/// How a job ended on a worker.
#[derive(Debug)]
pub(crate) enum JobOutcome {
    Completed,
    Failed(TaskFault),
    /// Already cancelled when the worker got to it.
    Skipped,
}

/// Anything a pool worker can run: submitted futures and due timer events.
pub(crate) trait Job: Send + Sync {
    fn id(&self) -> &str;

    fn execute(self: Arc<Self>, cancel: &CancelToken) -> JobOutcome;

    /// The job was dropped without running (shutdown); release its waiters.
    fn abandon(&self);
}

/// The pool's shared FIFO plus the backpressure warning on enqueue.
pub(crate) struct Dispatcher {
    queue: BlockingQueue<Arc<dyn Job>>,
    warn_threshold: usize,
    pub(crate) counters: Arc<PoolCounters>,
}

impl Dispatcher {
    pub(crate) fn new(warn_threshold: usize, counters: Arc<PoolCounters>) -> Self {
        Self {
            queue: BlockingQueue::new(),
            warn_threshold,
            counters,
        }
    }

    /// Enqueue a job for the next idle worker.
    pub(crate) fn dispatch(&self, job: Arc<dyn Job>) -> Result<(), SpindleError> {
        match self.queue.push(job) {
            Ok(depth) => {
                if depth > self.warn_threshold {
                    warn!(
                        depth,
                        threshold = self.warn_threshold,
                        "worker queue above warning threshold"
                    );
                }
                Ok(())
            }
            Err(job) => {
                trace!(id = %job.id(), "rejected job, queue closed");
                job.abandon();
                Err(SpindleError::Shutdown)
            }
        }
    }

    pub(crate) fn take(&self) -> Option<Arc<dyn Job>> {
        self.queue.take()
    }

    pub(crate) fn depth(&self) -> usize {
        self.queue.len()
    }

    /// Close the queue and cancel everything still waiting in it.
    /// Returns how many jobs were discarded.
    pub(crate) fn close_and_abandon(&self) -> usize {
        self.queue.close();
        let drained = self.queue.drain();
        for job in &drained {
            job.abandon();
        }
        PoolCounters::add(&self.counters.abandoned, drained.len() as u64);
        drained.len()
    }
}

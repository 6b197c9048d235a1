use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::trace;

use crate::cancel::CancelToken;
use crate::job::{Dispatcher, JobOutcome};
use crate::metrics::PoolCounters;
use crate::task::{RepeatableTask, Task};

/// Body of one pool thread: take the next job and run it.
pub(super) struct PoolWorker {
    dispatcher: Arc<Dispatcher>,
}

impl PoolWorker {
    pub(super) fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

// Workers stop through `TaskThread::terminate` and a closed queue, never by
// themselves.
impl Task for PoolWorker {}

impl RepeatableTask for PoolWorker {
    type Output = ();

    fn run_once(&self, cancel: &CancelToken) -> anyhow::Result<()> {
        // An interrupt aimed at the previous job must not leak into the next.
        cancel.reset();

        let Some(job) = self.dispatcher.take() else {
            return Ok(());
        };
        let counters = &self.dispatcher.counters;
        let id = job.id().to_string();

        counters.active_workers.fetch_add(1, Ordering::Relaxed);
        trace!(id = %id, "begin execution");
        let outcome = job.execute(cancel);
        counters.active_workers.fetch_sub(1, Ordering::Relaxed);
        trace!(id = %id, "complete execution");

        match outcome {
            JobOutcome::Completed => PoolCounters::incr(&counters.completed),
            JobOutcome::Skipped => PoolCounters::incr(&counters.skipped),
            JobOutcome::Failed(fault) => {
                PoolCounters::incr(&counters.failed);
                return Err(anyhow::Error::new(fault).context(format!("task {id}")));
            }
        }
        Ok(())
    }
}

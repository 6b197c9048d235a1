use std::time::Duration;

use spindle_core::SpindleError;

use crate::task::WorkItem;
use crate::timer::ScheduledHandle;

use super::ThreadPool;

impl ThreadPool {
    /// Run `item` once on a worker after `delay`.
    pub fn schedule<T: Send + 'static>(
        &self,
        item: WorkItem<T>,
        delay: Duration,
    ) -> Result<ScheduledHandle<T>, SpindleError> {
        self.ensure_running()?;
        self.timer.schedule(item, delay)
    }

    /// Run `item` after `initial_delay`, then `delay` after each run ends.
    pub fn schedule_with_fixed_delay(
        &self,
        item: WorkItem<()>,
        initial_delay: Duration,
        delay: Duration,
    ) -> Result<ScheduledHandle<()>, SpindleError> {
        self.ensure_running()?;
        self.timer.schedule_with_fixed_delay(item, initial_delay, delay)
    }

    /// Run `item` after `initial_delay`, then every `period`. See
    /// [`crate::Timer::schedule_at_fixed_rate`] for how overruns are handled.
    pub fn schedule_at_fixed_rate(
        &self,
        item: WorkItem<()>,
        initial_delay: Duration,
        period: Duration,
    ) -> Result<ScheduledHandle<()>, SpindleError> {
        self.ensure_running()?;
        self.timer.schedule_at_fixed_rate(item, initial_delay, period)
    }

    fn ensure_running(&self) -> Result<(), SpindleError> {
        if self.is_shutdown() {
            Err(SpindleError::Shutdown)
        } else {
            Ok(())
        }
    }
}

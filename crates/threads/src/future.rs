//! Waitable, cancellable handle for work submitted to the pool.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use spindle_core::{SpindleError, TaskFault};

use crate::cancel::CancelToken;
use crate::job::{Job, JobOutcome};
use crate::task::WorkItem;

enum State<T> {
    Pending,
    /// Holds the executing worker's token so `cancel(true)` can reach it.
    Running(CancelToken),
    Done(Result<T, TaskFault>),
    Cancelled,
}

impl<T> State<T> {
    fn is_final(&self) -> bool {
        matches!(self, State::Done(_) | State::Cancelled)
    }
}

struct Shared<T> {
    id: String,
    state: Mutex<State<T>>,
    changed: Condvar,
    item: Mutex<Option<WorkItem<T>>>,
}

/// Handle to one submitted [`WorkItem`].
///
/// Cloning yields another handle to the same work.
pub struct TaskFuture<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for TaskFuture<T> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<T> fmt::Debug for TaskFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskFuture")
            .field("id", &self.shared.id)
            .field("done", &self.is_done())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl<T: Send + 'static> TaskFuture<T> {
    pub(crate) fn new(item: WorkItem<T>) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: item.id().to_string(),
                state: Mutex::new(State::Pending),
                changed: Condvar::new(),
                item: Mutex::new(Some(item)),
            }),
        }
    }

    pub(crate) fn as_job(&self) -> Arc<dyn Job> {
        Arc::clone(&self.shared) as Arc<dyn Job>
    }
}

impl<T> TaskFuture<T> {
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Cancel the work. Pending work will never run; running work has its
    /// result discarded and, with `interrupt_if_running`, its cancel token
    /// tripped. Returns `false` if the work had already finished or been
    /// cancelled.
    pub fn cancel(&self, interrupt_if_running: bool) -> bool {
        let mut state = self.shared.state.lock();
        match &*state {
            State::Pending => {}
            State::Running(token) => {
                if interrupt_if_running {
                    token.cancel();
                }
            }
            State::Done(_) | State::Cancelled => return false,
        }
        *state = State::Cancelled;
        self.shared.changed.notify_all();
        true
    }

    pub fn is_done(&self) -> bool {
        self.shared.state.lock().is_final()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(*self.shared.state.lock(), State::Cancelled)
    }
}

impl<T: Clone> TaskFuture<T> {
    /// Block until the work finishes.
    pub fn get(&self) -> Result<T, SpindleError> {
        let mut state = self.shared.state.lock();
        while !state.is_final() {
            self.shared.changed.wait(&mut state);
        }
        self.read(&state)
    }

    /// Block until the work finishes or `timeout` elapses.
    /// A timeout too large to express as a deadline waits like [`get`](Self::get).
    pub fn get_timeout(&self, timeout: Duration) -> Result<T, SpindleError> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return self.get();
        };
        let mut state = self.shared.state.lock();
        while !state.is_final() {
            if self.shared.changed.wait_until(&mut state, deadline).timed_out() && !state.is_final() {
                return Err(SpindleError::Timeout { id: self.shared.id.clone() });
            }
        }
        self.read(&state)
    }

    fn read(&self, state: &State<T>) -> Result<T, SpindleError> {
        let id = || self.shared.id.clone();
        match state {
            State::Done(Ok(value)) => Ok(value.clone()),
            State::Done(Err(fault)) => Err(SpindleError::Failed { id: id(), fault: fault.clone() }),
            State::Cancelled => Err(SpindleError::Cancelled { id: id() }),
            State::Pending | State::Running(_) => Err(SpindleError::Timeout { id: id() }),
        }
    }
}

impl<T: Send + 'static> Job for Shared<T> {
    fn id(&self) -> &str {
        &self.id
    }

    fn execute(self: Arc<Self>, cancel: &CancelToken) -> JobOutcome {
        {
            let mut state = self.state.lock();
            if !matches!(*state, State::Pending) {
                return JobOutcome::Skipped;
            }
            *state = State::Running(cancel.clone());
        }

        // Taken exactly once: only the Pending -> Running transition gets here.
        let Some(mut item) = self.item.lock().take() else {
            return JobOutcome::Skipped;
        };
        let result = item.run(cancel);

        let mut state = self.state.lock();
        if matches!(*state, State::Cancelled) {
            return JobOutcome::Skipped;
        }
        let outcome = match &result {
            Ok(_) => JobOutcome::Completed,
            Err(fault) => JobOutcome::Failed(fault.clone()),
        };
        *state = State::Done(result);
        self.changed.notify_all();
        outcome
    }

    fn abandon(&self) {
        let mut state = self.state.lock();
        if !state.is_final() {
            *state = State::Cancelled;
            self.changed.notify_all();
        }
        drop(state);
        self.item.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn run(future: &TaskFuture<u32>) -> JobOutcome {
        future.as_job().execute(&CancelToken::new())
    }

    #[test]
    fn get_returns_value_after_execution() {
        let future = TaskFuture::new(WorkItem::with_result("answer", |_| Ok(42)));
        assert!(!future.is_done());
        assert!(matches!(run(&future), JobOutcome::Completed));

        assert!(future.is_done());
        assert_eq!(future.get().unwrap(), 42);
        // Repeated reads see the same value.
        assert_eq!(future.get_timeout(Duration::from_millis(1)).unwrap(), 42);
    }

    #[test]
    fn fault_is_reported_and_returned() {
        let future: TaskFuture<u32> =
            TaskFuture::new(WorkItem::with_result("bad", |_| anyhow::bail!("no luck")));
        assert!(matches!(run(&future), JobOutcome::Failed(_)));

        let err = future.get().unwrap_err();
        assert!(matches!(err, SpindleError::Failed { ref id, .. } if id == "bad"));
        assert_eq!(err.fault().unwrap().to_string(), "no luck");
    }

    #[test]
    fn cancel_pending_prevents_execution() {
        let future = TaskFuture::new(WorkItem::with_result("never", |_| -> anyhow::Result<u32> {
            panic!("must not run")
        }));
        assert!(future.cancel(false));
        assert!(!future.cancel(false), "second cancel is a no-op");

        assert!(matches!(run(&future), JobOutcome::Skipped));
        assert!(future.is_cancelled());
        assert!(future.get().unwrap_err().is_cancelled());
    }

    #[test]
    fn cancel_after_completion_fails() {
        let future = TaskFuture::new(WorkItem::with_result("quick", |_| Ok(1)));
        run(&future);
        assert!(!future.cancel(true));
        assert!(!future.is_cancelled());
    }

    #[test]
    fn cancel_running_interrupts_and_discards_result() {
        let future = TaskFuture::new(WorkItem::with_result("slow", |cancel| {
            cancel.sleep(Duration::from_secs(10))?;
            Ok(5_u32)
        }));
        let worker = {
            let f = future.clone();
            thread::spawn(move || run(&f))
        };

        while !matches!(*future.shared.state.lock(), State::Running(_)) {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(future.cancel(true));

        assert!(matches!(worker.join().unwrap(), JobOutcome::Skipped));
        assert!(future.get().unwrap_err().is_cancelled());
    }

    #[test]
    fn get_timeout_expires_on_pending_work() {
        let future = TaskFuture::new(WorkItem::with_result("idle", |_| Ok(0_u32)));
        let err = future.get_timeout(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, SpindleError::Timeout { .. }));
    }

    #[test]
    fn unbounded_timeout_waits_for_result() {
        let future = TaskFuture::new(WorkItem::with_result("late", |_| Ok(7_u32)));
        let worker = {
            let f = future.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                run(&f)
            })
        };

        assert_eq!(future.get_timeout(Duration::MAX).unwrap(), 7);
        worker.join().unwrap();
    }

    #[test]
    fn abandon_releases_waiters() {
        let future = TaskFuture::new(WorkItem::with_result("dropped", |_| Ok(0_u32)));
        let waiter = {
            let f = future.clone();
            thread::spawn(move || f.get())
        };
        thread::sleep(Duration::from_millis(20));
        future.as_job().abandon();

        assert!(waiter.join().unwrap().unwrap_err().is_cancelled());
    }
}

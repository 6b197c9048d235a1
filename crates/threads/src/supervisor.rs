//! Supervisor for a task that runs on its own thread for as long as it
//! wants to, outside any pool.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use spindle_core::{SpindleError, TaskConfig, TaskFault};
use tracing::{debug, error, info};

use crate::cancel::CancelToken;
use crate::task::{invoke, ExceptionHandler, RepeatableTask};
use crate::thread::report_fault;

/// Lifecycle of a [`LongLivedTask`]. `Cancelled` and `Terminated` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LongLivedState {
    Initial,
    Running,
    Cancelled,
    Terminated,
}

impl LongLivedState {
    pub fn is_final(self) -> bool {
        matches!(self, LongLivedState::Cancelled | LongLivedState::Terminated)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LongLivedState::Initial => "Initial",
            LongLivedState::Running => "Running",
            LongLivedState::Cancelled => "Cancelled",
            LongLivedState::Terminated => "Terminated",
        }
    }
}

impl fmt::Display for LongLivedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Status<T> {
    state: LongLivedState,
    /// Value of the latest successful iteration.
    result: Option<T>,
    /// Fault that stopped the loop when faults are fatal.
    fault: Option<TaskFault>,
}

struct Shared<T> {
    name: String,
    task: Arc<dyn RepeatableTask<Output = T>>,
    status: Mutex<Status<T>>,
    changed: Condvar,
    continue_after_exception: AtomicBool,
    exception_handler: Mutex<Option<ExceptionHandler>>,
    cancel: CancelToken,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl<T> Shared<T> {
    fn thread_alive(&self) -> bool {
        self.thread
            .lock()
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }
}

impl<T: Send + 'static> Shared<T> {
    fn run(&self) {
        loop {
            match invoke(|| self.task.run_once(&self.cancel)) {
                Ok(value) => self.status.lock().result = Some(value),
                Err(fault) => self.handle_fault(fault),
            }

            let keep_going = self.task.continue_execution();
            if self.status.lock().state.is_final() || !keep_going {
                break;
            }
        }

        let mut status = self.status.lock();
        if status.state != LongLivedState::Cancelled {
            status.state = LongLivedState::Terminated;
        }
        self.changed.notify_all();
        drop(status);
        debug!(task = %self.name, "terminated");
    }

    fn handle_fault(&self, fault: TaskFault) {
        let handler = self.exception_handler.lock().clone();
        report_fault(&self.name, &fault, handler.as_ref());

        if !self.continue_after_exception.load(Ordering::SeqCst) {
            let mut status = self.status.lock();
            status.fault = Some(fault);
            if status.state != LongLivedState::Cancelled {
                status.state = LongLivedState::Terminated;
            }
            self.changed.notify_all();
            drop(status);
            error!(task = %self.name, "execution terminating due to exception");
        }
    }
}

/// A [`RepeatableTask`] run on one dedicated, named thread, with an
/// explicit state machine:
///
/// ```text
/// Initial --start--> Running --(stop | fatal fault)--> Terminated
///    |                  |
///    +-----cancel-------+--------------------------> Cancelled
/// ```
pub struct LongLivedTask<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> LongLivedTask<T> {
    pub fn new<R>(name: impl Into<String>, task: Arc<R>) -> Self
    where
        R: RepeatableTask<Output = T>,
    {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                task,
                status: Mutex::new(Status {
                    state: LongLivedState::Initial,
                    result: None,
                    fault: None,
                }),
                changed: Condvar::new(),
                continue_after_exception: AtomicBool::new(true),
                exception_handler: Mutex::new(None),
                cancel: CancelToken::new(),
                thread: Mutex::new(None),
            }),
        }
    }

    /// Apply the task defaults from configuration.
    pub fn with_config(self, config: &TaskConfig) -> Self {
        self.set_continue_after_exception(config.continue_after_exception);
        self
    }

    /// Spawn the thread and enter `Running`.
    ///
    /// Fails with [`SpindleError::IllegalState`] unless still `Initial`.
    pub fn start(&self) -> Result<LongLivedHandle<T>, SpindleError> {
        let mut status = self.shared.status.lock();
        if status.state != LongLivedState::Initial {
            return Err(SpindleError::IllegalState {
                expected: LongLivedState::Initial.as_str(),
                actual: status.state.as_str(),
            });
        }

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(self.shared.name.clone())
            .spawn(move || shared.run())?;
        *self.shared.thread.lock() = Some(handle);

        // Still under the status lock: the new thread cannot observe
        // `Initial` or race a terminal state in ahead of `Running`.
        status.state = LongLivedState::Running;
        self.shared.changed.notify_all();
        drop(status);

        info!(task = %self.shared.name, "long-lived task started");
        Ok(self.handle())
    }
}

impl<T: 'static> LongLivedTask<T> {
    /// When `false`, the first fault is recorded and the task terminates.
    pub fn set_continue_after_exception(&self, value: bool) {
        self.shared.continue_after_exception.store(value, Ordering::SeqCst);
    }

    /// Replace the default fault logging.
    pub fn set_exception_handler<H>(&self, handler: H)
    where
        H: Fn(&TaskFault) + Send + Sync + 'static,
    {
        *self.shared.exception_handler.lock() = Some(Arc::new(handler));
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> LongLivedState {
        self.shared.status.lock().state
    }

    /// A handle observing this task, valid in any state.
    pub fn handle(&self) -> LongLivedHandle<T> {
        LongLivedHandle { shared: Arc::clone(&self.shared) }
    }
}

/// Waitable, cancellable view of a [`LongLivedTask`].
pub struct LongLivedHandle<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for LongLivedHandle<T> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<T: 'static> fmt::Debug for LongLivedHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LongLivedHandle")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .finish()
    }
}

impl<T: 'static> LongLivedHandle<T> {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> LongLivedState {
        self.shared.status.lock().state
    }

    pub fn is_done(&self) -> bool {
        self.state().is_final()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == LongLivedState::Cancelled
    }

    /// Stop the task.
    ///
    /// - `Initial`: becomes `Cancelled` and never starts.
    /// - `Running`: becomes `Cancelled`; the task's `terminate` hook runs
    ///   and, with `interrupt_if_running`, the body's cancel token trips.
    /// - already `Cancelled`: trips the token again if the thread has not
    ///   exited yet and returns whether it did so.
    /// - `Terminated`: nothing to cancel, returns `false`.
    pub fn cancel(&self, interrupt_if_running: bool) -> bool {
        let mut status = self.shared.status.lock();
        match status.state {
            LongLivedState::Initial => {
                status.state = LongLivedState::Cancelled;
                self.shared.changed.notify_all();
                true
            }
            LongLivedState::Running => {
                if interrupt_if_running {
                    self.shared.cancel.cancel();
                }
                status.state = LongLivedState::Cancelled;
                self.shared.changed.notify_all();
                drop(status);
                self.shared.task.terminate();
                debug!(task = %self.shared.name, "cancelled");
                true
            }
            LongLivedState::Cancelled => {
                let alive = self.shared.thread_alive();
                if alive {
                    self.shared.cancel.cancel();
                }
                alive
            }
            LongLivedState::Terminated => false,
        }
    }

    /// Wait for the thread to exit. A no-op before `start`, from the
    /// task's own thread, or when already joined.
    pub fn join(&self) {
        let handle = {
            let mut slot = self.shared.thread.lock();
            match slot.as_ref() {
                Some(h) if h.thread().id() == thread::current().id() => return,
                _ => slot.take(),
            }
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(task = %self.shared.name, "thread panicked outside the task body");
            }
        }
    }
}

impl<T: Clone + 'static> LongLivedHandle<T> {
    /// Block until the task reaches a final state.
    ///
    /// `Ok(None)` means the task terminated without ever producing a value.
    pub fn get(&self) -> Result<Option<T>, SpindleError> {
        let mut status = self.shared.status.lock();
        while !status.state.is_final() {
            self.shared.changed.wait(&mut status);
        }
        self.read(&status)
    }

    /// Like [`get`](Self::get), giving up with [`SpindleError::Timeout`]
    /// after `timeout`.
    pub fn get_timeout(&self, timeout: Duration) -> Result<Option<T>, SpindleError> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return self.get();
        };
        let mut status = self.shared.status.lock();
        while !status.state.is_final() {
            if self.shared.changed.wait_until(&mut status, deadline).timed_out() {
                break;
            }
        }
        self.read(&status)
    }

    fn read(&self, status: &Status<T>) -> Result<Option<T>, SpindleError> {
        let id = || self.shared.name.clone();
        match status.state {
            LongLivedState::Cancelled => Err(SpindleError::Cancelled { id: id() }),
            LongLivedState::Terminated => match &status.fault {
                Some(fault) => Err(SpindleError::Failed { id: id(), fault: fault.clone() }),
                None => Ok(status.result.clone()),
            },
            LongLivedState::Initial | LongLivedState::Running => {
                Err(SpindleError::Timeout { id: id() })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{task_fn, Task};
    use std::sync::atomic::AtomicUsize;

    /// Produces 0..limit, one value per iteration.
    struct Counter {
        next: AtomicUsize,
        limit: usize,
        terminated: AtomicBool,
    }

    impl Counter {
        fn new(limit: usize) -> Arc<Self> {
            Arc::new(Self {
                next: AtomicUsize::new(0),
                limit,
                terminated: AtomicBool::new(false),
            })
        }
    }

    impl Task for Counter {
        fn continue_execution(&self) -> bool {
            self.next.load(Ordering::SeqCst) < self.limit
        }

        fn terminate(&self) {
            self.terminated.store(true, Ordering::SeqCst);
        }
    }

    impl RepeatableTask for Counter {
        type Output = usize;

        fn run_once(&self, cancel: &CancelToken) -> anyhow::Result<usize> {
            cancel.sleep(Duration::from_millis(5))?;
            Ok(self.next.fetch_add(1, Ordering::SeqCst))
        }
    }

    #[test]
    fn runs_until_continue_execution_is_false() {
        let counter = Counter::new(10);
        let task = LongLivedTask::new("counter", Arc::clone(&counter));
        assert_eq!(task.state(), LongLivedState::Initial);

        let handle = task.start().unwrap();
        assert_eq!(handle.get().unwrap(), Some(9));
        assert_eq!(handle.state(), LongLivedState::Terminated);
        assert!(handle.is_done());
        assert!(!handle.is_cancelled());
        assert!(!counter.terminated.load(Ordering::SeqCst));
    }

    #[test]
    fn start_twice_is_illegal() {
        let task = LongLivedTask::new("once", Counter::new(1));
        let handle = task.start().unwrap();
        let err = task.start().unwrap_err();
        assert!(matches!(
            err,
            SpindleError::IllegalState { expected: "Initial", .. }
        ));
        handle.join();
    }

    #[test]
    fn cancel_before_start_prevents_start() {
        let task = LongLivedTask::new("never", Counter::new(1));
        assert!(task.handle().cancel(false));
        assert_eq!(task.state(), LongLivedState::Cancelled);
        assert!(task.start().is_err());
    }

    #[test]
    fn faults_continue_by_default() {
        let runs = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&runs);
        let task = LongLivedTask::new(
            "flaky",
            Arc::new(task_fn(move |cancel| -> anyhow::Result<()> {
                r.fetch_add(1, Ordering::SeqCst);
                cancel.sleep(Duration::from_millis(10))?;
                anyhow::bail!("test fault")
            })),
        );
        task.set_exception_handler(|_| {});
        let handle = task.start().unwrap();

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(handle.state(), LongLivedState::Running);
        assert!(runs.load(Ordering::SeqCst) > 1);

        assert!(handle.cancel(true));
        assert!(handle.get().unwrap_err().is_cancelled());
        handle.join();
    }

    #[test]
    fn fatal_fault_terminates_with_fault() {
        let faults = Arc::new(AtomicUsize::new(0));
        let task = LongLivedTask::new(
            "fatal",
            Arc::new(task_fn(|_| -> anyhow::Result<()> { panic!("boom") })),
        );
        task.set_continue_after_exception(false);
        let f = Arc::clone(&faults);
        task.set_exception_handler(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });

        let handle = task.start().unwrap();
        let err = handle.get_timeout(Duration::from_secs(1)).unwrap_err();
        assert!(err.fault().is_some_and(TaskFault::is_panic));
        assert!(handle.is_done());
        assert!(!handle.is_cancelled());
        assert_eq!(faults.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn with_config_applies_fault_policy() {
        let config = TaskConfig { continue_after_exception: false };
        let task = LongLivedTask::new(
            "configured",
            Arc::new(task_fn(|_| -> anyhow::Result<()> { anyhow::bail!("stop") })),
        )
        .with_config(&config);
        task.set_exception_handler(|_| {});

        let handle = task.start().unwrap();
        assert!(matches!(handle.get(), Err(SpindleError::Failed { .. })));
    }

    #[test]
    fn cancel_running_calls_terminate_and_interrupts() {
        let counter = Counter::new(usize::MAX);
        let task = LongLivedTask::new("endless", Arc::clone(&counter));
        let handle = task.start().unwrap();
        std::thread::sleep(Duration::from_millis(30));

        assert!(handle.cancel(true));
        assert!(counter.terminated.load(Ordering::SeqCst));
        handle.join();

        assert_eq!(handle.state(), LongLivedState::Cancelled);
        // Thread gone: a second cancel has nothing left to interrupt.
        assert!(!handle.cancel(true));
    }

    #[test]
    fn cancel_after_termination_is_refused() {
        let task = LongLivedTask::new("short", Counter::new(1));
        let handle = task.start().unwrap();
        handle.get().unwrap();

        assert!(!handle.cancel(true));
        assert_eq!(handle.state(), LongLivedState::Terminated);
        assert!(format!("{handle:?}").contains("Terminated"));
    }

    #[test]
    fn get_timeout_while_running() {
        let task = LongLivedTask::new("slow", Counter::new(usize::MAX));
        let handle = task.start().unwrap();

        let err = handle.get_timeout(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, SpindleError::Timeout { ref id } if id == "slow"));
        handle.cancel(true);
        handle.join();
    }

    #[test]
    fn unbounded_timeout_waits_for_termination() {
        let task = LongLivedTask::new("patient", Counter::new(3));
        let handle = task.start().unwrap();
        assert_eq!(handle.get_timeout(Duration::MAX).unwrap(), Some(2));
        assert_eq!(handle.state(), LongLivedState::Terminated);
    }
}

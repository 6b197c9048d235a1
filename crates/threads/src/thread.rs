//! Execution wrapper: a named OS thread that keeps calling a
//! [`RepeatableTask`] until told to stop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use spindle_core::{SpindleError, TaskFault};
use tracing::{debug, error};

use crate::cancel::CancelToken;
use crate::task::{invoke, ExceptionHandler, RepeatableTask, Task};

/// Deliver a fault to `handler`, or log it when there is none.
pub(crate) fn report_fault(name: &str, fault: &TaskFault, handler: Option<&ExceptionHandler>) {
    match handler {
        Some(handler) => handler(fault),
        None => error!(thread = %name, error = %fault, "task fault"),
    }
}

struct Control {
    stop: AtomicBool,
    cancel: CancelToken,
}

/// Builder for [`TaskThread`].
pub struct TaskThreadBuilder {
    name: String,
    continue_after_exception: bool,
    exception_handler: Option<ExceptionHandler>,
}

impl TaskThreadBuilder {
    /// Stop permanently after the first faulting iteration when `false`.
    /// Defaults to `true`.
    pub fn continue_after_exception(mut self, value: bool) -> Self {
        self.continue_after_exception = value;
        self
    }

    pub fn exception_handler<H>(mut self, handler: H) -> Self
    where
        H: Fn(&TaskFault) + Send + Sync + 'static,
    {
        self.exception_handler = Some(Arc::new(handler));
        self
    }

    /// Start the thread running `task`.
    pub fn spawn<R: RepeatableTask>(self, task: Arc<R>) -> Result<TaskThread, SpindleError> {
        let control = Arc::new(Control {
            stop: AtomicBool::new(false),
            cancel: CancelToken::new(),
        });

        let handle = {
            let name = self.name.clone();
            let control = Arc::clone(&control);
            let task = Arc::clone(&task);
            let handler = self.exception_handler;
            let continue_after_exception = self.continue_after_exception;
            thread::Builder::new().name(self.name.clone()).spawn(move || {
                run_loop(&name, task.as_ref(), &control, handler.as_ref(), continue_after_exception)
            })?
        };

        Ok(TaskThread {
            name: self.name,
            control,
            task,
            handle: Mutex::new(Some(handle)),
        })
    }
}

fn run_loop<R: RepeatableTask>(
    name: &str,
    task: &R,
    control: &Control,
    handler: Option<&ExceptionHandler>,
    continue_after_exception: bool,
) {
    loop {
        if let Err(fault) = invoke(|| task.run_once(&control.cancel)) {
            report_fault(name, &fault, handler);
            if !continue_after_exception {
                error!(thread = %name, "execution terminating due to exception");
                control.stop.store(true, Ordering::SeqCst);
            }
        }

        if control.stop.load(Ordering::SeqCst) || !task.continue_execution() {
            break;
        }
    }

    debug!(thread = %name, "terminated");
}

/// A private thread looping over one [`RepeatableTask`].
///
/// A faulting iteration never kills the thread by itself: the fault goes to
/// the exception handler (or the log) and the loop carries on unless
/// `continue_after_exception(false)` was requested.
pub struct TaskThread {
    name: String,
    control: Arc<Control>,
    task: Arc<dyn Task>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TaskThread {
    pub fn builder(name: impl Into<String>) -> TaskThreadBuilder {
        TaskThreadBuilder {
            name: name.into(),
            continue_after_exception: true,
            exception_handler: None,
        }
    }

    /// Spawn with default settings.
    pub fn spawn<R: RepeatableTask>(
        name: impl Into<String>,
        task: Arc<R>,
    ) -> Result<TaskThread, SpindleError> {
        Self::builder(name).spawn(task)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the loop to stop. Safe from any thread; does not wait.
    ///
    /// Sets the stop flag, cancels the token handed to the running
    /// iteration and calls the task's [`Task::terminate`] hook.
    pub fn terminate(&self) {
        self.control.stop.store(true, Ordering::SeqCst);
        self.control.cancel.cancel();
        self.task.terminate();
    }

    /// Reflects the stop flag only; the thread may still be unwinding.
    pub fn is_terminated(&self) -> bool {
        self.control.stop.load(Ordering::SeqCst)
    }

    /// Whether the OS thread has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.lock().as_ref().map_or(true, |h| h.is_finished())
    }

    /// Wait for the thread to exit. A no-op when called from the thread
    /// itself or when already joined.
    pub fn join(&self) {
        let handle = {
            let mut slot = self.handle.lock();
            match slot.as_ref() {
                Some(h) if h.thread().id() == thread::current().id() => return,
                Some(_) => slot.take(),
                None => None,
            }
        };
        if let Some(handle) = handle {
            // Bodies run under catch_unwind, so a join error is not expected.
            if handle.join().is_err() {
                error!(thread = %self.name, "thread panicked outside a task body");
            }
        }
    }
}

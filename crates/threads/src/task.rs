use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use spindle_core::TaskFault;

use crate::cancel::CancelToken;

/// Callback receiving every fault a task body raises.
pub type ExceptionHandler = Arc<dyn Fn(&TaskFault) + Send + Sync>;

/// Control surface shared by all repeatable work.
///
/// `terminate` is called from whichever thread stops the task, possibly
/// while an iteration is still running, hence `Sync`.
pub trait Task: Send + Sync + 'static {
    /// Whether another iteration should run.
    fn continue_execution(&self) -> bool {
        true
    }

    /// Cleanup hook invoked when the owning thread is told to stop.
    fn terminate(&self) {}
}

/// A [`Task`] with a single-iteration body.
///
/// The body must not loop forever itself; the executing thread owns the
/// loop so that faults and stop requests are handled uniformly.
pub trait RepeatableTask: Task {
    type Output: Send + 'static;

    fn run_once(&self, cancel: &CancelToken) -> anyhow::Result<Self::Output>;
}

/// Closure-backed [`RepeatableTask`]; see [`task_fn`].
pub struct FnTask<F, C = fn() -> bool> {
    body: F,
    keep_going: Option<C>,
}

/// Build a repeatable task from a closure. It runs until stopped from the
/// outside unless [`FnTask::repeat_while`] supplies a continuation predicate.
pub fn task_fn<T, F>(body: F) -> FnTask<F>
where
    F: Fn(&CancelToken) -> anyhow::Result<T> + Send + Sync + 'static,
    T: Send + 'static,
{
    FnTask { body, keep_going: None }
}

impl<F> FnTask<F> {
    /// Keep iterating only while `keep_going` returns true.
    pub fn repeat_while<C>(self, keep_going: C) -> FnTask<F, C>
    where
        C: Fn() -> bool + Send + Sync + 'static,
    {
        FnTask { body: self.body, keep_going: Some(keep_going) }
    }
}

impl<F, C> Task for FnTask<F, C>
where
    F: Send + Sync + 'static,
    C: Fn() -> bool + Send + Sync + 'static,
{
    fn continue_execution(&self) -> bool {
        self.keep_going.as_ref().map_or(true, |f| f())
    }
}

impl<T, F, C> RepeatableTask for FnTask<F, C>
where
    F: Fn(&CancelToken) -> anyhow::Result<T> + Send + Sync + 'static,
    C: Fn() -> bool + Send + Sync + 'static,
    T: Send + 'static,
{
    type Output = T;

    fn run_once(&self, cancel: &CancelToken) -> anyhow::Result<T> {
        (self.body)(cancel)
    }
}

/// Whether a work item produces a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkKind {
    NoResult,
    WithResult,
}

type Body<T> = Box<dyn FnMut(&CancelToken) -> anyhow::Result<T> + Send>;

/// A unit of work tagged with an id used in logs and errors.
pub struct WorkItem<T> {
    id: String,
    kind: WorkKind,
    body: Body<T>,
}

impl WorkItem<()> {
    /// Work that only has side effects.
    pub fn no_result<F>(id: impl Into<String>, body: F) -> Self
    where
        F: FnMut(&CancelToken) -> anyhow::Result<()> + Send + 'static,
    {
        Self { id: id.into(), kind: WorkKind::NoResult, body: Box::new(body) }
    }
}

impl<T: Send + 'static> WorkItem<T> {
    /// Work that yields a value to whoever waits on its handle.
    pub fn with_result<F>(id: impl Into<String>, body: F) -> Self
    where
        F: FnMut(&CancelToken) -> anyhow::Result<T> + Send + 'static,
    {
        Self { id: id.into(), kind: WorkKind::WithResult, body: Box::new(body) }
    }

    /// Like [`WorkItem::with_result`] with a random id.
    pub fn anonymous<F>(body: F) -> Self
    where
        F: FnMut(&CancelToken) -> anyhow::Result<T> + Send + 'static,
    {
        Self::with_result(uuid::Uuid::new_v4().to_string(), body)
    }
}

impl<T> WorkItem<T> {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> WorkKind {
        self.kind
    }

    /// Run the body once. Errors and panics both come back as a fault.
    pub fn run(&mut self, cancel: &CancelToken) -> Result<T, TaskFault> {
        invoke(|| (self.body)(cancel))
    }
}

impl<T> fmt::Debug for WorkItem<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Call a body, converting a returned error or a panic into a [`TaskFault`].
pub(crate) fn invoke<T>(body: impl FnOnce() -> anyhow::Result<T>) -> Result<T, TaskFault> {
    match catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(TaskFault::from(err)),
        Err(payload) => Err(TaskFault::from_panic(payload)),
    }
}

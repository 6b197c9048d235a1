use std::sync::Arc;

use thiserror::Error;

/// A fault raised by a task body: either a returned error or a panic.
///
/// Cloneable so that every caller waiting on the same handle observes it.
#[derive(Error, Debug, Clone)]
pub enum TaskFault {
    #[error("{0:#}")]
    Error(Arc<anyhow::Error>),

    #[error("task panicked: {0}")]
    Panic(String),
}

impl TaskFault {
    /// Build a fault from a panic payload caught with `catch_unwind`.
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        TaskFault::Panic(message)
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, TaskFault::Panic(_))
    }
}

impl From<anyhow::Error> for TaskFault {
    fn from(err: anyhow::Error) -> Self {
        TaskFault::Error(Arc::new(err))
    }
}

#[derive(Error, Debug)]
pub enum SpindleError {
    /// Submission or scheduling attempted after shutdown.
    #[error("thread pool is shut down")]
    Shutdown,

    /// Operation not valid in the current lifecycle state.
    #[error("illegal state: expected {expected} but was {actual}")]
    IllegalState {
        expected: &'static str,
        actual: &'static str,
    },

    /// The work behind a handle was cancelled.
    #[error("task {id} was cancelled")]
    Cancelled { id: String },

    /// The work behind a handle ended with a fault.
    #[error("task {id} failed: {fault}")]
    Failed { id: String, fault: TaskFault },

    /// A bounded wait elapsed before the work finished.
    #[error("timed out waiting for task {id}")]
    Timeout { id: String },

    /// Rejected argument, e.g. a zero repeat interval.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl SpindleError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SpindleError::Cancelled { .. })
    }

    /// The task fault carried by a `Failed` error.
    pub fn fault(&self) -> Option<&TaskFault> {
        match self {
            SpindleError::Failed { fault, .. } => Some(fault),
            _ => None,
        }
    }
}

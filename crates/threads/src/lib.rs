//! In-process task execution: a fixed-size worker pool with a delay and
//! periodic timer, plus a supervisor for tasks that run indefinitely on
//! their own thread.

pub mod cancel;
pub mod future;
mod job;
pub mod metrics;
pub mod pool;
mod queue;
pub mod supervisor;
pub mod task;
pub mod thread;
pub mod timer;

pub use cancel::{CancelToken, Cancelled};
pub use future::TaskFuture;
pub use metrics::PoolMetrics;
pub use pool::ThreadPool;
pub use supervisor::{LongLivedHandle, LongLivedState, LongLivedTask};
pub use task::{task_fn, ExceptionHandler, FnTask, RepeatableTask, Task, WorkItem, WorkKind};
pub use thread::{TaskThread, TaskThreadBuilder};
pub use timer::{EventState, ScheduledHandle, Timer};

pub use spindle_core::{Config, PoolConfig, SpindleError, TaskConfig, TaskFault};

//! Timer engine: a time-ordered event queue drained by one thread.
//!
//! Events are ordered by `(next execution, insertion sequence)`, so two
//! events due in the same instant dispatch in the order they were queued.
//! Dispatch means handing the event to the worker queue of the owning
//! [`ThreadPool`](crate::ThreadPool); completion order after that depends on
//! worker availability.

mod engine;
mod event;

pub use engine::Timer;
pub use event::{EventState, ScheduledHandle};

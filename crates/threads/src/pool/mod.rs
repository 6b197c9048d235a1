//! Fixed-size worker pool with an attached timer.
//!
//! Split into focused submodules:
//! - `core`: ThreadPool struct, construction, submission and shutdown
//! - `scheduling`: delayed and periodic work routed through the pool's timer
//! - `worker`: the loop each pool thread runs over the shared queue

mod core;
mod scheduling;
mod worker;

pub use self::core::ThreadPool;

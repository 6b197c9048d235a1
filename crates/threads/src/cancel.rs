//! Cooperative cancellation shared between a running body and whoever
//! wants it to stop.
//!
//! Every body executed by this crate receives a [`CancelToken`]. Bodies
//! that block should do so through [`CancelToken::sleep`] or
//! [`CancelToken::wait_timeout`] so that a cancel wakes them immediately;
//! bodies that spin should poll [`CancelToken::is_cancelled`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Returned by interruptible waits when the token was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cancelled while waiting")]
pub struct Cancelled;

#[derive(Debug, Default)]
struct Inner {
    flag: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

/// Cloneable cancellation flag with interruptible waits.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag and wake every waiter.
    pub fn cancel(&self) {
        let _guard = self.inner.lock.lock();
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.cond.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Clear the flag. Pool workers do this before every job so that a
    /// cancel aimed at one job does not leak into the next.
    pub(crate) fn reset(&self) {
        let _guard = self.inner.lock.lock();
        self.inner.flag.store(false, Ordering::SeqCst);
    }

    /// Sleep for `duration` unless cancelled first.
    ///
    /// A duration too large to express as a deadline sleeps until cancelled.
    pub fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        let deadline = Instant::now().checked_add(duration);
        let mut guard = self.inner.lock.lock();
        loop {
            if self.is_cancelled() {
                return Err(Cancelled);
            }
            match deadline {
                Some(deadline) if Instant::now() >= deadline => return Ok(()),
                Some(deadline) => {
                    self.inner.cond.wait_until(&mut guard, deadline);
                }
                None => self.inner.cond.wait(&mut guard),
            }
        }
    }

    /// Wait until cancelled or `timeout` elapses. Returns `true` if the
    /// token was cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.sleep(timeout).is_err()
    }

    /// `Err(Cancelled)` if the flag is set; for `?` at yield points.
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn sleep_runs_to_completion_when_not_cancelled() {
        let token = CancelToken::new();
        let start = Instant::now();
        assert_eq!(token.sleep(Duration::from_millis(30)), Ok(()));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn cancel_wakes_sleeper() {
        let token = CancelToken::new();
        let remote = token.clone();
        let start = Instant::now();
        let sleeper = thread::spawn(move || remote.sleep(Duration::from_secs(10)));

        thread::sleep(Duration::from_millis(50));
        token.cancel();

        assert_eq!(sleeper.join().unwrap(), Err(Cancelled));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn reset_clears_flag() {
        let token = CancelToken::new();
        token.cancel();
        assert!(token.is_cancelled());
        assert_eq!(token.check(), Err(Cancelled));

        token.reset();
        assert!(!token.is_cancelled());
        assert!(!token.wait_timeout(Duration::from_millis(5)));
    }

    #[test]
    fn unbounded_sleep_ends_on_cancel() {
        let token = CancelToken::new();
        let remote = token.clone();
        let sleeper = thread::spawn(move || remote.sleep(Duration::MAX));

        thread::sleep(Duration::from_millis(30));
        token.cancel();
        assert_eq!(sleeper.join().unwrap(), Err(Cancelled));
    }
}

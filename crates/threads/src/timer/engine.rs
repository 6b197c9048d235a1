use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use spindle_core::SpindleError;
use tracing::{debug, info, trace};

use crate::cancel::CancelToken;
use crate::job::Dispatcher;
use crate::metrics::PoolCounters;
use crate::task::{RepeatableTask, Task, WorkItem};
use crate::thread::TaskThread;

use super::event::{Repeat, ScheduledEvent, ScheduledHandle, TimedJob};

/// Timer queue entry, ordered by `(due, seq)` ascending.
struct QueueEntry {
    due: Instant,
    seq: u64,
    event: Arc<dyn TimedJob>,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap, the earliest entry must be on top.
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct TimerQueue {
    heap: BinaryHeap<QueueEntry>,
    terminated: bool,
}

/// State shared by the timer thread, the [`Timer`] handle and every
/// periodic event (through a weak reference, for requeueing).
pub(crate) struct TimerShared {
    queue: Mutex<TimerQueue>,
    wakeup: Condvar,
    next_seq: AtomicU64,
    dispatcher: Arc<Dispatcher>,
}

impl TimerShared {
    /// Insert an event and wake the timer thread: the queue may have been
    /// empty, or the new event may be due before the current head.
    pub(crate) fn add(&self, event: Arc<dyn TimedJob>) -> Result<(), SpindleError> {
        // Read before taking the queue lock: it locks the event.
        let due = event.next_execution();
        let mut queue = self.queue.lock();
        if queue.terminated {
            return Err(SpindleError::Shutdown);
        }
        trace!(id = %event.id(), "scheduling event");
        queue.heap.push(QueueEntry {
            due,
            seq: self.next_seq.fetch_add(1, AtomicOrdering::Relaxed),
            event,
        });
        self.wakeup.notify_all();
        Ok(())
    }

    /// Drop a queued event. Returns whether it was found.
    pub(crate) fn remove(&self, key: u64) -> bool {
        let mut queue = self.queue.lock();
        let before = queue.heap.len();
        queue.heap.retain(|entry| entry.event.key() != key);
        let removed = queue.heap.len() != before;
        if removed {
            self.wakeup.notify_all();
        }
        removed
    }

    fn pending(&self) -> usize {
        self.queue.lock().heap.len()
    }

    fn is_terminated(&self) -> bool {
        self.queue.lock().terminated
    }

    /// Stop accepting events and hand back whatever was still queued.
    fn terminate_and_drain(&self) -> Vec<Arc<dyn TimedJob>> {
        let mut queue = self.queue.lock();
        queue.terminated = true;
        self.wakeup.notify_all();
        queue.heap.drain().map(|entry| entry.event).collect()
    }

    /// Hand a due event to the worker queue unless it was cancelled after
    /// leaving the timer queue.
    fn dispatch(&self, event: Arc<dyn TimedJob>) {
        if !event.mark_dispatched() {
            trace!(id = %event.id(), "dropping cancelled event");
            return;
        }
        trace!(id = %event.id(), "submitting event for execution");
        PoolCounters::incr(&self.dispatcher.counters.dispatched);
        // A closed queue abandons the event, which releases its waiters.
        let _ = self.dispatcher.dispatch(event.into_job());
    }
}

impl Task for TimerShared {
    fn continue_execution(&self) -> bool {
        !self.is_terminated()
    }

    fn terminate(&self) {
        let mut queue = self.queue.lock();
        queue.terminated = true;
        self.wakeup.notify_all();
    }
}

impl RepeatableTask for TimerShared {
    type Output = ();

    /// Wait for the earliest event to come due and dispatch it.
    fn run_once(&self, _cancel: &CancelToken) -> anyhow::Result<()> {
        let mut queue = self.queue.lock();
        let due = loop {
            if queue.terminated {
                return Ok(());
            }
            let Some(head) = queue.heap.peek() else {
                self.wakeup.wait(&mut queue);
                continue;
            };
            // Re-checked after every wake: an earlier event or a cancel may
            // have replaced the head.
            let deadline = head.due;
            if deadline > Instant::now() {
                self.wakeup.wait_until(&mut queue, deadline);
                continue;
            }
            break queue.heap.pop();
        };
        drop(queue);

        if let Some(entry) = due {
            self.dispatch(entry.event);
        }
        Ok(())
    }
}

/// Delay and periodic scheduling on one dedicated thread.
///
/// Due events are not run on the timer thread; they are handed to the
/// owning pool's worker queue so slow work never delays the timer.
pub struct Timer {
    shared: Arc<TimerShared>,
    thread: TaskThread,
}

impl Timer {
    pub(crate) fn start(name: String, dispatcher: Arc<Dispatcher>) -> Result<Self, SpindleError> {
        let shared = Arc::new(TimerShared {
            queue: Mutex::new(TimerQueue {
                heap: BinaryHeap::new(),
                terminated: false,
            }),
            wakeup: Condvar::new(),
            next_seq: AtomicU64::new(0),
            dispatcher,
        });
        let thread = TaskThread::spawn(name, Arc::clone(&shared))?;
        Ok(Self { shared, thread })
    }

    fn insert<T: Send + 'static>(
        &self,
        item: WorkItem<T>,
        first: Instant,
        repeat: Repeat,
    ) -> Result<ScheduledHandle<T>, SpindleError> {
        if self.shared.is_terminated() {
            return Err(SpindleError::Shutdown);
        }
        let event = ScheduledEvent::new(item, first, repeat, Arc::downgrade(&self.shared));
        self.shared.add(Arc::clone(&event) as Arc<dyn TimedJob>)?;
        PoolCounters::incr(&self.shared.dispatcher.counters.scheduled);
        Ok(ScheduledHandle::new(event))
    }

    /// Run `item` once after `delay`.
    pub fn schedule<T: Send + 'static>(
        &self,
        item: WorkItem<T>,
        delay: Duration,
    ) -> Result<ScheduledHandle<T>, SpindleError> {
        let first = due_after(&item, delay)?;
        self.insert(item, first, Repeat::Once)
    }

    /// Run `item` after `initial_delay`, then again `delay` after each run
    /// finishes.
    pub fn schedule_with_fixed_delay(
        &self,
        item: WorkItem<()>,
        initial_delay: Duration,
        delay: Duration,
    ) -> Result<ScheduledHandle<()>, SpindleError> {
        check_interval(&item, delay)?;
        let first = due_after(&item, initial_delay)?;
        self.insert(item, first, Repeat::FixedDelay(delay))
    }

    /// Run `item` after `initial_delay`, then every `period` measured from
    /// the previous scheduled start.
    ///
    /// Runs never overlap: the next start is computed once the previous run
    /// returns. A run longer than `period` is followed immediately by the
    /// next one, and the schedule restarts from there without catching up.
    pub fn schedule_at_fixed_rate(
        &self,
        item: WorkItem<()>,
        initial_delay: Duration,
        period: Duration,
    ) -> Result<ScheduledHandle<()>, SpindleError> {
        check_interval(&item, period)?;
        let first = due_after(&item, initial_delay)?;
        self.insert(item, first, Repeat::FixedRate(period))
    }

    /// Events waiting in the queue.
    pub fn pending(&self) -> usize {
        self.shared.pending()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.is_terminated()
    }

    /// Stop the timer thread without dispatching anything else. Queued
    /// events are cancelled. Safe to call more than once.
    pub fn shutdown(&self) {
        let drained = self.shared.terminate_and_drain();
        for event in &drained {
            event.abandon();
        }
        self.thread.terminate();
        self.thread.join();
        if !drained.is_empty() {
            info!(count = drained.len(), "timer discarded queued events");
        }
        debug!(thread = %self.thread.name(), "timer stopped");
    }
}

fn check_interval<T>(item: &WorkItem<T>, interval: Duration) -> Result<(), SpindleError> {
    if interval.is_zero() {
        return Err(SpindleError::InvalidArgument(format!(
            "repeat interval for {} must be greater than zero",
            item.id()
        )));
    }
    due_after(item, interval).map(|_| ())
}

/// `now + delay`, rejected when the instant is not representable.
fn due_after<T>(item: &WorkItem<T>, delay: Duration) -> Result<Instant, SpindleError> {
    Instant::now().checked_add(delay).ok_or_else(|| {
        SpindleError::InvalidArgument(format!("delay {delay:?} for {} is out of range", item.id()))
    })
}

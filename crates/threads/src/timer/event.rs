use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use spindle_core::{SpindleError, TaskFault};
use tracing::trace;

use crate::cancel::CancelToken;
use crate::job::{Job, JobOutcome};
use crate::task::WorkItem;

use super::engine::TimerShared;

static NEXT_EVENT_KEY: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a scheduled event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventState {
    /// Waiting in the timer queue, or handed back to it after a period.
    Pending,
    /// Dispatched to the worker queue or executing.
    Running,
    /// One-shot event finished (with a value or a fault).
    Completed,
    Cancelled,
    /// Cancel requested while a periodic run was in flight; becomes
    /// `Cancelled` once that run returns.
    TryToCancel,
}

/// When an event runs again after it runs once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Repeat {
    Once,
    /// Next run = completion of the previous run + interval.
    FixedDelay(Duration),
    /// Next run = previous scheduled time + interval, but never earlier
    /// than the moment the previous run returned. Runs never overlap, and a
    /// slow run delays the next one instead of causing a catch-up burst.
    FixedRate(Duration),
}

/// Type-erased view the timer queue works with.
pub(crate) trait TimedJob: Job {
    fn key(&self) -> u64;

    fn next_execution(&self) -> Instant;

    /// Pending -> Running under the event lock. `false` means the event was
    /// cancelled while queued and must not be dispatched.
    fn mark_dispatched(&self) -> bool;

    fn into_job(self: Arc<Self>) -> Arc<dyn Job>;
}

struct Progress<T> {
    state: EventState,
    next_execution: Instant,
    /// Token of the worker currently executing this event.
    running: Option<CancelToken>,
    result: Option<Result<T, TaskFault>>,
    last_fault: Option<TaskFault>,
    runs: u64,
}

pub(crate) struct ScheduledEvent<T> {
    key: u64,
    id: String,
    repeat: Repeat,
    progress: Mutex<Progress<T>>,
    changed: Condvar,
    item: Mutex<WorkItem<T>>,
    timer: Weak<TimerShared>,
}

impl<T: Send + 'static> ScheduledEvent<T> {
    pub(crate) fn new(
        item: WorkItem<T>,
        first_execution: Instant,
        repeat: Repeat,
        timer: Weak<TimerShared>,
    ) -> Arc<Self> {
        Arc::new(Self {
            key: NEXT_EVENT_KEY.fetch_add(1, Ordering::Relaxed),
            id: item.id().to_string(),
            repeat,
            progress: Mutex::new(Progress {
                state: EventState::Pending,
                next_execution: first_execution,
                running: None,
                result: None,
                last_fault: None,
                runs: 0,
            }),
            changed: Condvar::new(),
            item: Mutex::new(item),
            timer,
        })
    }

    /// Bookkeeping after a run returns: settle one-shot events, and
    /// recompute and requeue periodic ones.
    fn post_execute(self: Arc<Self>, result: Result<T, TaskFault>) {
        let mut progress = self.progress.lock();
        progress.running = None;
        progress.runs += 1;

        let requeue = match self.repeat {
            Repeat::Once => {
                if progress.state == EventState::Running {
                    progress.state = EventState::Completed;
                    progress.result = Some(result);
                }
                false
            }
            Repeat::FixedDelay(interval) | Repeat::FixedRate(interval) => match progress.state {
                EventState::Cancelled => false,
                EventState::TryToCancel => {
                    progress.state = EventState::Cancelled;
                    false
                }
                EventState::Pending | EventState::Running | EventState::Completed => {
                    if let Err(fault) = result {
                        progress.last_fault = Some(fault);
                    }
                    let now = Instant::now();
                    let next = match self.repeat {
                        // An overrun starts the next period now rather than
                        // replaying every missed one back to back.
                        Repeat::FixedRate(_) => progress
                            .next_execution
                            .checked_add(interval)
                            .map(|next| next.max(now)),
                        _ => now.checked_add(interval),
                    };
                    match next {
                        Some(next) => {
                            progress.next_execution = next;
                            progress.state = EventState::Pending;
                            true
                        }
                        None => {
                            trace!(id = %self.id, "next run out of range, periodic event stops");
                            progress.state = EventState::Cancelled;
                            false
                        }
                    }
                }
            },
        };
        self.changed.notify_all();
        drop(progress);

        if requeue {
            let requeued = match self.timer.upgrade() {
                Some(timer) => timer.add(Arc::clone(&self) as Arc<dyn TimedJob>).is_ok(),
                None => false,
            };
            if !requeued {
                trace!(id = %self.id, "timer gone, periodic event stops");
                self.abandon();
            }
        }
    }
}

impl<T> ScheduledEvent<T> {
    fn is_periodic(&self) -> bool {
        self.repeat != Repeat::Once
    }

    fn cancel(&self, interrupt_if_running: bool) -> bool {
        let mut progress = self.progress.lock();
        match progress.state {
            EventState::Pending => {
                progress.state = EventState::Cancelled;
                self.changed.notify_all();
                drop(progress);
                if let Some(timer) = self.timer.upgrade() {
                    timer.remove(self.key);
                }
                true
            }
            EventState::Running => {
                if interrupt_if_running {
                    if let Some(token) = &progress.running {
                        token.cancel();
                    }
                }
                progress.state = if self.is_periodic() {
                    EventState::TryToCancel
                } else {
                    EventState::Cancelled
                };
                self.changed.notify_all();
                true
            }
            EventState::Completed | EventState::Cancelled | EventState::TryToCancel => false,
        }
    }
}

impl<T: Send + 'static> Job for ScheduledEvent<T> {
    fn id(&self) -> &str {
        &self.id
    }

    fn execute(self: Arc<Self>, cancel: &CancelToken) -> JobOutcome {
        {
            let mut progress = self.progress.lock();
            match progress.state {
                EventState::Running => progress.running = Some(cancel.clone()),
                EventState::TryToCancel => {
                    progress.state = EventState::Cancelled;
                    self.changed.notify_all();
                    return JobOutcome::Skipped;
                }
                _ => return JobOutcome::Skipped,
            }
        }

        let result = self.item.lock().run(cancel);
        let outcome = match &result {
            Ok(_) => JobOutcome::Completed,
            Err(fault) => JobOutcome::Failed(fault.clone()),
        };
        self.post_execute(result);
        outcome
    }

    fn abandon(&self) {
        let mut progress = self.progress.lock();
        if matches!(
            progress.state,
            EventState::Pending | EventState::Running | EventState::TryToCancel
        ) {
            progress.state = EventState::Cancelled;
            self.changed.notify_all();
        }
    }
}

impl<T: Send + 'static> TimedJob for ScheduledEvent<T> {
    fn key(&self) -> u64 {
        self.key
    }

    fn next_execution(&self) -> Instant {
        self.progress.lock().next_execution
    }

    fn mark_dispatched(&self) -> bool {
        let mut progress = self.progress.lock();
        if progress.state == EventState::Pending {
            progress.state = EventState::Running;
            true
        } else {
            false
        }
    }

    fn into_job(self: Arc<Self>) -> Arc<dyn Job> {
        self
    }
}

/// Handle to an event scheduled on a timer.
///
/// Periodic events never complete on their own: `get` on them blocks until
/// the event is cancelled and then reports the cancellation.
pub struct ScheduledHandle<T> {
    event: Arc<ScheduledEvent<T>>,
}

impl<T> Clone for ScheduledHandle<T> {
    fn clone(&self) -> Self {
        Self { event: Arc::clone(&self.event) }
    }
}

impl<T> fmt::Debug for ScheduledHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledHandle")
            .field("id", &self.event.id)
            .field("state", &self.state())
            .field("periodic", &self.is_periodic())
            .finish()
    }
}

fn is_final(state: EventState) -> bool {
    matches!(
        state,
        EventState::Completed | EventState::Cancelled | EventState::TryToCancel
    )
}

impl<T> ScheduledHandle<T> {
    pub(crate) fn new(event: Arc<ScheduledEvent<T>>) -> Self {
        Self { event }
    }

    pub fn id(&self) -> &str {
        &self.event.id
    }

    pub fn is_periodic(&self) -> bool {
        self.event.is_periodic()
    }

    pub fn state(&self) -> EventState {
        self.event.progress.lock().state
    }

    /// Cancel the event. A queued event is removed and never runs; an
    /// executing event finishes its current run (its token is tripped with
    /// `interrupt_if_running`) and is not rescheduled. Returns `false` if it
    /// was already completed or cancelled.
    pub fn cancel(&self, interrupt_if_running: bool) -> bool {
        self.event.cancel(interrupt_if_running)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.state(), EventState::Cancelled | EventState::TryToCancel)
    }

    pub fn is_done(&self) -> bool {
        is_final(self.state())
    }

    /// Time left until the next run, zero when due or overdue.
    pub fn delay(&self) -> Duration {
        self.event
            .progress
            .lock()
            .next_execution
            .saturating_duration_since(Instant::now())
    }

    /// How many runs have finished so far.
    pub fn run_count(&self) -> u64 {
        self.event.progress.lock().runs
    }

    /// The most recent fault of a periodic event. Periodic faults are
    /// logged and the schedule carries on.
    pub fn last_fault(&self) -> Option<TaskFault> {
        self.event.progress.lock().last_fault.clone()
    }
}

impl<T: Clone> ScheduledHandle<T> {
    /// Block until the event completes or is cancelled.
    pub fn get(&self) -> Result<T, SpindleError> {
        let mut progress = self.event.progress.lock();
        while !is_final(progress.state) {
            self.event.changed.wait(&mut progress);
        }
        self.read(&progress)
    }

    /// Like [`ScheduledHandle::get`], giving up after `timeout`.
    pub fn get_timeout(&self, timeout: Duration) -> Result<T, SpindleError> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return self.get();
        };
        let mut progress = self.event.progress.lock();
        while !is_final(progress.state) {
            if self.event.changed.wait_until(&mut progress, deadline).timed_out()
                && !is_final(progress.state)
            {
                return Err(SpindleError::Timeout { id: self.event.id.clone() });
            }
        }
        self.read(&progress)
    }

    fn read(&self, progress: &Progress<T>) -> Result<T, SpindleError> {
        let id = self.event.id.clone();
        match (&progress.state, &progress.result) {
            (EventState::Completed, Some(Ok(value))) => Ok(value.clone()),
            (EventState::Completed, Some(Err(fault))) => {
                Err(SpindleError::Failed { id, fault: fault.clone() })
            }
            (EventState::Cancelled | EventState::TryToCancel, _) => Err(SpindleError::Cancelled { id }),
            _ => Err(SpindleError::Timeout { id }),
        }
    }
}

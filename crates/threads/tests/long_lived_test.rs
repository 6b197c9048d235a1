//! Long-lived task supervision from the caller's point of view.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use spindle_threads::{
    task_fn, CancelToken, LongLivedState, LongLivedTask, RepeatableTask, SpindleError, Task,
};

/// Appends a counter to a shared list until ten entries exist.
struct Appender {
    entries: Arc<Mutex<Vec<usize>>>,
    stopped: AtomicBool,
}

impl Task for Appender {
    fn continue_execution(&self) -> bool {
        self.entries.lock().len() < 10
    }

    fn terminate(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

impl RepeatableTask for Appender {
    type Output = bool;

    fn run_once(&self, cancel: &CancelToken) -> anyhow::Result<bool> {
        let mut entries = self.entries.lock();
        let next = entries.len();
        entries.push(next);
        drop(entries);
        cancel.sleep(Duration::from_millis(10))?;
        Ok(true)
    }
}

fn appender() -> (Arc<Appender>, Arc<Mutex<Vec<usize>>>) {
    let entries = Arc::new(Mutex::new(Vec::new()));
    let task = Arc::new(Appender {
        entries: Arc::clone(&entries),
        stopped: AtomicBool::new(false),
    });
    (task, entries)
}

#[test]
fn runs_until_task_says_stop() {
    let (task, entries) = appender();
    let supervised = LongLivedTask::new("appender", task);

    let result = supervised.start().unwrap().get().unwrap();
    assert_eq!(result, Some(true));
    assert_eq!(*entries.lock(), (0..10).collect::<Vec<_>>());
    assert_eq!(supervised.state(), LongLivedState::Terminated);
}

#[test]
fn thread_carries_task_name() {
    let supervised = LongLivedTask::new(
        "named-poller",
        Arc::new(
            task_fn(|_| Ok(thread::current().name().map(str::to_string))).repeat_while(|| false),
        ),
    );
    let name = supervised.start().unwrap().get().unwrap().flatten();
    assert_eq!(name.as_deref(), Some("named-poller"));
}

#[test]
fn faults_do_not_stop_by_default() {
    let supervised = LongLivedTask::new(
        "keeps-going",
        Arc::new(task_fn(|cancel| -> anyhow::Result<()> {
            cancel.sleep(Duration::from_millis(20))?;
            anyhow::bail!("test exception")
        })),
    );
    supervised.set_exception_handler(|_| {});
    let handle = supervised.start().unwrap();

    thread::sleep(Duration::from_millis(150));
    assert!(!handle.is_cancelled());
    assert!(!handle.is_done());

    assert!(handle.cancel(true));
    handle.join();
    assert!(handle.is_cancelled());
}

#[test]
fn fault_stops_execution_when_configured() {
    let seen = Arc::new(AtomicUsize::new(0));
    let supervised = LongLivedTask::new(
        "stops",
        Arc::new(task_fn(|cancel| -> anyhow::Result<()> {
            cancel.sleep(Duration::from_millis(50))?;
            anyhow::bail!("test exception")
        })),
    );
    supervised.set_continue_after_exception(false);
    let s = Arc::clone(&seen);
    supervised.set_exception_handler(move |_| {
        s.fetch_add(1, Ordering::SeqCst);
    });

    let handle = supervised.start().unwrap();
    let err = handle.get_timeout(Duration::from_secs(1)).unwrap_err();
    assert!(matches!(err, SpindleError::Failed { ref id, .. } if id == "stops"));
    assert!(!handle.is_cancelled());
    assert!(handle.is_done());
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[test]
fn cancel_releases_blocked_getter() {
    let (task, _entries) = appender();
    let endless = Arc::new(task_fn(move |cancel| {
        task.run_once(cancel)?;
        Ok(())
    }));
    let supervised = LongLivedTask::new("endless", endless);
    let handle = supervised.start().unwrap();

    let waiter = {
        let handle = handle.clone();
        thread::spawn(move || handle.get())
    };
    thread::sleep(Duration::from_millis(50));
    assert!(handle.cancel(false));

    assert!(waiter.join().unwrap().unwrap_err().is_cancelled());
    handle.join();
    assert_eq!(handle.state(), LongLivedState::Cancelled);
}

#[test]
fn cancel_invokes_terminate_hook() {
    let (task, _entries) = appender();
    let supervised = LongLivedTask::new("hooked", Arc::clone(&task));
    let handle = supervised.start().unwrap();

    assert!(handle.cancel(true));
    handle.join();
    assert!(task.stopped.load(Ordering::SeqCst));
    assert_eq!(handle.state(), LongLivedState::Cancelled);
}

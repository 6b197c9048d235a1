//! End-to-end pool behaviour across worker counts and configuration sources.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use spindle_threads::{Config, PoolConfig, SpindleError, ThreadPool, WorkItem};

/// Submit twice as many sleeping jobs as there are workers and check that
/// each one runs once and that workers actually run them side by side.
fn run_with_workers(workers: usize) {
    let pool = ThreadPool::with_size(workers).unwrap();
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let futures: Vec<_> = (0..workers * 2)
        .map(|i| {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            pool.submit(WorkItem::with_result(format!("job-{i}"), move |_| {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(50));
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(i)
            }))
            .unwrap()
        })
        .collect();

    let mut results: Vec<usize> = futures.iter().map(|f| f.get().unwrap()).collect();
    results.sort_unstable();
    assert_eq!(results, (0..workers * 2).collect::<Vec<_>>());

    // Two rounds of 50ms each at minimum.
    assert!(start.elapsed() >= Duration::from_millis(95));
    assert!(peak.load(Ordering::SeqCst) <= workers);

    pool.shutdown();
    let metrics = pool.metrics();
    assert_eq!(metrics.submitted, (workers * 2) as u64);
    assert_eq!(metrics.completed, (workers * 2) as u64);
    assert_eq!(metrics.active_workers, 0);
}

#[test]
fn single_worker() {
    run_with_workers(1);
}

#[test]
fn two_workers() {
    run_with_workers(2);
}

#[test]
fn four_workers() {
    run_with_workers(4);
}

#[test]
fn eight_workers() {
    run_with_workers(8);
}

#[test]
fn pool_from_toml_config() {
    let config = Config::from_toml_str(
        r#"
        [pool]
        size = 3
        thread_name_prefix = "toml-pool"
        "#,
    )
    .unwrap();
    let pool = ThreadPool::new(config.pool).unwrap();
    assert_eq!(pool.size(), 3);
    assert_eq!(pool.config().queue_warn_threshold, 1000);

    let name = pool
        .submit(WorkItem::with_result("whoami", |_| {
            Ok(thread::current().name().map(str::to_string))
        }))
        .unwrap()
        .get()
        .unwrap()
        .unwrap_or_default();
    assert!(name.starts_with("toml-pool-"), "ran on {name}");
}

#[test]
fn queue_above_warning_threshold_still_accepts_work() {
    let pool = ThreadPool::new(PoolConfig {
        queue_warn_threshold: 2,
        ..PoolConfig::with_size(1)
    })
    .unwrap();

    let futures: Vec<_> = (0..10)
        .map(|i| {
            pool.submit(WorkItem::with_result(format!("burst-{i}"), move |_| {
                thread::sleep(Duration::from_millis(2));
                Ok(i)
            }))
            .unwrap()
        })
        .collect();
    let sum: i32 = futures.iter().map(|f| f.get().unwrap()).sum();
    assert_eq!(sum, 45);
}

#[test]
fn dropping_pool_releases_waiters() {
    let pool = ThreadPool::with_size(1).unwrap();
    let blocker = pool
        .submit(WorkItem::no_result("blocker", |cancel| {
            cancel.sleep(Duration::from_secs(30))?;
            Ok(())
        }))
        .unwrap();
    let queued = pool.submit(WorkItem::with_result("queued", |_| Ok(1))).unwrap();

    thread::sleep(Duration::from_millis(50));
    drop(pool);

    assert!(blocker.is_done());
    assert!(matches!(queued.get(), Err(SpindleError::Cancelled { .. })));
}

#[test]
fn cancel_with_interrupt_stops_running_job() {
    let pool = ThreadPool::with_size(1).unwrap();
    let future = pool
        .submit(WorkItem::with_result("sleepy", |cancel| {
            cancel.sleep(Duration::from_secs(30))?;
            Ok("finished")
        }))
        .unwrap();
    thread::sleep(Duration::from_millis(50));

    let start = Instant::now();
    assert!(future.cancel(true));
    assert!(future.get().unwrap_err().is_cancelled());

    // The worker is free again well before the sleep would have ended.
    let next = pool.submit(WorkItem::with_result("next", |_| Ok(7))).unwrap();
    assert_eq!(next.get_timeout(Duration::from_secs(5)).unwrap(), 7);
    assert!(start.elapsed() < Duration::from_secs(5));
}

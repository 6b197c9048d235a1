//! spindle-demo: exercises the worker pool, its timer and a long-lived
//! supervised task, then prints a JSON metrics snapshot.
//!
//! Runs:
//! - `--tasks` submitted jobs that each return a value
//! - a fixed-rate heartbeat every `--rate-ms`
//! - a fixed-delay sampler that deliberately fails every third run
//! - a long-lived poller on its own thread, cancelled at the end

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use spindle_core::config::load_dotenv;
use spindle_threads::{task_fn, Config, LongLivedTask, ThreadPool, WorkItem};

// ── CLI ─────────────────────────────────────────────────────────────

/// Demo driver for the spindle thread pool and scheduler.
#[derive(Parser, Debug)]
#[command(name = "spindle-demo", version, about)]
struct Cli {
    /// Optional TOML config file; environment settings are used otherwise.
    #[arg(long, env = "SPINDLE_CONFIG")]
    config: Option<String>,

    /// Worker thread count (overrides config; 0 = available parallelism).
    #[arg(long)]
    pool_size: Option<usize>,

    /// Number of one-off jobs to submit.
    #[arg(long, env = "SPINDLE_DEMO_TASKS", default_value_t = 20)]
    tasks: u64,

    /// Heartbeat period in milliseconds.
    #[arg(long, env = "SPINDLE_DEMO_RATE_MS", default_value_t = 200)]
    rate_ms: u64,

    /// How long to let the periodic work run, in seconds.
    #[arg(long, env = "SPINDLE_DEMO_RUN_SECS", default_value_t = 3)]
    run_secs: u64,
}

fn load_config(cli: &Cli) -> Config {
    let mut config = match &cli.config {
        Some(path) => match Config::from_toml_file(path) {
            Ok(cfg) => {
                info!(path = %path, "loaded config file");
                cfg
            }
            Err(e) => {
                warn!(error = %e, path = %path, "failed to load config, using environment");
                Config::from_env()
            }
        },
        None => Config::from_env(),
    };
    if let Some(size) = cli.pool_size {
        config.pool.size = size;
    }
    config
}

// ── Work ────────────────────────────────────────────────────────────

/// Sum of squares below `n` (wrapping), with a short pause that honours
/// cancellation.
fn crunch(n: u64, cancel: &spindle_threads::CancelToken) -> anyhow::Result<u64> {
    cancel.sleep(Duration::from_millis(10 + n % 40))?;
    Ok((0..n).fold(0_u64, |acc, i| acc.wrapping_add(i.wrapping_mul(i))))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    load_dotenv();
    let cli = Cli::parse();
    let config = load_config(&cli);
    config.log_summary();

    let pool = ThreadPool::new(config.pool.clone()).context("starting thread pool")?;

    // One-off jobs.
    let futures = (1..=cli.tasks)
        .map(|i| {
            let n = i.saturating_mul(1_000);
            pool.submit(WorkItem::with_result(format!("crunch-{i}"), move |cancel| {
                crunch(n, cancel)
            }))
        })
        .collect::<Result<Vec<_>, _>>()?;

    // Periodic work.
    let beats = Arc::new(AtomicU64::new(0));
    let heartbeat = {
        let beats = Arc::clone(&beats);
        pool.schedule_at_fixed_rate(
            WorkItem::no_result("heartbeat", move |_| {
                beats.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }),
            Duration::ZERO,
            Duration::from_millis(cli.rate_ms),
        )?
    };

    let samples = Arc::new(AtomicU64::new(0));
    let sampler = {
        let samples = Arc::clone(&samples);
        pool.schedule_with_fixed_delay(
            WorkItem::no_result("sampler", move |_| {
                let n = samples.fetch_add(1, Ordering::Relaxed) + 1;
                if n % 3 == 0 {
                    anyhow::bail!("sample {n} rejected");
                }
                Ok(())
            }),
            Duration::from_millis(50),
            Duration::from_millis(cli.rate_ms * 2),
        )?
    };

    let greeting = pool.schedule(
        WorkItem::with_result("greeting", |_| Ok(String::from("hello from the timer"))),
        Duration::from_millis(100),
    )?;

    // Long-lived poller, outside the pool.
    let polls = Arc::new(AtomicU64::new(0));
    let poller = {
        let polls = Arc::clone(&polls);
        LongLivedTask::new(
            "spindle-poller",
            Arc::new(task_fn(move |cancel| {
                cancel.sleep(Duration::from_millis(250))?;
                Ok(polls.fetch_add(1, Ordering::Relaxed) + 1)
            })),
        )
        .with_config(&config.tasks)
    };
    let poller = poller.start()?;

    let mut total: u64 = 0;
    for future in &futures {
        total = total.wrapping_add(future.get_timeout(Duration::from_secs(30))?);
    }
    info!(jobs = futures.len(), total, "one-off jobs finished");
    info!(message = %greeting.get()?, "delayed job finished");

    std::thread::sleep(Duration::from_secs(cli.run_secs));

    heartbeat.cancel(false);
    sampler.cancel(false);
    poller.cancel(true);
    poller.join();

    info!(
        heartbeats = beats.load(Ordering::Relaxed),
        samples = samples.load(Ordering::Relaxed),
        polls = polls.load(Ordering::Relaxed),
        sampler_fault = ?sampler.last_fault().map(|f| f.to_string()),
        "periodic work stopped"
    );

    let metrics = pool.metrics();
    pool.shutdown();
    println!("{}", serde_json::to_string_pretty(&metrics)?);
    Ok(())
}

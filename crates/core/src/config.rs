use std::env;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::SpindleError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_usize(profile: &str, key: &str, default: usize) -> usize {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_bool(profile: &str, key: &str, default: bool) -> bool {
    match profiled_env_opt(profile, key) {
        Some(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    #[serde(default)]
    pub profile: String,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub tasks: TaskConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `SPINDLE_PROFILE` env var. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("SPINDLE_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            pool: PoolConfig::from_env_profiled(p),
            tasks: TaskConfig::from_env_profiled(p),
        }
    }

    /// Parse a TOML document. Missing sections and keys take their defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self, SpindleError> {
        toml::from_str(raw).map_err(|e| SpindleError::Config(e.to_string()))
    }

    /// Read and parse a TOML config file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, SpindleError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SpindleError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&raw)
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  pool:   size={} (resolved {}), queue_warn_threshold={}, prefix={}",
            self.pool.size,
            self.pool.resolved_size(),
            self.pool.queue_warn_threshold,
            self.pool.thread_name_prefix
        );
        tracing::info!(
            "  tasks:  continue_after_exception={}",
            self.tasks.continue_after_exception
        );
    }

    /// Return a JSON view of the effective settings.
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "profile": self.profile_label(),
            "pool": {
                "size": self.pool.size,
                "resolved_size": self.pool.resolved_size(),
                "queue_warn_threshold": self.pool.queue_warn_threshold,
                "thread_name_prefix": self.pool.thread_name_prefix,
            },
            "tasks": { "continue_after_exception": self.tasks.continue_after_exception },
        })
    }
}

// ── Worker pool ───────────────────────────────────────────────

/// Worker pool configuration, from env or TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of worker threads. 0 = available parallelism.
    #[serde(default = "default_pool_size")]
    pub size: usize,
    /// Queue depth above which each submission logs a backpressure warning.
    /// The queue itself stays unbounded.
    #[serde(default = "default_queue_warn_threshold")]
    pub queue_warn_threshold: usize,
    /// Worker threads are named `{prefix}-{n}`, the timer `{prefix}-timer`.
    #[serde(default = "default_thread_name_prefix")]
    pub thread_name_prefix: String,
}

fn default_pool_size() -> usize { 0 }
fn default_queue_warn_threshold() -> usize { 1000 }
fn default_thread_name_prefix() -> String { "spindle".to_string() }

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: default_pool_size(),
            queue_warn_threshold: default_queue_warn_threshold(),
            thread_name_prefix: default_thread_name_prefix(),
        }
    }
}

impl PoolConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            size: profiled_env_usize(p, "SPINDLE_POOL_SIZE", default_pool_size()),
            queue_warn_threshold: profiled_env_usize(
                p,
                "SPINDLE_QUEUE_WARN_THRESHOLD",
                default_queue_warn_threshold(),
            ),
            thread_name_prefix: profiled_env_or(p, "SPINDLE_THREAD_PREFIX", "spindle"),
        }
    }

    /// Pool of a fixed size with the remaining settings at their defaults.
    pub fn with_size(size: usize) -> Self {
        Self { size, ..Self::default() }
    }

    /// Resolve worker thread count (0 means use available parallelism).
    pub fn resolved_size(&self) -> usize {
        if self.size == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            self.size
        }
    }
}

// ── Long-lived tasks ──────────────────────────────────────────

/// Defaults applied to supervised long-lived tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Keep looping after a task iteration fails.
    #[serde(default = "default_continue_after_exception")]
    pub continue_after_exception: bool,
}

fn default_continue_after_exception() -> bool { true }

impl Default for TaskConfig {
    fn default() -> Self {
        Self { continue_after_exception: default_continue_after_exception() }
    }
}

impl TaskConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            continue_after_exception: profiled_env_bool(
                p,
                "SPINDLE_CONTINUE_AFTER_EXCEPTION",
                default_continue_after_exception(),
            ),
        }
    }
}

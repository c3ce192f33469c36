//! Master and worker configuration.
//!
//! Builder-style options in the `Config::new().with_x(..)` idiom. Timeouts
//! are validated when a `Master` is constructed and again for per-send
//! overrides.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::master::spawn::{ProcessSpawner, WorkerSpawner};

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;
/// Upper bound for any per-request timeout.
pub const MAX_TIMEOUT_MS: u64 = 300_000;
/// Default interval between worker heartbeats.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 2_000;
/// Default number of missed heartbeat intervals before a worker is unhealthy.
pub const DEFAULT_HEARTBEAT_MISS_THRESHOLD: u32 = 3;
/// Default delay between send retries.
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;

/// Environment variable a worker consults for its concurrency cap when the
/// option is not set programmatically.
pub const MAX_CONCURRENCY_ENV: &str = "PEEPSY_MAX_CONCURRENCY";

/// Check a millisecond timeout: positive and at most [`MAX_TIMEOUT_MS`].
pub fn validate_timeout_ms(ms: u64) -> Result<Duration> {
    if ms == 0 || ms > MAX_TIMEOUT_MS {
        return Err(Error::peepsy(format!(
            "timeout must be between 1 and {} ms, got {}",
            MAX_TIMEOUT_MS, ms
        )));
    }
    Ok(Duration::from_millis(ms))
}

/// Master-side options.
#[derive(Clone)]
pub struct MasterConfig {
    pub(crate) timeout_ms: u64,
    pub(crate) max_retries: u32,
    pub(crate) retry_delay: Duration,
    pub(crate) heartbeat_interval: Duration,
    pub(crate) heartbeat_miss_threshold: u32,
    pub(crate) spawner: Arc<dyn WorkerSpawner>,
}

impl MasterConfig {
    pub fn new() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_retries: 0,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            heartbeat_miss_threshold: DEFAULT_HEARTBEAT_MISS_THRESHOLD,
            spawner: Arc::new(ProcessSpawner),
        }
    }

    /// Default per-request timeout in milliseconds. Validated at `Master`
    /// construction.
    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = ms;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_retry_delay_ms(mut self, ms: u64) -> Self {
        self.retry_delay = Duration::from_millis(ms);
        self
    }

    pub fn with_heartbeat_interval_ms(mut self, ms: u64) -> Self {
        self.heartbeat_interval = Duration::from_millis(ms);
        self
    }

    pub fn with_heartbeat_miss_threshold(mut self, threshold: u32) -> Self {
        self.heartbeat_miss_threshold = threshold;
        self
    }

    /// Replace the spawning strategy. Tests and embedders use this to run
    /// workers in-process over an in-memory channel.
    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub(crate) fn validate(&self) -> Result<Duration> {
        validate_timeout_ms(self.timeout_ms)
    }
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Worker-side options.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub(crate) max_concurrency: Option<usize>,
    pub(crate) heartbeat_interval: Duration,
}

impl WorkerConfig {
    pub fn new() -> Self {
        Self {
            max_concurrency: None,
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
        }
    }

    /// Cap on concurrently running handlers in concurrent mode. Zero means
    /// unbounded.
    pub fn with_max_concurrency(mut self, cap: usize) -> Self {
        self.max_concurrency = Some(cap);
        self
    }

    pub fn with_heartbeat_interval_ms(mut self, ms: u64) -> Self {
        self.heartbeat_interval = Duration::from_millis(ms);
        self
    }

    /// The concurrency cap actually in force: the option if set, otherwise
    /// the `PEEPSY_MAX_CONCURRENCY` environment variable. `None` or zero
    /// means unbounded.
    pub(crate) fn effective_max_concurrency(&self) -> Option<usize> {
        let cap = self.max_concurrency.or_else(|| {
            std::env::var(MAX_CONCURRENCY_ENV)
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
        })?;
        (cap > 0).then_some(cap)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// How to launch a worker process: the program plus its arguments and any
/// extra environment.
#[derive(Debug, Clone)]
pub struct WorkerScript {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl WorkerScript {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Per-spawn options. Preserved verbatim for auto-restart.
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    /// Never restart this worker automatically, regardless of group policy.
    pub disable_auto_restart: bool,
    /// Concurrency cap forwarded to the worker via `PEEPSY_MAX_CONCURRENCY`.
    pub max_concurrency: Option<usize>,
}

impl SpawnOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_disable_auto_restart(mut self, disable: bool) -> Self {
        self.disable_auto_restart = disable;
        self
    }

    pub fn with_max_concurrency(mut self, cap: usize) -> Self {
        self.max_concurrency = Some(cap);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_bounds() {
        assert!(validate_timeout_ms(0).is_err());
        assert!(validate_timeout_ms(300_001).is_err());
        assert_eq!(
            validate_timeout_ms(1).unwrap(),
            Duration::from_millis(1)
        );
        assert_eq!(
            validate_timeout_ms(300_000).unwrap(),
            Duration::from_millis(300_000)
        );
    }

    #[test]
    fn master_config_defaults() {
        let config = MasterConfig::new();
        assert_eq!(config.timeout_ms, 5_000);
        assert_eq!(config.max_retries, 0);
        assert_eq!(config.retry_delay, Duration::from_millis(1_000));
        assert_eq!(config.heartbeat_interval, Duration::from_millis(2_000));
        assert_eq!(config.heartbeat_miss_threshold, 3);
    }

    #[test]
    fn invalid_master_timeout_fails_validation() {
        assert!(MasterConfig::new().with_timeout_ms(0).validate().is_err());
        assert!(MasterConfig::new()
            .with_timeout_ms(400_000)
            .validate()
            .is_err());
    }

    #[test]
    fn worker_option_takes_precedence_over_env() {
        let config = WorkerConfig::new().with_max_concurrency(4);
        assert_eq!(config.effective_max_concurrency(), Some(4));
    }

    #[test]
    fn zero_cap_means_unbounded() {
        let config = WorkerConfig::new().with_max_concurrency(0);
        assert_eq!(config.effective_max_concurrency(), None);
    }

    #[test]
    fn script_builder_collects_args_and_env() {
        let script = WorkerScript::new("/usr/bin/worker")
            .arg("--mode")
            .arg("fast")
            .env("RUST_LOG", "debug");
        assert_eq!(script.args, vec!["--mode", "fast"]);
        assert_eq!(script.env.len(), 1);
    }
}

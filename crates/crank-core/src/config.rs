use serde::Deserialize;

use crate::error::{EngineError, EngineResult};

/// Engine tuning knobs. The optimistic-lock retry budget
/// (`conflict_retries`) and the job retry budget (`default_job_retries`)
/// are deliberately separate values: one covers transient storage races at
/// the command layer, the other business-handler failures at the job layer.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Master switch for the async executor.
    pub async_executor_enabled: bool,

    /// Number of worker tasks draining the job queue.
    pub worker_pool_size: usize,

    /// Upper bound on jobs claimed per acquisition cycle; the effective
    /// batch is further capped by free worker-queue capacity.
    pub acquisition_batch_size: usize,

    /// Acquisition poll interval in seconds (fractional values supported).
    pub poll_interval_secs: f64,

    /// Job lock lease in seconds. Too short risks duplicate execution
    /// under slow handlers, too long delays recovery after a crash.
    pub lock_lease_secs: u64,

    /// Retry budget for newly scheduled jobs without an explicit one.
    pub default_job_retries: i32,

    /// First retry backoff in seconds; doubles per attempt.
    pub backoff_base_secs: u64,

    /// Backoff ceiling in seconds.
    pub backoff_max_secs: u64,

    /// How long a `with_lock` caller waits for a named lock.
    pub lock_wait_timeout_secs: u64,

    /// Pause between named-lock acquisition attempts, in milliseconds.
    pub lock_poll_millis: u64,

    /// Automatic command retries on optimistic-locking conflicts.
    pub conflict_retries: u32,
}

fn env_or<T: std::str::FromStr>(name: &str, fallback: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(fallback)
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            async_executor_enabled: env_or("ASYNC_EXECUTOR_ENABLED", true),
            worker_pool_size: env_or("WORKER_POOL_SIZE", 4),
            acquisition_batch_size: env_or("ACQUISITION_BATCH_SIZE", 16),
            poll_interval_secs: env_or("POLL_INTERVAL_SECS", 1.0),
            lock_lease_secs: env_or("LOCK_LEASE_SECS", 300),
            default_job_retries: env_or("DEFAULT_JOB_RETRIES", 3),
            backoff_base_secs: env_or("BACKOFF_BASE_SECS", 1),
            backoff_max_secs: env_or("BACKOFF_MAX_SECS", 3600),
            lock_wait_timeout_secs: env_or("LOCK_WAIT_TIMEOUT_SECS", 5),
            lock_poll_millis: env_or("LOCK_POLL_MILLIS", 100),
            conflict_retries: env_or("CONFLICT_RETRIES", 3),
        }
    }
}

impl EngineConfig {
    /// Low-latency profile for interactive workloads.
    pub fn responsive() -> Self {
        Self {
            async_executor_enabled: true,
            worker_pool_size: 4,
            acquisition_batch_size: 8,
            poll_interval_secs: 0.25,
            lock_lease_secs: 60,
            default_job_retries: 3,
            backoff_base_secs: 1,
            backoff_max_secs: 300,
            lock_wait_timeout_secs: 5,
            lock_poll_millis: 50,
            conflict_retries: 3,
        }
    }

    /// High-throughput profile for batch-heavy workloads.
    pub fn throughput() -> Self {
        Self {
            async_executor_enabled: true,
            worker_pool_size: 16,
            acquisition_batch_size: 64,
            poll_interval_secs: 2.0,
            lock_lease_secs: 600,
            default_job_retries: 3,
            backoff_base_secs: 5,
            backoff_max_secs: 3600,
            lock_wait_timeout_secs: 10,
            lock_poll_millis: 100,
            conflict_retries: 5,
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.worker_pool_size == 0 {
            return Err(EngineError::Config(
                "worker_pool_size must be at least 1".to_string(),
            ));
        }
        if self.acquisition_batch_size == 0 {
            return Err(EngineError::Config(
                "acquisition_batch_size must be at least 1".to_string(),
            ));
        }
        if self.poll_interval_secs <= 0.0 {
            return Err(EngineError::Config(
                "poll_interval_secs must be positive".to_string(),
            ));
        }
        if self.lock_lease_secs == 0 {
            return Err(EngineError::Config(
                "lock_lease_secs must be positive".to_string(),
            ));
        }
        if self.backoff_max_secs < self.backoff_base_secs {
            return Err(EngineError::Config(
                "backoff_max_secs must not be below backoff_base_secs".to_string(),
            ));
        }
        Ok(())
    }
}

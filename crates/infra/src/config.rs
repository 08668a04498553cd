//! Engine configuration.
//!
//! Everything has a sensible default; `from_env()` overrides individual keys
//! from `PROCFLOW_*` variables (durations in milliseconds). Unparseable
//! values fall back to the default with a warning.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;
use uuid::Uuid;

use procflow_core::DEFAULT_JOB_RETRIES;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Worker identity written into `lock_owner`.
    pub lock_owner: String,
    /// How long an acquired executable job stays locked.
    pub async_job_lock_time: Duration,
    /// How long a timer being promoted stays locked.
    pub timer_lock_time: Duration,
    pub max_async_jobs_per_acquisition: usize,
    pub max_timer_jobs_per_acquisition: usize,
    /// Idle wait between acquisition cycles that found too little work.
    pub async_acquire_wait_time: Duration,
    pub timer_acquire_wait_time: Duration,
    pub worker_pool_size: usize,
    /// Jobs that may wait for a free worker before new ones are rejected.
    pub queue_capacity: usize,
    pub shutdown_timeout: Duration,
    /// Retry wait for failed jobs without a retry cycle that were runnable
    /// immediately (message jobs, or no due date).
    pub async_failed_job_wait_time: Duration,
    /// Retry wait for failed timer jobs without a retry cycle.
    pub default_failed_job_wait_time: Duration,
    pub default_job_retries: u32,
    /// Attempts for outermost commands that lose an optimistic-lock race.
    pub command_retry_attempts: u32,
    pub command_retry_wait: Duration,
    pub profiling_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_owner: Uuid::now_v7().to_string(),
            async_job_lock_time: Duration::from_secs(5 * 60),
            timer_lock_time: Duration::from_secs(5 * 60),
            max_async_jobs_per_acquisition: 1,
            max_timer_jobs_per_acquisition: 1,
            async_acquire_wait_time: Duration::from_secs(10),
            timer_acquire_wait_time: Duration::from_secs(10),
            worker_pool_size: 2,
            queue_capacity: 100,
            shutdown_timeout: Duration::from_secs(60),
            async_failed_job_wait_time: Duration::from_secs(10),
            default_failed_job_wait_time: Duration::from_secs(10),
            default_job_retries: DEFAULT_JOB_RETRIES,
            command_retry_attempts: 3,
            command_retry_wait: Duration::from_millis(50),
            profiling_enabled: false,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `PROCFLOW_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each key.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let env = Env { lookup: &lookup };

        if let Some(owner) = lookup("PROCFLOW_LOCK_OWNER").filter(|s| !s.trim().is_empty()) {
            config.lock_owner = owner;
        }
        env.millis("PROCFLOW_ASYNC_JOB_LOCK_TIME_MS", &mut config.async_job_lock_time);
        env.millis("PROCFLOW_TIMER_LOCK_TIME_MS", &mut config.timer_lock_time);
        env.parse("PROCFLOW_MAX_ASYNC_JOBS_PER_ACQUISITION", &mut config.max_async_jobs_per_acquisition);
        env.parse("PROCFLOW_MAX_TIMER_JOBS_PER_ACQUISITION", &mut config.max_timer_jobs_per_acquisition);
        env.millis("PROCFLOW_ASYNC_ACQUIRE_WAIT_TIME_MS", &mut config.async_acquire_wait_time);
        env.millis("PROCFLOW_TIMER_ACQUIRE_WAIT_TIME_MS", &mut config.timer_acquire_wait_time);
        env.parse("PROCFLOW_WORKER_POOL_SIZE", &mut config.worker_pool_size);
        env.parse("PROCFLOW_QUEUE_CAPACITY", &mut config.queue_capacity);
        env.millis("PROCFLOW_SHUTDOWN_TIMEOUT_MS", &mut config.shutdown_timeout);
        env.millis("PROCFLOW_ASYNC_FAILED_JOB_WAIT_TIME_MS", &mut config.async_failed_job_wait_time);
        env.millis("PROCFLOW_DEFAULT_FAILED_JOB_WAIT_TIME_MS", &mut config.default_failed_job_wait_time);
        env.parse("PROCFLOW_DEFAULT_JOB_RETRIES", &mut config.default_job_retries);
        env.parse("PROCFLOW_COMMAND_RETRY_ATTEMPTS", &mut config.command_retry_attempts);
        env.millis("PROCFLOW_COMMAND_RETRY_WAIT_MS", &mut config.command_retry_wait);
        env.parse("PROCFLOW_PROFILING_ENABLED", &mut config.profiling_enabled);

        config
    }

    pub fn with_lock_owner(mut self, owner: impl Into<String>) -> Self {
        self.lock_owner = owner.into();
        self
    }

    pub fn with_async_job_lock_time(mut self, lock_time: Duration) -> Self {
        self.async_job_lock_time = lock_time;
        self
    }

    pub fn with_timer_lock_time(mut self, lock_time: Duration) -> Self {
        self.timer_lock_time = lock_time;
        self
    }

    pub fn with_max_jobs_per_acquisition(mut self, max: usize) -> Self {
        self.max_async_jobs_per_acquisition = max;
        self
    }

    pub fn with_max_timers_per_acquisition(mut self, max: usize) -> Self {
        self.max_timer_jobs_per_acquisition = max;
        self
    }

    /// Sets both the async and the timer acquisition wait.
    pub fn with_acquire_wait_time(mut self, wait: Duration) -> Self {
        self.async_acquire_wait_time = wait;
        self.timer_acquire_wait_time = wait;
        self
    }

    pub fn with_worker_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = size;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_failed_job_wait_times(mut self, async_wait: Duration, default_wait: Duration) -> Self {
        self.async_failed_job_wait_time = async_wait;
        self.default_failed_job_wait_time = default_wait;
        self
    }

    pub fn with_default_job_retries(mut self, retries: u32) -> Self {
        self.default_job_retries = retries;
        self
    }

    pub fn with_command_retry(mut self, attempts: u32, wait: Duration) -> Self {
        self.command_retry_attempts = attempts;
        self.command_retry_wait = wait;
        self
    }

    pub fn with_profiling(mut self, enabled: bool) -> Self {
        self.profiling_enabled = enabled;
        self
    }
}

/// `std::time::Duration` as a `chrono` span, saturating at a century.
pub(crate) fn chrono_span(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

struct Env<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Env<'_> {
    fn parse<T: FromStr>(&self, key: &str, target: &mut T) {
        let Some(raw) = (self.lookup)(key) else {
            return;
        };
        match raw.trim().parse() {
            Ok(value) => *target = value,
            Err(_) => warn!(key, value = %raw, "ignoring unparseable configuration value"),
        }
    }

    fn millis(&self, key: &str, target: &mut Duration) {
        let mut millis = u64::try_from(target.as_millis()).unwrap_or(u64::MAX);
        self.parse(key, &mut millis);
        *target = Duration::from_millis(millis);
    }
}

use std::net::SocketAddr;
use std::time::Duration;

/// Backoff settings for failed attempts.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay before the first retry; doubles for every further attempt
    pub base_delay: Duration,
    /// Upper bound applied after doubling and jitter
    pub max_delay: Duration,
    /// Extra random delay as a fraction of the computed delay.
    /// Clamped to `0.0..=1.0` so successive delays never shrink.
    pub jitter: f64,
    /// Attempt ceiling used when a submission does not specify one
    pub default_max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5000),
            max_delay: Duration::from_secs(60 * 60),
            jitter: 0.0,
            default_max_attempts: 3,
        }
    }
}

impl RetryConfig {
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn with_default_max_attempts(mut self, attempts: u32) -> Self {
        self.default_max_attempts = attempts;
        self
    }
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub retry: RetryConfig,
    /// Maximum number of attempts executing at the same time
    pub max_concurrency: usize,
    /// An attempt running longer than this counts as failed. `None` disables the limit.
    pub attempt_timeout: Option<Duration>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            max_concurrency: 64,
            attempt_timeout: Some(Duration::from_secs(300)),
        }
    }
}

impl RunnerConfig {
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.attempt_timeout = timeout;
        self
    }
}

/// Retention sweep of terminal jobs.
#[derive(Debug, Clone)]
pub struct CleanupConfig {
    pub interval: Duration,
    pub retention: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60 * 60),
            retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// One poll-mode worker against an external pending-work source.
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Used in log fields to tell workers apart (e.g. "render", "schedule")
    pub name: String,
    pub interval: Duration,
    /// Maximum rows fetched per cycle
    pub batch_size: usize,
    /// Attempt ceiling for rows that do not carry their own. Set to 1 to
    /// fail rows on their first error.
    pub max_attempts: u32,
    pub attempt_timeout: Option<Duration>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            name: "poll".to_string(),
            interval: Duration::from_secs(5),
            batch_size: 10,
            max_attempts: 3,
            attempt_timeout: Some(Duration::from_secs(300)),
        }
    }
}

impl PollConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct NodeConfig {
    pub runner: RunnerConfig,
    pub cleanup: CleanupConfig,
    /// Dashboard listen address; no dashboard when unset
    pub dashboard_addr: Option<SocketAddr>,
}

impl NodeConfig {
    pub fn with_dashboard(mut self, addr: SocketAddr) -> Self {
        self.dashboard_addr = Some(addr);
        self
    }
}

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;

/// Outcome of consulting the policy after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    GiveUp,
}

/// Exponential backoff: `base_delay * 2^(attempt - 1)`, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_delay: Duration,
    jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay: Duration::MAX,
            jitter: 0.0,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            base_delay: config.base_delay,
            max_delay: config.max_delay,
            jitter: config.jitter.clamp(0.0, 1.0),
        }
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// `attempt` is the number of attempts already made, including the one
    /// that just failed.
    pub fn decide(&self, attempt: u32, max_attempts: u32) -> RetryDecision {
        if attempt >= max_attempts {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry(self.delay_for(attempt))
    }

    /// Delay before the attempt following `attempt`, without jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Adds up to `jitter * delay` of random extra wait. With `jitter <= 1`
    /// the result never exceeds the next attempt's unjittered delay.
    pub fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0.0..=self.jitter);
        delay.mul_f64(1.0 + extra).min(self.max_delay)
    }
}

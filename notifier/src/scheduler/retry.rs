//! Retry policy: how long a failed task waits before it fires again.

use std::time::Duration;

use rand::Rng;

use crate::config::Config;

/// Exponential backoff with a cap, a jitter band and an attempt limit.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Growth factor per further failure.
    pub multiplier: f64,
    /// No delay exceeds this.
    pub max_delay: Duration,
    /// Fraction of the delay randomly added or removed (0.0 - 1.0).
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            multiplier: 2.0,
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            jitter: 0.2,
        }
    }

    /// Whether a task that has made `attempts` attempts may fire again.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Delay before the next fire, without jitter.
    ///
    /// `attempts` is the number of failures so far (1 after the first).
    /// delay = base_delay * multiplier^(attempts - 1), capped at max_delay.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Backoff spread by up to `jitter` in either direction.
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let delay = self.backoff(attempts);
        if self.jitter <= 0.0 {
            return delay;
        }

        let factor = {
            let mut rng = rand::thread_rng();
            rng.gen_range((1.0 - self.jitter)..=(1.0 + self.jitter))
        };
        let jittered = (delay.as_secs_f64() * factor).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(300),
            jitter: 0.2,
        }
    }
}

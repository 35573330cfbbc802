//! Reconnect delay policy.
//!
//! Delays grow linearly with the attempt number (`base × attempt`) and stop
//! after `max_attempts`. Once the cap is reached the caller does not retry
//! again until something external resets its attempt counter.

use rand::Rng;
use std::time::Duration;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    base_delay: Duration,
    max_attempts: u32,
    /// Proportional jitter in `[0, 1]`. Zero keeps delays deterministic.
    jitter: f64,
}

impl Backoff {
    pub fn new(base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_attempts,
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = if jitter.is_finite() {
            jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Delay before the given 1-based attempt. Attempt 0 is treated as 1.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.base_delay.saturating_mul(attempt.max(1));
        if self.jitter == 0.0 {
            return delay;
        }
        let factor = rand::rng().random_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        delay.mul_f64(factor)
    }

    /// Whether the given 1-based attempt is still within the cap.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt >= 1 && attempt <= self.max_attempts
    }

    /// `delay_for(attempt)` if the attempt is allowed, `None` past the cap.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        self.allows(attempt).then(|| self.delay_for(attempt))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS)
    }
}

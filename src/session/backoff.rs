//! Reconnect backoff
//!
//! Capped geometric growth, reset after a successful reconnect.

use std::time::Duration;

/// How reconnect delays grow.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first reconnect attempt
    pub initial: Duration,
    /// Growth factor applied per failed attempt
    pub multiplier: f64,
    /// Upper bound for any single delay
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(5000),
            multiplier: 2.0,
            max: Duration::from_secs(60),
        }
    }
}

/// Backoff counter for one session.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Delay for the next attempt; advances the counter.
    pub fn next_delay(&mut self) -> Duration {
        let factor = self.policy.multiplier.max(1.0).powi(self.attempt as i32);
        let delay = self.policy.initial.as_secs_f64() * factor;
        self.attempt = self.attempt.saturating_add(1);

        if !delay.is_finite() || delay >= self.policy.max.as_secs_f64() {
            self.policy.max
        } else {
            Duration::from_secs_f64(delay)
        }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Attempts made since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

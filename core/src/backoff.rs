use std::time::Duration;

use rand::Rng;

/// Exponential backoff with jitter and a cap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub multiply_factor: f64,
    /// Fraction by which a delay may be shortened at random.
    pub jitter_factor: f64,
    pub maximum_backoff: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            multiply_factor: 3.0,
            jitter_factor: 0.2,
            maximum_backoff: Duration::from_secs(15 * 60),
        }
    }
}

impl BackoffPolicy {
    /// Delay to wait after `failure_count` consecutive failures.
    ///
    /// `jitter_sample` is expected in `[0, 1)`; the delay is reduced by
    /// `jitter_factor * jitter_sample` of itself before the cap applies.
    pub fn delay_for(&self, failure_count: u32, jitter_sample: f64) -> Duration {
        if failure_count == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(failure_count - 1).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_millis() as f64 * self.multiply_factor.powi(exponent);
        let jittered = base * (1.0 - self.jitter_factor * jitter_sample.clamp(0.0, 1.0));
        let capped = jittered.min(self.maximum_backoff.as_millis() as f64);
        Duration::from_millis(capped.max(0.0).round() as u64)
    }
}

/// Consecutive-failure counter shared by every request of one cookie
/// manager. Any success brings it back to zero.
#[derive(Debug, Clone)]
pub struct BackoffEntry {
    policy: BackoffPolicy,
    failure_count: u32,
}

impl BackoffEntry {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            failure_count: 0,
        }
    }

    pub fn inform_of_request(&mut self, succeeded: bool) {
        if succeeded {
            self.failure_count = 0;
        } else {
            self.failure_count = self.failure_count.saturating_add(1);
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn time_until_release(&self) -> Duration {
        let sample = if self.policy.jitter_factor > 0.0 {
            rand::rng().random_range(0.0..1.0)
        } else {
            0.0
        };
        self.policy.delay_for(self.failure_count, sample)
    }
}

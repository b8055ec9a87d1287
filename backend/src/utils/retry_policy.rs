use std::time::Duration;

/// Backoff policy whose delays form a geometric series spread over a total time budget.
///
/// With `multiplier == 1.0` every delay is identical, which gives a fixed backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct ExponentialBackoff {
    /// Number of retries after the first attempt
    max_retries: u64,

    /// Total time to spend sleeping across all retries
    total_retry_time: Duration,

    /// Growth factor between consecutive delays
    multiplier: f64,
}

impl ExponentialBackoff {
    pub(crate) fn new(max_retries: u64, total_retry_time: Duration, multiplier: f64) -> Self {
        Self {
            max_retries,
            total_retry_time,
            multiplier,
        }
    }

    /// Fixed delay between attempts, `max_attempts` attempts in total.
    pub(crate) fn fixed(max_attempts: u64, delay: Duration) -> Self {
        let max_retries = max_attempts.saturating_sub(1);
        let total = delay.saturating_mul(max_retries.try_into().unwrap_or(u32::MAX));
        Self::new(max_retries, total, 1.0)
    }

    /// Getter for `max_retries`
    pub(crate) fn max_retries(&self) -> u64 {
        self.max_retries
    }

    /// Delay to wait before retry number `attempt` (1-based).
    pub(crate) fn get_delay(&self, attempt: u64) -> Duration {
        if self.max_retries == 0 || attempt == 0 {
            return Duration::ZERO;
        }

        let total = self.total_retry_time.as_secs_f64();
        let retries = self.max_retries as f64;
        let base = if (self.multiplier - 1.0).abs() < f64::EPSILON {
            total / retries
        } else {
            total * (self.multiplier - 1.0) / (self.multiplier.powf(retries) - 1.0)
        };

        let exponent = attempt.min(self.max_retries) - 1;
        Duration::from_secs_f64(base * self.multiplier.powi(exponent as i32))
    }
}

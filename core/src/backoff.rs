/// Retry backoff schedules for the adapter delivery loop.
use std::time::Duration;

/// A function from attempt number to pre-retry delay. `next(n)` is the
/// delay slept after failed attempt `n` (1-based), before attempt `n+1`.
pub trait Backoff: Send + Sync {
    fn next(&self, attempt: u32) -> Duration;
}

/// Exponential backoff: doubles per attempt from an initial delay up
/// to a cap.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Delay after the first failed attempt
    pub initial: Duration,
    /// Ceiling for any single delay
    pub max: Duration,
    /// Growth factor per attempt
    pub multiplier: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl Backoff for ExponentialBackoff {
    fn next(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let delay = Duration::from_secs_f64(
            self.initial.as_secs_f64() * self.multiplier.powi(exponent as i32),
        );
        delay.min(self.max)
    }
}

/// Zero-delay backoff for tests and synchronous hosts.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBackoff;

impl Backoff for NoBackoff {
    fn next(&self, _attempt: u32) -> Duration {
        Duration::ZERO
    }
}

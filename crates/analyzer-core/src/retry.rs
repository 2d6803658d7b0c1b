//! Retry timing for reconnecting workers.
//!
//! Capture reconnects grow exponentially up to a ceiling; the alarm worker reconnects on
//! a fixed interval, which is the same policy with a growth factor of one.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bounded exponential backoff.
///
/// # Example
///
/// ```rust
/// use analyzer_core::retry::BackoffPolicy;
/// use std::time::Duration;
///
/// let policy = BackoffPolicy {
///     base: Duration::from_secs(1),
///     factor: 2.0,
///     ceiling: Duration::from_secs(5),
///     max_retries: 10,
/// };
/// assert_eq!(policy.delay_for(1), Duration::from_secs(1));
/// assert_eq!(policy.delay_for(3), Duration::from_secs(4));
/// assert_eq!(policy.delay_for(4), Duration::from_secs(5));
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    #[serde(with = "humantime_serde")]
    pub base: Duration,
    /// Multiplier applied per retry.
    pub factor: f64,
    /// Upper bound on any single delay.
    #[serde(with = "humantime_serde")]
    pub ceiling: Duration,
    /// Retries allowed before giving up. Zero means never retry.
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            factor: 2.0,
            ceiling: Duration::from_secs(30),
            max_retries: 10,
        }
    }
}

impl BackoffPolicy {
    /// Constant-interval policy with unlimited retries.
    pub fn fixed(interval: Duration) -> Self {
        Self {
            base: interval,
            factor: 1.0,
            ceiling: interval,
            max_retries: u32::MAX,
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(63) as i32;
        let scaled = self.base.as_nanos() as f64 * self.factor.max(1.0).powi(exponent);
        if !scaled.is_finite() || scaled >= self.ceiling.as_nanos() as f64 {
            return self.ceiling;
        }
        Duration::from_nanos(scaled.round() as u64)
    }

    /// True once `retries` retries have used up the budget.
    pub fn exhausted(&self, retries: u32) -> bool {
        retries > self.max_retries
    }
}

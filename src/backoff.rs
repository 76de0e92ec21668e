//! Backoff strategies applied between attempts of a failed job.
//!
//! A job that fails with attempts remaining is resubmitted after the delay computed
//! here. The calculation is deterministic: no jitter is applied, so two jobs that
//! fail the same number of times wait exactly the same amount.
//!
//! # Strategies
//!
//! - [`Fixed`](BackoffStrategy::Fixed) - `delay`
//! - [`Linear`](BackoffStrategy::Linear) - `delay * attempts_made`
//! - [`Exponential`](BackoffStrategy::Exponential) - `delay * 2^(attempts_made - 1)`
//!
//! # Examples
//!
//! ```rust
//! use conveyor::backoff::{BackoffOptions, BackoffStrategy};
//!
//! let backoff = BackoffOptions::exponential(100);
//!
//! assert_eq!(backoff.calculate_delay(1), 100);
//! assert_eq!(backoff.calculate_delay(2), 200);
//! assert_eq!(backoff.calculate_delay(3), 400);
//! assert_eq!(BackoffStrategy::Linear.calculate_delay(3, 100), 300);
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The shape of the delay curve between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Every retry waits the base delay.
    Fixed,
    /// Retry `n` waits `n` times the base delay.
    Linear,
    /// Each retry doubles the previous wait, starting from the base delay.
    Exponential,
}

impl BackoffStrategy {
    /// Calculate the delay in milliseconds before the next attempt.
    ///
    /// `attempts_made` is 1-indexed: it is the number of attempts that have already
    /// run, including the one that just failed. An `attempts_made` of zero is treated
    /// as one.
    ///
    /// Arithmetic saturates at `u64::MAX` rather than overflowing.
    pub fn calculate_delay(&self, attempts_made: u32, base_delay_ms: u64) -> u64 {
        let attempt = attempts_made.max(1);
        match self {
            BackoffStrategy::Fixed => base_delay_ms,
            BackoffStrategy::Linear => base_delay_ms.saturating_mul(u64::from(attempt)),
            BackoffStrategy::Exponential => {
                let exponent = attempt - 1;
                if exponent >= 64 {
                    if base_delay_ms == 0 { 0 } else { u64::MAX }
                } else {
                    base_delay_ms.saturating_mul(1u64 << exponent)
                }
            }
        }
    }
}

impl std::fmt::Display for BackoffStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackoffStrategy::Fixed => write!(f, "fixed"),
            BackoffStrategy::Linear => write!(f, "linear"),
            BackoffStrategy::Exponential => write!(f, "exponential"),
        }
    }
}

/// Backoff settings attached to a job's options.
///
/// Serializes as `{"type": "exponential", "delay": 100}` with the delay in
/// milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffOptions {
    #[serde(rename = "type")]
    pub strategy: BackoffStrategy,
    /// Base delay in milliseconds.
    pub delay: u64,
}

impl BackoffOptions {
    pub fn new(strategy: BackoffStrategy, delay: u64) -> Self {
        Self { strategy, delay }
    }

    pub fn fixed(delay: u64) -> Self {
        Self::new(BackoffStrategy::Fixed, delay)
    }

    pub fn linear(delay: u64) -> Self {
        Self::new(BackoffStrategy::Linear, delay)
    }

    pub fn exponential(delay: u64) -> Self {
        Self::new(BackoffStrategy::Exponential, delay)
    }

    /// Delay in milliseconds after `attempts_made` attempts.
    pub fn calculate_delay(&self, attempts_made: u32) -> u64 {
        self.strategy.calculate_delay(attempts_made, self.delay)
    }

    /// Same as [`calculate_delay`](Self::calculate_delay), as a [`Duration`].
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        Duration::from_millis(self.calculate_delay(attempts_made))
    }
}

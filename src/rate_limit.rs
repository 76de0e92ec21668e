//! Token bucket limiter for handler starts.
//!
//! A queue registered with [`LimiterOptions`] may start at most `max` handlers per
//! `duration`. The bucket starts full, so the first `max` jobs run immediately.

use crate::{ConveyorError, Result, config::LimiterOptions};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::sleep;

/// Permits accrue continuously at `max / duration`, up to `max`.
#[derive(Debug)]
struct Bucket {
    permits: f64,
    max: f64,
    per_ms: f64,
    refilled_at: Instant,
}

impl Bucket {
    fn full(max: f64, per_ms: f64, now: Instant) -> Self {
        Self {
            permits: max,
            max,
            per_ms,
            refilled_at: now,
        }
    }

    /// Take one permit at `now`, or report how long until one accrues.
    fn take(&mut self, now: Instant) -> std::result::Result<(), Duration> {
        let elapsed_ms = now.saturating_duration_since(self.refilled_at).as_nanos() as f64 / 1e6;
        self.permits = (self.permits + elapsed_ms * self.per_ms).min(self.max);
        self.refilled_at = now;

        if self.permits >= 1.0 {
            self.permits -= 1.0;
            return Ok(());
        }
        let wait_ms = ((1.0 - self.permits) / self.per_ms).ceil().max(1.0);
        Err(Duration::from_millis(wait_ms as u64))
    }
}

/// Shared limiter; clones draw from the same bucket.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    bucket: Arc<Mutex<Bucket>>,
    options: LimiterOptions,
}

impl RateLimiter {
    /// A `max` of zero is treated as one, and a zero `duration` as one millisecond.
    pub fn new(options: LimiterOptions) -> Self {
        let max = options.max.max(1) as f64;
        let window_ms = options.duration.as_millis().max(1) as f64;

        Self {
            bucket: Arc::new(Mutex::new(Bucket::full(max, max / window_ms, Instant::now()))),
            options,
        }
    }

    /// Wait until a permit is available and take it.
    pub async fn acquire(&self) -> Result<()> {
        loop {
            let taken = self
                .bucket
                .lock()
                .map_err(|_| ConveyorError::queue("rate limiter lock poisoned"))?
                .take(Instant::now());
            match taken {
                Ok(()) => return Ok(()),
                Err(wait) => sleep(wait).await,
            }
        }
    }

    pub fn options(&self) -> &LimiterOptions {
        &self.options
    }
}

//! Bounded exponential backoff for outbound sends
//!
//! Only errors whose class is retryable (rate limiting, transient network
//! failures) are attempted again. Sleeps run on the tokio timer, so a
//! dropped request future cancels any pending retry.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::{Result, WhatsAppError};

/// Retry policy: exponential backoff with jitter
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Multiplier applied per attempt
    pub factor: u32,
    /// Jitter fraction (0.2 = ±20%)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            factor: 2,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay before the attempt following `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.factor.saturating_pow(attempt.saturating_sub(1));
        let base = self.base_delay.as_secs_f64() * exp as f64;
        let jitter = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(-self.jitter..=self.jitter)
        } else {
            0.0
        };
        Duration::from_secs_f64(base * (1.0 + jitter))
    }

    /// Drive `op` until it succeeds, exhausts the attempt budget, or fails
    /// with a non-retryable error class. The closure receives the 1-based
    /// attempt number.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    // A provider Retry-After hint wins over our own schedule.
                    let delay = match &err {
                        WhatsAppError::RateLimited {
                            retry_after: Some(secs),
                        } => self.delay_for(attempt).max(Duration::from_secs(*secs)),
                        _ => self.delay_for(attempt),
                    };
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "outbound attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

//! Retry of transient enrichment failures
//!
//! Off unless `RetryConfig::max_attempts` is raised above 0. When enabled, a
//! row whose call failed transiently (timeout, connection error, throttling,
//! 5xx) is called again after a growing delay. Every attempt is a separate
//! provider call, so callers take a fresh rate-limiter slot per attempt.

use crate::config::RetryConfig;
use crate::error::EnrichError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Whether a failed call may succeed if repeated
pub trait IsRetryable {
    /// True for transient failures
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for EnrichError {
    fn is_retryable(&self) -> bool {
        match self {
            EnrichError::Timeout(_) | EnrichError::Network(_) => true,
            EnrichError::Provider { status, .. } => *status == 429 || (500..=599).contains(status),
            EnrichError::MalformedResponse(_) | EnrichError::Panicked(_) | EnrichError::Other(_) => {
                false
            }
        }
    }
}

/// Delays between attempts: `initial_delay`, then multiplied each step up to `max_delay`
///
/// With jitter the yielded delay is stretched by a random factor in `[1, 2]`;
/// the underlying schedule is unaffected.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
    multiplier: f64,
    jitter: bool,
    remaining: u32,
}

impl Backoff {
    /// The schedule for one row under `config`
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            next: config.initial_delay.min(config.max_delay),
            max: config.max_delay,
            multiplier: config.backoff_multiplier,
            jitter: config.jitter,
            remaining: config.max_attempts,
        }
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let base = self.next;
        self.next = base.mul_f64(self.multiplier.max(1.0)).min(self.max);
        Some(if self.jitter { stretch(base) } else { base })
    }
}

fn stretch(delay: Duration) -> Duration {
    delay.mul_f64(1.0 + rand::thread_rng().gen_range(0.0..=1.0))
}

/// Run `call` until it succeeds, fails permanently, or the backoff schedule runs out
///
/// Returns the last error when no attempt succeeded.
pub async fn with_retry<F, Fut, T, E>(config: &RetryConfig, mut call: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let mut schedule = Backoff::new(config);
    let mut attempt = 1u32;

    loop {
        let error = match call().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        if !error.is_retryable() {
            return Err(error);
        }
        let Some(delay) = schedule.next() else {
            if attempt > 1 {
                tracing::debug!(attempts = attempt, error = %error, "retries exhausted");
            }
            return Err(error);
        };

        tracing::warn!(
            attempt,
            max_attempts = config.max_attempts + 1,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "transient enrichment failure, retrying"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

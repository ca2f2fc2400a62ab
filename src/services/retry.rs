//! Exponential backoff with jitter for transiently failing operations.
//!
//! Wraps any zero-argument async operation returning `Result<T, DistanceError>`.
//! Used around geocoding, routing and each per-destination prefetch unit.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::errors::DistanceError;

/// Upper bound on the doubling exponent, keeps the delay finite.
const MAX_BACKOFF_EXPONENT: u32 = 16;

/// Retry parameters.
///
/// `max_attempts` counts every call, so a policy with 3 attempts sleeps at
/// most twice. Sleep `n` (0-based) lasts
/// `initial_delay * 2^n * (1 + jitter_factor * U(-1, 1))`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(10), 0.1)
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, jitter_factor: f64) -> Self {
        let jitter_factor = if jitter_factor.is_finite() {
            jitter_factor.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            jitter_factor,
        }
    }

    /// Delay before retry number `retry_index` (0-based) for a given jitter
    /// sample in `[-1, 1]`.
    pub fn backoff_delay(&self, retry_index: u32, jitter_sample: f64) -> Duration {
        let exponent = retry_index.min(MAX_BACKOFF_EXPONENT) as i32;
        let base = self.initial_delay.as_secs_f64() * 2f64.powi(exponent);
        let factor = 1.0 + self.jitter_factor * jitter_sample.clamp(-1.0, 1.0);
        Duration::from_secs_f64((base * factor).max(0.0))
    }

    fn jittered_delay(&self, retry_index: u32) -> Duration {
        let sample = rand::thread_rng().gen_range(-1.0..=1.0);
        self.backoff_delay(retry_index, sample)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    pub async fn run<T, F, Fut>(&self, label: &str, op: F) -> Result<T, DistanceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DistanceError>>,
    {
        self.run_until_cancelled(label, &CancellationToken::new(), op)
            .await
    }

    /// Like [`RetryPolicy::run`], but both in-flight attempts and backoff
    /// sleeps stop as soon as `cancel` fires, returning `DistanceError::Cancelled`.
    pub async fn run_until_cancelled<T, F, Fut>(
        &self,
        label: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, DistanceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DistanceError>>,
    {
        let mut attempt: u32 = 1;

        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DistanceError::Cancelled),
                result = op() => result,
            };

            let err = match result {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !err.is_retryable() {
                tracing::debug!("Retry: {} failed with non-retryable error: {}", label, err);
                return Err(err);
            }

            if attempt >= self.max_attempts {
                tracing::error!(
                    "Retry: max attempts ({}) reached for {}, giving up: {}",
                    self.max_attempts,
                    label,
                    err
                );
                return Err(err);
            }

            let wait = self.jittered_delay(attempt - 1);
            tracing::warn!(
                "Retry: {} failed ({}), retrying in {:.2}s (attempt {}/{})",
                label,
                err,
                wait.as_secs_f64(),
                attempt,
                self.max_attempts
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DistanceError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }

            attempt += 1;
        }
    }
}

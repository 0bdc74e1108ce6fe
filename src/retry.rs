//! Retry policy shared by every remote call site.
//!
//! Status polling, file upload, job creation, single-document extraction and
//! ledger transactions all go through [`RetryPolicy::run`], parameterised by a
//! classifier that buckets each error:
//!
//! | Class | Behaviour |
//! |-------|-----------|
//! | [`ErrorClass::RateLimited`] | exponential backoff `base * 2^attempt`, capped |
//! | [`ErrorClass::Transient`]   | short fixed delay |
//! | [`ErrorClass::Fatal`]       | returned immediately, never retried |
//!
//! Keeping the policy in one value avoids every call site growing its own
//! loop with slightly different limits.

use crate::config::PipelineConfig;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Retry classification of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Quota or 429: back off exponentially.
    RateLimited,
    /// Network blip, 5xx, pool timeout: retry after a short fixed delay.
    Transient,
    /// Anything retrying cannot fix.
    Fatal,
}

/// The last error seen once the policy gave up, with the attempt count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exhausted<E> {
    pub error: E,
    pub attempts: u32,
}

impl<E: std::fmt::Display> std::fmt::Display for Exhausted<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (after {} attempts)", self.error, self.attempts)
    }
}

/// Bounded retry with per-class backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Always ≥ 1.
    pub max_attempts: u32,
    /// Base delay for rate-limit backoff.
    pub rate_limit_base: Duration,
    /// Upper bound for a single rate-limit delay.
    pub rate_limit_cap: Duration,
    /// Fixed delay between transient retries.
    pub transient_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            rate_limit_base: Duration::from_millis(2_000),
            rate_limit_cap: Duration::from_secs(60),
            transient_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Build the policy from the pipeline configuration.
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_attempts: config.max_retries + 1,
            rate_limit_base: Duration::from_millis(config.rate_limit_backoff_ms),
            rate_limit_cap: Duration::from_millis(config.rate_limit_backoff_cap_ms),
            transient_delay: Duration::from_millis(config.retry_backoff_ms),
        }
    }

    /// A policy that performs exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based), or `None` when the
    /// error must not be retried.
    pub fn delay_for(&self, class: ErrorClass, attempt: u32) -> Option<Duration> {
        match class {
            ErrorClass::Fatal => None,
            ErrorClass::Transient => Some(self.transient_delay),
            ErrorClass::RateLimited => {
                let factor = 2u32.saturating_pow(attempt);
                Some(
                    self.rate_limit_base
                        .saturating_mul(factor)
                        .min(self.rate_limit_cap),
                )
            }
        }
    }

    /// Run `operation` until it succeeds, a fatal error occurs, or the
    /// attempt budget is spent.
    pub async fn run<T, E, F, Fut, C>(
        &self,
        operation_name: &str,
        mut operation: F,
        classify: C,
    ) -> Result<T, Exhausted<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> ErrorClass,
        E: std::fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(
                            operation = operation_name,
                            attempt = attempt + 1,
                            "Operation succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(error) => {
                    let class = classify(&error);
                    let is_last = attempt + 1 >= max_attempts;
                    let delay = if is_last {
                        None
                    } else {
                        self.delay_for(class, attempt)
                    };
                    match delay {
                        Some(delay) => {
                            warn!(
                                operation = operation_name,
                                attempt = attempt + 1,
                                max_attempts,
                                class = ?class,
                                error = %error,
                                delay_ms = delay.as_millis() as u64,
                                "Operation failed, retrying"
                            );
                            sleep(delay).await;
                            attempt += 1;
                        }
                        None => {
                            warn!(
                                operation = operation_name,
                                attempt = attempt + 1,
                                class = ?class,
                                error = %error,
                                "Operation failed, giving up"
                            );
                            return Err(Exhausted {
                                error,
                                attempts: attempt + 1,
                            });
                        }
                    }
                }
            }
        }
    }
}

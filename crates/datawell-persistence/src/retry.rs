//! Exponential-backoff retry for status+payload operations.
//!
//! `with_retry` wraps any async operation returning an `Outcome`. An outcome
//! is retried when its status is `Error` and its payload is one of the
//! policy's retryable codes (HTTP 429 by default). The last outcome is always
//! returned; the caller decides whether an error after the final attempt is
//! fatal.

use crate::error::{PersistenceError, PersistenceResult};
use datawell_core::{exponential_delay, ActionStatus, Outcome};
use datawell_telemetry::Metrics;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

/// Default retryable payload: HTTP 429 Too Many Requests.
const TOO_MANY_REQUESTS: u16 = 429;

/// Retry settings for `with_retry`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy<P = u16> {
    /// Maximum invocations; `None` = unlimited.
    retries: Option<u32>,
    /// Base delay; zero disables sleeping.
    delay: Duration,
    /// Delay cap; `None` = unbounded.
    max_delay: Option<Duration>,
    retry_on: Vec<P>,
}

impl<P: PartialEq> RetryPolicy<P> {
    /// Build a policy.
    ///
    /// `max_delay` of zero means no cap. Fails when `0 < max_delay < delay`
    /// or when `retries` is `Some(0)`.
    pub fn new(
        retries: Option<u32>,
        delay: Duration,
        max_delay: Duration,
        retry_on: Vec<P>,
    ) -> PersistenceResult<Self> {
        if retries == Some(0) {
            return Err(PersistenceError::InvalidConfig(
                "retries must be greater than zero".to_string(),
            ));
        }
        if !max_delay.is_zero() && max_delay < delay {
            return Err(PersistenceError::InvalidConfig(format!(
                "max_delay ({max_delay:?}) must be greater than delay ({delay:?})"
            )));
        }

        Ok(Self {
            retries,
            delay,
            max_delay: (!max_delay.is_zero()).then_some(max_delay),
            retry_on,
        })
    }

    #[must_use]
    pub fn retries(&self) -> Option<u32> {
        self.retries
    }

    /// Whether an outcome should be retried.
    pub fn should_retry(&self, outcome: &Outcome<P>) -> bool {
        outcome.status == ActionStatus::Error && self.retry_on.contains(&outcome.payload)
    }

    /// Delay before retry `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        exponential_delay(self.delay, attempt, self.max_delay)
    }
}

impl Default for RetryPolicy<u16> {
    fn default() -> Self {
        Self {
            retries: None,
            delay: Duration::ZERO,
            max_delay: None,
            retry_on: vec![TOO_MANY_REQUESTS],
        }
    }
}

/// Invoke `operation` until it succeeds, fails with a non-retryable payload,
/// or the policy's invocation budget is spent.
pub async fn with_retry<P, F, Fut>(policy: &RetryPolicy<P>, mut operation: F) -> Outcome<P>
where
    P: PartialEq + fmt::Debug,
    F: FnMut() -> Fut,
    Fut: Future<Output = Outcome<P>>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let outcome = operation().await;
        if !policy.should_retry(&outcome) {
            return outcome;
        }

        if matches!(policy.retries, Some(max) if attempt >= max) {
            warn!(
                attempt,
                payload = ?outcome.payload,
                "All attempts failed. Increase retries and delay."
            );
            return outcome;
        }

        let delay = policy.delay_for(attempt);
        info!(
            attempt,
            ?delay,
            payload = ?outcome.payload,
            "Retrying after backoff"
        );
        Metrics::policy_retry();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

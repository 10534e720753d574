//! Retry with exponential backoff for outbound calls
//!
//! Both the content source client and the destination notifier wrap their
//! HTTP calls in [`with_retry`]. The whole retrying call still runs under the
//! caller's timeout, so a retry budget never stretches a cycle unboundedly.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Retry behavior for one kind of outbound call
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the initial attempt
    pub max_retries: u32,

    pub initial_backoff: Duration,

    /// Cap on a single wait, including server-requested waits
    pub max_backoff: Duration,

    pub multiplier: f64,

    /// Add up to 25% random jitter to each wait
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::for_source()
    }
}

impl RetryConfig {
    /// Content source reads: a couple of quick retries
    pub fn for_source() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(4),
            multiplier: 2.0,
            jitter: true,
        }
    }

    /// Destination sends: one retry, honoring short rate-limit waits
    ///
    /// Longer rate limits surface to the dispatcher, which leaves the item
    /// for the next cycle.
    pub fn for_destination() -> Self {
        Self {
            max_retries: 1,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: true,
        }
    }

    /// Single attempt
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::for_source()
        }
    }

    /// Backoff before retry number `attempt` (zero-based)
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_backoff.as_secs_f64());

        let final_duration = if self.jitter {
            capped * (1.0 + rand_jitter() * 0.25)
        } else {
            capped
        };

        Duration::from_secs_f64(final_duration)
    }
}

/// Cheap 0.0..1.0 jitter from the clock's sub-second nanos
fn rand_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos % 1000) as f64 / 1000.0
}

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    /// Retry after a server-requested wait
    RetryAfter(Duration),
    NoRetry,
}

/// Errors that know whether a retry could help
pub trait RetryableError {
    fn retry_decision(&self) -> RetryDecision;
}

/// Run `operation`, retrying transient failures per `config`
///
/// A `RetryAfter` longer than `max_backoff` is not waited out: the error is
/// returned immediately so the caller can defer the work instead.
pub async fn with_retry<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryableError + std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        let e = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        let backoff = match e.retry_decision() {
            RetryDecision::NoRetry => {
                debug!(
                    operation = operation_name,
                    attempt = attempt,
                    "Operation failed with non-retryable error: {}",
                    e
                );
                return Err(e);
            }
            RetryDecision::RetryAfter(wait) if wait > config.max_backoff => {
                debug!(
                    operation = operation_name,
                    retry_after_secs = wait.as_secs_f64(),
                    "Requested wait exceeds retry budget: {}",
                    e
                );
                return Err(e);
            }
            RetryDecision::RetryAfter(wait) => wait,
            RetryDecision::Retry => config.backoff_duration(attempt),
        };

        if attempt >= config.max_retries {
            warn!(
                operation = operation_name,
                attempts = attempt + 1,
                "Operation failed after {} attempts: {}",
                attempt + 1,
                e
            );
            return Err(e);
        }

        debug!(
            operation = operation_name,
            attempt = attempt + 1,
            max_attempts = config.max_retries + 1,
            backoff_secs = backoff.as_secs_f64(),
            "Retrying after error: {}",
            e
        );

        sleep(backoff).await;
        attempt += 1;
    }
}

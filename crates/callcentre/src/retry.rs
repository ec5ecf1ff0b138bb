//! Retry policy for operations that must keep trying until they succeed.
//!
//! The default policy retries forever with no delay between attempts. A cap
//! and an exponential backoff (via `backon::ExponentialBuilder`) can be
//! layered on top. Every retry loop observes a `CancellationToken`.

use backon::{BackoffBuilder, ExponentialBuilder};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Exponential backoff bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Cap for exponential growth
    pub max_delay: Duration,
}

/// How often and how patiently an operation is retried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryPolicy {
    /// Give up after this many attempts (`None` = never give up)
    pub max_attempts: Option<u32>,
    /// Delay between attempts (`None` = retry immediately)
    pub backoff: Option<Backoff>,
}

impl RetryPolicy {
    /// Retry forever, immediately
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_backoff(mut self, initial_delay: Duration, max_delay: Duration) -> Self {
        self.backoff = Some(Backoff {
            initial_delay,
            max_delay: max_delay.max(initial_delay),
        });
        self
    }

    fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

/// How a retry loop ended
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    Succeeded { value: T, attempts: u32 },
    /// The attempt cap was reached; carries the last error
    Exhausted { error: E, attempts: u32 },
    Cancelled { attempts: u32 },
}

/// Run `op` until it succeeds, the policy gives up, or `cancel` fires.
///
/// Each failure is logged at warn level with the attempt number. An
/// in-flight attempt is dropped when cancellation fires.
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    operation: &str,
    mut op: F,
) -> RetryOutcome<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut delays = policy.backoff.map(|b| {
        ExponentialBuilder::default()
            .with_min_delay(b.initial_delay)
            .with_max_delay(b.max_delay)
            .with_factor(2.0)
            .with_jitter()
            .build()
    });
    let mut attempts = 0u32;

    loop {
        if cancel.is_cancelled() {
            return RetryOutcome::Cancelled { attempts };
        }
        attempts += 1;

        let result = tokio::select! {
            result = op() => result,
            _ = cancel.cancelled() => return RetryOutcome::Cancelled { attempts },
        };

        let error = match result {
            Ok(value) => {
                debug!(operation, attempts, "Operation succeeded");
                return RetryOutcome::Succeeded { value, attempts };
            }
            Err(error) => error,
        };

        if policy.exhausted(attempts) {
            return RetryOutcome::Exhausted { error, attempts };
        }
        warn!(operation, attempt = attempts, error = %error, "Attempt failed, retrying");

        match (delays.as_mut(), policy.backoff) {
            (Some(delays), Some(backoff)) => {
                let delay = delays.next().unwrap_or(backoff.max_delay);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return RetryOutcome::Cancelled { attempts },
                }
            }
            // Without a backoff the loop must still yield, or a failing
            // operation that never awaits would starve the runtime.
            _ => tokio::task::yield_now().await,
        }
    }
}

//! Bounded retry for completion calls.
//!
//! Every backend call made by an agent goes through [`call_with_retry`]. A
//! call is bounded three ways: the per-call time bound chosen from the
//! complexity tier, the deadline of the round it belongs to, and the
//! request's cancellation token.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::llm::{LlmError, LlmErrorKind};

/// Retry behaviour for rate limits and malformed structured output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt
    pub max_retries: u32,
    /// Wait used when the provider does not suggest one
    pub default_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            default_delay: Duration::from_secs(5),
        }
    }
}

/// Time and cancellation limits for one agent call.
#[derive(Debug, Clone)]
pub struct CallBudget {
    /// Hard ceiling for a single backend request
    pub bound: Duration,
    /// End of the enclosing round
    pub deadline: Instant,
    pub cancel: CancellationToken,
}

impl CallBudget {
    pub fn new(bound: Duration, deadline: Instant, cancel: CancellationToken) -> Self {
        Self {
            bound,
            deadline,
            cancel,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Time allowed for the next request: the per-call bound, clipped to the round.
    pub fn call_timeout(&self) -> Duration {
        self.bound.min(self.remaining())
    }
}

/// Run `op` until it succeeds, fails permanently, or exhausts the policy.
///
/// `op` receives the time bound for that attempt and should pass it on to
/// the backend. `on_backoff(retry, error, delay)` fires before each wait.
///
/// # Errors
/// Returns the last backend error once retries are exhausted or the error is
/// not retryable. A wait that would overrun the round deadline fails
/// immediately with `Timeout`; a cancelled token yields `Cancelled`.
pub async fn call_with_retry<T, F, Fut, B>(
    policy: &RetryPolicy,
    budget: &CallBudget,
    mut op: F,
    mut on_backoff: B,
) -> Result<T, LlmError>
where
    F: FnMut(Duration) -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
    B: FnMut(u32, &LlmError, Duration),
{
    let started = Instant::now();
    let mut retries = 0u32;

    loop {
        if budget.cancel.is_cancelled() {
            return Err(LlmError::cancelled());
        }
        let timeout = budget.call_timeout();
        if timeout.is_zero() {
            return Err(LlmError::timeout(budget.bound));
        }

        let outcome = tokio::select! {
            biased;
            _ = budget.cancel.cancelled() => return Err(LlmError::cancelled()),
            res = tokio::time::timeout(timeout, op(timeout)) => match res {
                Ok(inner) => inner,
                Err(_) => Err(LlmError::timeout(timeout)),
            },
        };

        let error = match outcome {
            Ok(value) => {
                if retries > 0 {
                    tracing::info!(
                        "Request succeeded after {} retries (total time: {:?})",
                        retries,
                        started.elapsed()
                    );
                }
                return Ok(value);
            }
            Err(error) => error,
        };

        if !error.is_retryable() || retries >= policy.max_retries {
            if retries > 0 {
                tracing::error!(
                    "Request failed after {} retries (total time: {:?}): {}",
                    retries,
                    started.elapsed(),
                    error
                );
            } else {
                tracing::error!("Request failed (non-retryable): {}", error);
            }
            return Err(error);
        }

        let delay = error.resolved_delay(policy.default_delay);
        if delay > budget.remaining() {
            tracing::warn!(
                "Retry delay {:?} exceeds remaining round time {:?}: {}",
                delay,
                budget.remaining(),
                error
            );
            return Err(LlmError {
                kind: LlmErrorKind::Timeout,
                status_code: error.status_code,
                message: format!("round deadline reached while backing off from: {}", error),
                retry_after: error.retry_after,
            });
        }

        retries += 1;
        tracing::warn!(
            "Retry attempt {} failed with {}, retrying in {:?}: {}",
            retries,
            error.kind,
            delay,
            error.message
        );
        on_backoff(retries, &error, delay);

        tokio::select! {
            biased;
            _ = budget.cancel.cancelled() => return Err(LlmError::cancelled()),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

//! Centralized retry and timeout policy for external calls.
//!
//! Every collaborator call site uses the same bounded-retry discipline
//! instead of hand-rolled loops: a policy is parameterized by maximum
//! attempts, a base delay, and a retryability predicate.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::types::WardenError;

/// Bounded retry with escalating delay (`base_delay × attempt`).
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Run `operation` up to `max_attempts` times. Errors for which
    /// `retryable` returns false are returned immediately.
    pub async fn run<T, F, Fut, P>(
        &self,
        label: &str,
        mut operation: F,
        retryable: P,
    ) -> Result<T, WardenError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, WardenError>>,
        P: Fn(&WardenError) -> bool,
    {
        let mut attempt = 1u32;
        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(label, attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if attempt < self.max_attempts && retryable(&e) => {
                    let delay = self.base_delay * attempt;
                    warn!(
                        label,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retryable failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Cap an external call at `timeout`. Expiry is reported as a
/// `WardenError::Timeout` for the named operation, which the scheduler
/// treats as a non-critical, phase-local failure.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    operation: &str,
    future: Fut,
) -> Result<T, WardenError>
where
    Fut: Future<Output = Result<T, WardenError>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => Err(WardenError::Timeout {
            operation: operation.to_string(),
        }),
    }
}

use std::time::Duration;
use tokio::time::{sleep, Instant};

use crate::context::Context;

// ============================================================================
// Bounded Retry Strategy
// ============================================================================
//
// Retries an operation while its error is transient, up to a fixed number of
// attempts. The delay between attempts defaults to zero and can be tuned
// (with an optional multiplier) without touching the call site. Delays are
// bounded by the caller's context: a retry that cannot start before the
// deadline is not attempted.
//
// ============================================================================

#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Total number of attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier applied to the delay after every failed attempt
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::ZERO,
            max_delay: Duration::from_secs(1),
            multiplier: 1.0,
        }
    }
}

impl RetryConfig {
    /// Fixed attempt count, no delay between attempts
    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, initial_delay: Duration, multiplier: f64) -> Self {
        self.initial_delay = initial_delay;
        self.multiplier = multiplier;
        self
    }
}

/// Result of a retry operation
#[derive(Debug)]
pub enum RetryResult<T, E> {
    /// Operation succeeded
    Success(T),
    /// Attempts ran out, or the deadline left no room for another one.
    /// Holds the last transient error and how many attempts were made.
    Failed { last_error: E, attempts: u32 },
    /// Operation failed with an error that must not be retried
    PermanentFailure(E),
}

/// Check if an error is transient (should retry) or permanent (should not retry)
pub trait IsTransient {
    fn is_transient(&self) -> bool;
}

/// Run `operation` until it succeeds, fails permanently, or runs out of
/// attempts. `operation` receives the 1-based attempt number.
pub async fn retry_on_transient<F, Fut, T, E>(
    ctx: &Context,
    config: RetryConfig,
    mut operation: F,
) -> RetryResult<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display + IsTransient,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation(attempt).await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::info!(
                        attempt = attempt,
                        "Operation succeeded after retry"
                    );
                }
                return RetryResult::Success(result);
            }
            Err(error) => {
                if !error.is_transient() {
                    tracing::error!(
                        attempt = attempt,
                        error = %error,
                        "Permanent failure detected, not retrying"
                    );
                    return RetryResult::PermanentFailure(error);
                }

                if attempt >= max_attempts {
                    tracing::error!(
                        attempt = attempt,
                        error = %error,
                        "Operation failed after all retries"
                    );
                    return RetryResult::Failed {
                        last_error: error,
                        attempts: attempt,
                    };
                }

                if !has_room_for(ctx, delay) {
                    tracing::error!(
                        attempt = attempt,
                        error = %error,
                        delay_ms = delay.as_millis() as u64,
                        "Deadline reached before next retry"
                    );
                    return RetryResult::Failed {
                        last_error: error,
                        attempts: attempt,
                    };
                }

                tracing::warn!(
                    attempt = attempt,
                    error = %error,
                    delay_ms = delay.as_millis() as u64,
                    "Transient failure, retrying"
                );

                if !delay.is_zero() {
                    if ctx.guard(sleep(delay)).await.is_err() {
                        return RetryResult::Failed {
                            last_error: error,
                            attempts: attempt,
                        };
                    }
                    delay = Duration::from_millis(
                        ((delay.as_millis() as f64) * config.multiplier) as u64
                    );
                    delay = delay.min(config.max_delay);
                }
            }
        }
    }
}

/// Whether another attempt can start after `delay` without passing the deadline.
fn has_room_for(ctx: &Context, delay: Duration) -> bool {
    match ctx.deadline() {
        Some(deadline) => Instant::now() + delay < deadline,
        None => true,
    }
}

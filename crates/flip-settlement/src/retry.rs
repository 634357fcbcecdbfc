//! Bounded retries and poll-until-ready waits.
//!
//! Every sleep goes through [`ShutdownSignal::sleep`], so a shutdown aborts a
//! wait immediately and tests can drive delays with a paused clock.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::SettlementError;
use crate::shutdown::ShutdownSignal;

/// Delay schedule between attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryStrategy {
    /// Fixed delay between retries.
    Fixed { delay: Duration },
    /// Doubling delay, capped.
    Exponential { initial: Duration, max: Duration },
}

impl RetryStrategy {
    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay } => *delay,
            Self::Exponential { initial, max } => {
                let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
                initial.saturating_mul(factor).min(*max)
            }
        }
    }
}

/// An attempt budget plus a delay schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub strategy: RetryStrategy,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            strategy: RetryStrategy::Fixed { delay },
        }
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// attempt budget is spent. The last error is returned on exhaustion.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    shutdown: &ShutdownSignal,
    operation: &'static str,
    op: F,
) -> Result<T, SettlementError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, SettlementError>>,
{
    retry_if(policy, shutdown, operation, SettlementError::is_retryable, op).await
}

/// Like [`retry`], but `should_retry` decides which errors get another
/// attempt. Cancellation is never retried.
pub async fn retry_if<T, F, Fut>(
    policy: &RetryPolicy,
    shutdown: &ShutdownSignal,
    operation: &'static str,
    should_retry: fn(&SettlementError) -> bool,
    mut op: F,
) -> Result<T, SettlementError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, SettlementError>>,
{
    let mut attempt = 1;
    loop {
        if shutdown.is_cancelled() {
            return Err(SettlementError::Cancelled);
        }
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_cancelled() || !should_retry(&e) => return Err(e),
            Err(e) if attempt >= policy.max_attempts => {
                warn!(
                    operation,
                    attempts = attempt,
                    error = %e,
                    "retry budget exhausted"
                );
                return Err(e);
            }
            Err(e) => {
                let delay = policy.strategy.delay_for_attempt(attempt);
                warn!(
                    operation,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "attempt failed, retrying"
                );
                shutdown.sleep(delay).await?;
                attempt += 1;
            }
        }
    }
}

/// Poll `check` until it yields a value, at most `max_attempts` times with
/// `interval` between polls.
///
/// Retryable check errors count as "not ready"; any other error is returned.
/// `Ok(None)` means the budget ran out.
pub async fn poll_until<T, F, Fut>(
    max_attempts: u32,
    interval: Duration,
    shutdown: &ShutdownSignal,
    mut check: F,
) -> Result<Option<T>, SettlementError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, SettlementError>>,
{
    for attempt in 1..=max_attempts {
        if shutdown.is_cancelled() {
            return Err(SettlementError::Cancelled);
        }
        match check().await {
            Ok(Some(value)) => return Ok(Some(value)),
            Ok(None) => debug!(attempt, max_attempts, "not ready"),
            Err(e) if e.is_retryable() => {
                debug!(attempt, max_attempts, error = %e, "check failed, polling again")
            }
            Err(e) => return Err(e),
        }
        if attempt < max_attempts {
            shutdown.sleep(interval).await?;
        }
    }
    Ok(None)
}

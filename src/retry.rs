use async_trait::async_trait;
use std::{future::Future, time::Duration};
use tracing::debug;

use crate::error::Result;

/// How many times to check and how long to wait in between
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Checks made before giving up, at least one
    pub max_attempts: u32,
    /// Pause between consecutive checks
    pub interval: Duration,
}

impl RetryPolicy {
    /// Create a policy
    #[must_use]
    pub const fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }
}

/// Source of delays, swappable in tests
#[async_trait]
pub trait Clock: Send + Sync {
    /// Wait for `duration`
    async fn sleep(&self, duration: Duration);
}

/// [`Clock`] backed by the tokio timer
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// What to do with one check result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollDecision {
    /// Stop, the wanted state was reached
    Success,
    /// Stop, the state can never become the wanted one
    Abort,
    /// Check again after the interval
    Continue,
}

/// How a poll ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    /// Check result classified as success
    Success {
        /// Check result
        value: T,
        /// Checks made
        attempts: u32,
    },
    /// Check result classified as abort
    Abort {
        /// Check result
        value: T,
        /// Checks made
        attempts: u32,
    },
    /// Every attempt returned [`PollDecision::Continue`]
    Exhausted {
        /// Result of the final check
        last: Option<T>,
        /// Checks made
        attempts: u32,
    },
}

impl<T> PollOutcome<T> {
    /// Checks made before the poll ended
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        match self {
            Self::Success { attempts, .. }
            | Self::Abort { attempts, .. }
            | Self::Exhausted { attempts, .. } => *attempts,
        }
    }
}

/// Check until `classify` accepts or rejects a result, or attempts run out
///
/// The first check runs immediately; the policy interval is slept between
/// checks, never after the last one. `check` receives the 1-based attempt
/// number.
///
/// # Errors
///
/// Returns the first error produced by `check`; no further checks are made.
pub async fn poll_until<T, P, Fut, C>(
    policy: &RetryPolicy,
    clock: &dyn Clock,
    mut check: P,
    mut classify: C,
) -> Result<PollOutcome<T>>
where
    P: FnMut(u32) -> Fut + Send,
    Fut: Future<Output = Result<T>> + Send,
    C: FnMut(&T) -> PollDecision + Send,
    T: Send,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut last = None;

    for attempt in 1..=max_attempts {
        if attempt > 1 {
            clock.sleep(policy.interval).await;
        }

        let value = check(attempt).await?;
        match classify(&value) {
            PollDecision::Success => {
                return Ok(PollOutcome::Success {
                    value,
                    attempts: attempt,
                })
            }
            PollDecision::Abort => {
                return Ok(PollOutcome::Abort {
                    value,
                    attempts: attempt,
                })
            }
            PollDecision::Continue => {
                debug!("Poll attempt {}/{} not settled", attempt, max_attempts);
                last = Some(value);
            }
        }
    }

    Ok(PollOutcome::Exhausted {
        last,
        attempts: max_attempts,
    })
}

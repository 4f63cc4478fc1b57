//! Retry and failure policy for node executions.

use std::time::{Duration, Instant};

use crate::error::Error;
use crate::workflow::{BackoffType, Node, OnErrorAction, RetryConfig};

/// Cap on the exponential shift so delays cannot overflow.
const MAX_BACKOFF_SHIFT: u32 = 20;

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDecision {
    /// Sleep, then try again
    Retry(Duration),
    /// Record the failure and emit empty output on every branch
    ContinueWithEmpty,
    /// Record the failure against the item and carry on with the others
    SkipItem,
    /// Fail the node (and the run)
    Propagate,
}

/// Failure handling configured on one node.
#[derive(Debug, Clone, Default)]
pub struct ErrorPolicy {
    pub on_error: OnErrorAction,
    pub retry: Option<RetryConfig>,
}

impl ErrorPolicy {
    pub fn new(on_error: OnErrorAction, retry: Option<RetryConfig>) -> Self {
        Self { on_error, retry }
    }

    pub fn for_node(node: &Node) -> Self {
        Self::new(node.on_error, node.retry.clone())
    }

    /// Total attempts allowed, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.retry.as_ref().map(|r| r.max_attempts.max(1)).unwrap_or(1)
    }

    /// Decide after `attempt` (1-based) failed with `error`.
    ///
    /// `remaining` is what is left of the run budget; a retry that would
    /// sleep past it is not attempted.
    pub fn decide(&self, attempt: u32, error: &Error, remaining: Option<Duration>) -> FailureDecision {
        if error.is_retryable() && attempt < self.max_attempts() {
            if let Some(retry) = &self.retry {
                let delay = retry_delay(retry, attempt);
                return match remaining {
                    Some(left) if delay >= left => FailureDecision::Propagate,
                    _ => FailureDecision::Retry(delay),
                };
            }
        }

        match self.on_error {
            OnErrorAction::Propagate => FailureDecision::Propagate,
            OnErrorAction::ContinueWithEmpty => FailureDecision::ContinueWithEmpty,
            OnErrorAction::ContinuePerItem => FailureDecision::SkipItem,
        }
    }
}

/// Delay before attempt `attempt + 1`.
pub fn retry_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let base = config.delay_ms;
    let ms = match config.backoff {
        BackoffType::Fixed => base,
        BackoffType::Linear => base.saturating_mul(attempt as u64),
        BackoffType::Exponential => {
            let shift = attempt.saturating_sub(1).min(MAX_BACKOFF_SHIFT);
            base.saturating_mul(1u64 << shift)
        }
    };
    let ms = match config.max_delay_ms {
        Some(cap) => ms.min(cap),
        None => ms,
    };
    Duration::from_millis(ms)
}

/// Time left before `deadline`, `None` once it has passed.
pub fn remaining_until(deadline: Instant) -> Option<Duration> {
    let now = Instant::now();
    if now >= deadline {
        None
    } else {
        Some(deadline.saturating_duration_since(now))
    }
}

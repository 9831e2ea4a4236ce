//! Bounded retry around [`IssuanceTransaction::issue_once`].
//!
//! The loop is a small state machine. [`RetryPolicy::next_state`] is a pure
//! transition from the outcome of attempt `n` to what happens next, and
//! [`run_with_retry`] drives it. Attempt counting lives in the driver's
//! stack frame only.

use std::future::Future;

use crate::error::IssueError;
use crate::models::{CouponId, CouponIssue, UserId};
use crate::services::issuance::IssuanceTransaction;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

#[derive(Debug)]
pub enum AttemptState<T> {
    /// Attempt `n` (1-based) is about to run.
    Attempting(u32),
    Committed(T),
    TerminalFailure(IssueError),
    ConflictExhausted { attempts: u32 },
}

impl RetryPolicy {
    /// `None` for a ceiling of zero, which would never run an attempt.
    pub fn new(max_attempts: u32) -> Option<Self> {
        (max_attempts > 0).then_some(Self { max_attempts })
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn next_state<T>(&self, attempt: u32, outcome: Result<T, IssueError>) -> AttemptState<T> {
        match outcome {
            Ok(value) => AttemptState::Committed(value),
            Err(err) if err.is_retryable() => {
                if attempt >= self.max_attempts {
                    AttemptState::ConflictExhausted { attempts: attempt }
                } else {
                    AttemptState::Attempting(attempt + 1)
                }
            }
            Err(err) => AttemptState::TerminalFailure(err),
        }
    }
}

/// Drives `attempt(n)` until it commits, fails terminally, or runs out of
/// attempts on conflicts.
pub async fn run_with_retry<T, F, Fut>(policy: RetryPolicy, mut attempt: F) -> Result<T, IssueError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, IssueError>>,
{
    let mut state = AttemptState::Attempting(1);

    loop {
        state = match state {
            AttemptState::Attempting(n) => {
                let outcome = attempt(n).await;
                let next = policy.next_state(n, outcome);
                if let AttemptState::Attempting(_) = next {
                    tracing::warn!(attempt = n, "Conflict on stock row, retrying");
                }
                next
            }
            AttemptState::Committed(value) => return Ok(value),
            AttemptState::TerminalFailure(err) => return Err(err),
            AttemptState::ConflictExhausted { attempts } => {
                tracing::warn!(attempts, "Retry ceiling reached under contention");
                return Err(IssueError::ConflictExhausted { attempts });
            }
        };
    }
}

/// Entry point for issuing coupons. Retries transient conflicts; every
/// business failure is returned as-is after a single attempt.
#[derive(Clone)]
pub struct CouponIssueService {
    transaction: IssuanceTransaction,
    policy: RetryPolicy,
}

impl CouponIssueService {
    pub fn new(transaction: IssuanceTransaction, policy: RetryPolicy) -> Self {
        Self {
            transaction,
            policy,
        }
    }

    pub fn transaction(&self) -> &IssuanceTransaction {
        &self.transaction
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    #[tracing::instrument(skip(self))]
    pub async fn issue_coupon(
        &self,
        user_id: UserId,
        coupon_id: CouponId,
    ) -> Result<CouponIssue, IssueError> {
        let transaction = &self.transaction;
        let result = run_with_retry(self.policy, move |_| {
            transaction.issue_once(user_id, coupon_id)
        })
        .await;

        match &result {
            Ok(issue) => tracing::info!(issue_id = %issue.id, "Coupon issued"),
            Err(e) => tracing::debug!(error = %e, "Coupon not issued"),
        }

        result
    }
}

//! Closed error taxonomy for the control plane.
//!
//! Every failure a resharding session can hit maps to exactly one of
//! these kinds. Retryable kinds (`Unreachable`, `Timeout`, `NotLeader`,
//! `RetryLater`) are retried under a bounded budget before the session
//! aborts; everything else surfaces immediately.

use crate::oplog::OpTime;
use crate::Endpoint;

/// Result alias used across the control plane.
pub type ControlResult<T> = Result<T, ControlError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ControlError {
    /// A VALIDATE precondition failed.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The cluster-wide lock for this namespace is held by someone else.
    #[error("lock busy: {0}")]
    LockBusy(String),

    /// The lease expired or was stolen before commit.
    #[error("lease lost: {0}")]
    LeaseLost(String),

    /// The endpoint did not answer at all.
    #[error("endpoint unreachable: {0}")]
    Unreachable(Endpoint),

    /// A per-stage deadline elapsed.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The operation must be addressed to the group leader.
    #[error("not leader: {0}")]
    NotLeader(Endpoint),

    /// The member answered but cannot serve yet (no leader known).
    #[error("not ready: {0}")]
    NotReady(Endpoint),

    /// Another election or reconfig is in flight; back off and retry.
    #[error("retry later: {0}")]
    RetryLater(String),

    /// A leadership request was refused outright.
    #[error("leadership rejected by {0}")]
    Rejected(Endpoint),

    /// Step-down refused: no follower inside the freshness window.
    #[error("unsafe step-down on {endpoint}: {reason}")]
    Unsafe { endpoint: Endpoint, reason: String },

    /// The requested tail start predates the oldest retained entry.
    #[error(
        "oplog truncated on {endpoint}: requested {requested}, oldest retained {oldest}"
    )]
    OplogTruncated {
        endpoint: Endpoint,
        requested: OpTime,
        oldest: OpTime,
    },

    /// The proposed key cannot yield a numeric domain estimate.
    #[error("unsupported shard key: {0}")]
    UnsupportedKey(String),

    /// Post-commit routing invariants were violated. Fatal.
    #[error("routing inconsistent for {ns}: {detail}")]
    RoutingInconsistent { ns: String, detail: String },

    /// Config store I/O failed.
    #[error("config store i/o: {0}")]
    Io(String),
}

impl ControlError {
    pub fn validation(msg: impl Into<String>) -> Self {
        ControlError::Validation(msg.into())
    }

    pub fn io(err: impl std::fmt::Display) -> Self {
        ControlError::Io(err.to_string())
    }

    /// Transient kinds worth another attempt inside the retry budget.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ControlError::Unreachable(_)
                | ControlError::Timeout(_)
                | ControlError::NotLeader(_)
                | ControlError::RetryLater(_)
        )
    }
}

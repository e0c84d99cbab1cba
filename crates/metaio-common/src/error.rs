//! Error types for MetaIO
//!
//! One error type covers validation, storage, integrity and lifecycle
//! failures. It is `Clone` because a single page failure is reported to
//! every request merged onto the same page.

use crate::types::{ArrayId, IoDirection, Lpn, StorageTier};
use thiserror::Error;

/// Common result type for MetaIO operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for MetaIO
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    // Validation errors
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("array {array_id} has no {tier} metadata region registered")]
    ArrayNotRegistered { array_id: ArrayId, tier: StorageTier },

    #[error("byte range {offset}+{size} exceeds file capacity {capacity}")]
    OutOfRange { offset: u64, size: u64, capacity: u64 },

    #[error("configuration error: {0}")]
    Configuration(String),

    // Storage errors
    #[error("page {direction} submission failed for lpn {lpn}: {reason}")]
    SubmissionFailed {
        direction: IoDirection,
        lpn: Lpn,
        reason: String,
    },

    #[error("page {direction} failed for lpn {lpn} (code {code})")]
    IoFailed {
        direction: IoDirection,
        lpn: Lpn,
        code: i32,
    },

    #[error("storage layer is stopped")]
    StorageStopped,

    // Integrity errors
    #[error("integrity check failed for lpn {lpn}: {reason}")]
    IntegrityCheckFailed { lpn: Lpn, reason: String },

    // Backpressure escalation
    #[error("request deferred {retries} times without making progress")]
    RetryBudgetExceeded { retries: u64 },

    // Lifecycle errors
    #[error("pipeline is shutting down")]
    ShuttingDown,

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an invalid request error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if the request was rejected before entering the pipeline
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidRequest(_)
                | Self::InvalidArgument(_)
                | Self::ArrayNotRegistered { .. }
                | Self::OutOfRange { .. }
                | Self::Configuration(_)
        )
    }

    /// Check if resubmitting the same request may succeed
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::RetryBudgetExceeded { .. } | Self::ShuttingDown)
    }

    /// Rank used when several failures land on one request group
    ///
    /// Higher is more severe.
    #[must_use]
    pub const fn severity(&self) -> u8 {
        match self {
            Self::InvalidRequest(_)
            | Self::InvalidArgument(_)
            | Self::ArrayNotRegistered { .. }
            | Self::OutOfRange { .. }
            | Self::Configuration(_) => 1,
            Self::RetryBudgetExceeded { .. } | Self::ShuttingDown => 2,
            Self::SubmissionFailed { .. } | Self::IoFailed { .. } => 3,
            Self::IntegrityCheckFailed { .. } => 4,
            Self::StorageStopped | Self::Internal(_) => 5,
        }
    }

    /// Keep the more severe of two errors; the first one wins a tie
    #[must_use]
    pub fn most_severe(self, other: Self) -> Self {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

use thiserror::Error;

use crate::aggregate::ExpectedVersion;

pub type DomainResult<T> = Result<T, DomainError>;

/// Deterministic failures raised while building or checking domain values.
///
/// Storage and broker failures have their own error types in `payrecon-infra`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// Optimistic concurrency check failed.
    #[error("version mismatch (expected {expected:?}, actual {actual})")]
    VersionMismatch {
        expected: ExpectedVersion,
        actual: u64,
    },
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}

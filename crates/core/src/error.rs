//! Domain error model.

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// Deterministic failures raised by pure domain code (parsing, posting
/// invariants, version checks). Storage and queue errors live in `infra`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("validation failed: {0}")]
    Validation(String),

    /// A posting or lifecycle invariant does not hold.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// The row changed since it was read.
    #[error("version conflict: expected {expected}, found {actual}")]
    VersionConflict { expected: u64, actual: u64 },
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}

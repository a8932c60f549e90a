//! Optimistic concurrency for versioned rows.

use crate::error::{DomainError, DomainResult};

/// Which version a writer read before changing a versioned row.
///
/// Aggregated transactions carry a `version` column that is bumped on every
/// status change.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    Any,
    Exact(u64),
}

impl ExpectedVersion {
    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::Exact(v) => v == actual,
        }
    }

    pub fn check(self, actual: u64) -> DomainResult<()> {
        match self {
            ExpectedVersion::Exact(expected) if expected != actual => {
                Err(DomainError::VersionConflict { expected, actual })
            }
            _ => Ok(()),
        }
    }
}

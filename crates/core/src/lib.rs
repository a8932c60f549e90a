//! `backoffice-core`: identifiers and domain error model shared by the back office crates.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod error;
pub mod id;
pub mod version;

pub use error::{DomainError, DomainResult};
pub use id::{CompanyId, JobId, JournalId, TransactionId, UserId};
pub use version::ExpectedVersion;

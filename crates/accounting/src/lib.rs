//! Accounting module (double-entry postings for point-of-sale sales).
//!
//! Pure domain logic only: no IO, no HTTP, no persistence concerns.

pub mod ledger;
pub mod mapping;
pub mod posting;
pub mod transaction;

pub use ledger::{Account, AccountKind, JournalEntryLine, JournalPosting};
pub use mapping::{AccountMapping, PaymentMethodAccount};
pub use posting::{PostingRejection, build_posting, journal_number};
pub use transaction::{AggregatedTransaction, PaymentMethodId, SourceType, TransactionStatus};

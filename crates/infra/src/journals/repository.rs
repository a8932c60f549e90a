//! Storage seam for journal generation.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

use backoffice_accounting::{
    AccountMapping, AggregatedTransaction, JournalPosting, PaymentMethodId, PostingRejection, TransactionStatus,
};
use backoffice_core::{CompanyId, ExpectedVersion, JournalId, TransactionId};

use super::selection::TransactionSelection;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JournalStoreError {
    #[error("journal storage error: {0}")]
    Storage(String),

    /// Connection loss, pool timeout, deadlock or serialization failure.
    #[error("transient journal storage error: {0}")]
    Transient(String),

    #[error("failed to decode {entity} row: {message}")]
    Decode { entity: &'static str, message: String },
}

impl JournalStoreError {
    /// Whether repeating the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, JournalStoreError::Transient(_))
    }
}

/// A journal written by a chunk commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreatedJournal {
    pub journal_id: JournalId,
    pub transaction_id: TransactionId,
    pub journal_number: String,
    pub journal_date: NaiveDate,
    pub total_amount: i64,
    pub line_count: usize,
}

impl CreatedJournal {
    pub fn from_posting(journal_id: JournalId, posting: &JournalPosting) -> Self {
        Self {
            journal_id,
            transaction_id: posting.transaction_id,
            journal_number: posting.journal_number.clone(),
            journal_date: posting.journal_date,
            total_amount: i64::try_from(posting.total_debits()).unwrap_or(i64::MAX),
            line_count: posting.lines.len(),
        }
    }
}

/// A transaction that did not produce a journal, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedTransaction {
    pub transaction_id: TransactionId,
    pub source_ref: String,
    pub code: &'static str,
    pub reason: String,
}

impl FailedTransaction {
    pub fn new(transaction_id: TransactionId, source_ref: impl Into<String>, rejection: &PostingRejection) -> Self {
        Self {
            transaction_id,
            source_ref: source_ref.into(),
            code: rejection.code(),
            reason: rejection.to_string(),
        }
    }
}

/// Outcome of one chunk commit.
///
/// `conflicts` are postings whose source row changed since selection; nothing
/// was written for them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkCommit {
    pub created: Vec<CreatedJournal>,
    pub conflicts: Vec<JournalPosting>,
}

#[async_trait]
pub trait JournalRepository: Send + Sync {
    async fn select_transactions(
        &self,
        company_id: CompanyId,
        selection: &TransactionSelection,
    ) -> Result<Vec<AggregatedTransaction>, JournalStoreError>;

    /// Ledger accounts for the given payment methods plus the company-level
    /// revenue, tax, service charge and discount accounts.
    async fn load_account_mapping(
        &self,
        company_id: CompanyId,
        payment_methods: &[PaymentMethodId],
    ) -> Result<AccountMapping, JournalStoreError>;

    /// Persist a chunk of postings atomically: all of it or none of it.
    ///
    /// Each source row is moved to `COMPLETED`, linked to its journal, and has
    /// its version bumped, guarded by `posting.source_version`.
    async fn commit_chunk(&self, postings: &[JournalPosting]) -> Result<ChunkCommit, JournalStoreError>;
}

#[derive(Debug, Default)]
struct InMemoryState {
    transactions: HashMap<TransactionId, AggregatedTransaction>,
    mappings: HashMap<CompanyId, AccountMapping>,
    journals: Vec<(JournalId, JournalPosting)>,
    commits_attempted: usize,
    fail_on_commit: Option<usize>,
    transient_faults: usize,
}

/// In-memory repository for tests, with storage fault injection.
#[derive(Debug, Default)]
pub struct InMemoryJournalRepository {
    state: Mutex<InMemoryState>,
}

impl InMemoryJournalRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_transaction(&self, tx: AggregatedTransaction) {
        self.state.lock().transactions.insert(tx.id, tx);
    }

    pub fn set_mapping(&self, company_id: CompanyId, mapping: AccountMapping) {
        self.state.lock().mappings.insert(company_id, mapping);
    }

    /// Make the `n`th commit attempt (1-based) fail with a non-retryable storage error.
    pub fn fail_on_commit(&self, n: usize) {
        self.state.lock().fail_on_commit = Some(n);
    }

    /// Make the next `times` commit attempts fail with a transient error.
    pub fn fail_transiently(&self, times: usize) {
        self.state.lock().transient_faults = times;
    }

    pub fn transaction(&self, id: TransactionId) -> Option<AggregatedTransaction> {
        self.state.lock().transactions.get(&id).cloned()
    }

    pub fn journals(&self) -> Vec<(JournalId, JournalPosting)> {
        self.state.lock().journals.clone()
    }

    pub fn commits_attempted(&self) -> usize {
        self.state.lock().commits_attempted
    }
}

#[async_trait]
impl JournalRepository for InMemoryJournalRepository {
    async fn select_transactions(
        &self,
        company_id: CompanyId,
        selection: &TransactionSelection,
    ) -> Result<Vec<AggregatedTransaction>, JournalStoreError> {
        let state = self.state.lock();
        let mut rows: Vec<_> = state
            .transactions
            .values()
            .filter(|tx| selection.matches(company_id, tx))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            a.transaction_date
                .cmp(&b.transaction_date)
                .then_with(|| a.source_ref.cmp(&b.source_ref))
                .then(a.id.cmp(&b.id))
        });
        Ok(rows)
    }

    async fn load_account_mapping(
        &self,
        company_id: CompanyId,
        _payment_methods: &[PaymentMethodId],
    ) -> Result<AccountMapping, JournalStoreError> {
        Ok(self.state.lock().mappings.get(&company_id).cloned().unwrap_or_default())
    }

    async fn commit_chunk(&self, postings: &[JournalPosting]) -> Result<ChunkCommit, JournalStoreError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.commits_attempted += 1;
        if state.fail_on_commit == Some(state.commits_attempted) {
            return Err(JournalStoreError::Storage(format!(
                "injected fault on commit {}",
                state.commits_attempted
            )));
        }
        if state.transient_faults > 0 {
            state.transient_faults -= 1;
            return Err(JournalStoreError::Transient(format!(
                "connection reset on commit {}",
                state.commits_attempted
            )));
        }

        let mut commit = ChunkCommit::default();
        for posting in postings {
            let Some(tx) = state.transactions.get_mut(&posting.transaction_id) else {
                commit.conflicts.push(posting.clone());
                continue;
            };
            if !ExpectedVersion::Exact(posting.source_version).matches(tx.version)
                || tx.journal_id.is_some()
                || tx.is_deleted()
            {
                commit.conflicts.push(posting.clone());
                continue;
            }
            let journal_id = JournalId::new();
            tx.status = TransactionStatus::Completed;
            tx.journal_id = Some(journal_id);
            tx.version += 1;
            commit.created.push(CreatedJournal::from_posting(journal_id, posting));
            state.journals.push((journal_id, posting.clone()));
        }
        Ok(commit)
    }
}

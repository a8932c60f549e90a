//! Chunked journal generation.
//!
//! Transactions are selected once, the account mapping is resolved once, and
//! the rows are then posted in fixed-size chunks. Every chunk commits on its
//! own: a storage fault in chunk N keeps chunks 1..N-1 and stops the run.
//! Transient faults (lost connections, pool timeouts, deadlocks) are retried
//! with exponential backoff before they count as a fault.
//! Per-row problems never stop a run; they end up in `failed`.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, instrument, warn};

use backoffice_accounting::{build_posting, JournalPosting, PaymentMethodId, PostingRejection};
use backoffice_core::CompanyId;

use crate::config::{MAX_JOURNAL_CHUNK_SIZE, MIN_JOURNAL_CHUNK_SIZE};
use crate::jobs::CancellationToken;

use super::repository::{ChunkCommit, CreatedJournal, FailedTransaction, JournalRepository, JournalStoreError};
use super::selection::TransactionSelection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationPhase {
    Selecting,
    Lookup,
    Posting,
    Complete,
}

/// Progress on a `0..=total` scale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationProgress {
    pub current: u32,
    pub total: u32,
    pub phase: GenerationPhase,
    pub message: String,
}

impl GenerationProgress {
    fn new(current: u32, phase: GenerationPhase, message: impl Into<String>) -> Self {
        Self {
            current: current.min(100),
            total: 100,
            phase,
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait GenerationProgressSink: Send + Sync {
    async fn report(&self, progress: GenerationProgress);
}

/// Discards progress.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

#[async_trait]
impl GenerationProgressSink for NoProgress {
    async fn report(&self, _progress: GenerationProgress) {}
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JournalGenerationResult {
    pub journals: Vec<CreatedJournal>,
    pub failed: Vec<FailedTransaction>,
    pub total_transactions: usize,
    pub total_journals: usize,
    /// Chunks walked through, including ones whose rows were all rejected.
    /// Such a chunk has nothing to write and issues no commit, so the number
    /// of commits can be lower than this.
    pub chunks_processed: usize,
    pub duration_ms: u64,
}

impl JournalGenerationResult {
    /// Shape stored under the job's `importResults`.
    pub fn to_import_results(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "pos_journals",
            "success": self.journals,
            "failed": self.failed,
            "total_transactions": self.total_transactions,
            "total_journals": self.total_journals,
            "chunks_processed": self.chunks_processed,
            "duration_ms": self.duration_ms,
        })
    }
}

#[derive(Debug, Error)]
pub enum JournalGenerationError {
    #[error("failed to select transactions: {0}")]
    Selection(#[source] JournalStoreError),

    #[error("failed to resolve account mapping: {0}")]
    Lookup(#[source] JournalStoreError),

    #[error("sales revenue account is not configured for this company")]
    MissingSalesAccount,

    #[error("chunk {chunk} of {total_chunks} failed after {} journals were committed: {source}", .partial.total_journals)]
    ChunkFailed {
        chunk: usize,
        total_chunks: usize,
        partial: Box<JournalGenerationResult>,
        #[source]
        source: JournalStoreError,
    },

    #[error("journal generation cancelled after {} journals", .partial.total_journals)]
    Cancelled { partial: Box<JournalGenerationResult> },
}

/// Retries of a chunk commit after a transient storage fault.
pub const COMMIT_RETRIES: u32 = 3;
/// First retry delay; doubles on every further attempt.
pub const COMMIT_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct JournalEngine {
    repo: Arc<dyn JournalRepository>,
    chunk_size: usize,
    commit_retries: u32,
    retry_base_delay: Duration,
}

impl std::fmt::Debug for JournalEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalEngine")
            .field("chunk_size", &self.chunk_size)
            .field("commit_retries", &self.commit_retries)
            .finish_non_exhaustive()
    }
}

impl JournalEngine {
    /// `chunk_size` is clamped into the supported range.
    pub fn new(repo: Arc<dyn JournalRepository>, chunk_size: usize) -> Self {
        Self {
            repo,
            chunk_size: chunk_size.clamp(MIN_JOURNAL_CHUNK_SIZE, MAX_JOURNAL_CHUNK_SIZE),
            commit_retries: COMMIT_RETRIES,
            retry_base_delay: COMMIT_RETRY_BASE_DELAY,
        }
    }

    pub fn with_retry_policy(mut self, retries: u32, base_delay: Duration) -> Self {
        self.commit_retries = retries;
        self.retry_base_delay = base_delay;
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn repository(&self) -> &Arc<dyn JournalRepository> {
        &self.repo
    }

    #[instrument(skip(self, selection, progress, cancel), fields(company_id = %company_id, chunk_size = self.chunk_size), err)]
    pub async fn generate(
        &self,
        company_id: CompanyId,
        selection: &TransactionSelection,
        progress: &dyn GenerationProgressSink,
        cancel: &CancellationToken,
    ) -> Result<JournalGenerationResult, JournalGenerationError> {
        let started = Instant::now();
        progress
            .report(GenerationProgress::new(0, GenerationPhase::Selecting, "Selecting transactions..."))
            .await;

        let transactions = self
            .repo
            .select_transactions(company_id, selection)
            .await
            .map_err(JournalGenerationError::Selection)?;

        let mut result = JournalGenerationResult {
            total_transactions: transactions.len(),
            ..JournalGenerationResult::default()
        };
        if transactions.is_empty() {
            info!("no transactions selected for journal generation");
            progress
                .report(GenerationProgress::new(100, GenerationPhase::Complete, "No transactions to process"))
                .await;
            return Ok(result);
        }

        progress
            .report(GenerationProgress::new(10, GenerationPhase::Lookup, "Resolving payment method accounts..."))
            .await;
        let payment_methods: Vec<PaymentMethodId> = transactions
            .iter()
            .map(|tx| tx.payment_method_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let mapping = self
            .repo
            .load_account_mapping(company_id, &payment_methods)
            .await
            .map_err(JournalGenerationError::Lookup)?;
        if mapping.sales_revenue().is_none() {
            return Err(JournalGenerationError::MissingSalesAccount);
        }

        let total_chunks = transactions.len().div_ceil(self.chunk_size);
        for (index, chunk) in transactions.chunks(self.chunk_size).enumerate() {
            let chunk_no = index + 1;
            if cancel.is_cancelled() {
                warn!(chunk = chunk_no, total_chunks, "journal generation cancelled");
                result.duration_ms = elapsed_ms(started);
                return Err(JournalGenerationError::Cancelled {
                    partial: Box::new(result),
                });
            }

            let mut postings = Vec::with_capacity(chunk.len());
            for tx in chunk {
                match build_posting(tx, &mapping) {
                    Ok(posting) => postings.push(posting),
                    Err(rejection) => result
                        .failed
                        .push(FailedTransaction::new(tx.id, tx.source_ref.clone(), &rejection)),
                }
            }

            if !postings.is_empty() {
                match self.commit_with_retry(&postings, chunk_no).await {
                    Ok(commit) => {
                        for conflict in &commit.conflicts {
                            let rejection = PostingRejection::VersionConflict {
                                expected: conflict.source_version,
                            };
                            let source_ref = chunk
                                .iter()
                                .find(|tx| tx.id == conflict.transaction_id)
                                .map(|tx| tx.source_ref.clone())
                                .unwrap_or_default();
                            result
                                .failed
                                .push(FailedTransaction::new(conflict.transaction_id, source_ref, &rejection));
                        }
                        result.total_journals += commit.created.len();
                        result.journals.extend(commit.created);
                    }
                    Err(source) => {
                        warn!(chunk = chunk_no, total_chunks, error = %source, "journal chunk commit failed");
                        result.duration_ms = elapsed_ms(started);
                        return Err(JournalGenerationError::ChunkFailed {
                            chunk: chunk_no,
                            total_chunks,
                            partial: Box::new(result),
                            source,
                        });
                    }
                }
            }
            result.chunks_processed = chunk_no;

            let current = 15 + (80 * chunk_no / total_chunks) as u32;
            progress
                .report(GenerationProgress::new(
                    current,
                    GenerationPhase::Posting,
                    format!("Posted chunk {chunk_no} of {total_chunks}"),
                ))
                .await;
        }

        result.duration_ms = elapsed_ms(started);
        info!(
            total_transactions = result.total_transactions,
            total_journals = result.total_journals,
            failed = result.failed.len(),
            chunks = result.chunks_processed,
            duration_ms = result.duration_ms,
            "journal generation finished"
        );
        progress
            .report(GenerationProgress::new(100, GenerationPhase::Complete, "Journal generation complete"))
            .await;
        Ok(result)
    }
}

impl JournalEngine {
    /// A chunk commit is all-or-nothing, so a transient failure can simply be
    /// repeated. Anything else is returned on the first attempt.
    async fn commit_with_retry(
        &self,
        postings: &[JournalPosting],
        chunk_no: usize,
    ) -> Result<ChunkCommit, JournalStoreError> {
        let mut attempt = 0;
        loop {
            match self.repo.commit_chunk(postings).await {
                Err(err) if err.is_retryable() && attempt < self.commit_retries => {
                    attempt += 1;
                    let delay = self.retry_base_delay.saturating_mul(1u32 << (attempt - 1));
                    warn!(
                        chunk = chunk_no,
                        attempt,
                        max_attempts = self.commit_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying journal chunk commit"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

//! Job processors backed by aggregated POS transactions.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use backoffice_accounting::AggregatedTransaction;
use backoffice_core::CompanyId;

use crate::jobs::{
    JobContext, Processor, ProcessorError, ProcessorOutput, ProgressReporter, TempFileManager,
};

use super::engine::{GenerationProgress, GenerationProgressSink, JournalEngine, JournalGenerationError};
use super::repository::JournalRepository;
use super::selection::JournalJobMetadata;

/// Maps engine progress (0..=100) into 20..=95 of the job scale.
struct JobProgressSink {
    reporter: ProgressReporter,
}

#[async_trait]
impl GenerationProgressSink for JobProgressSink {
    async fn report(&self, progress: GenerationProgress) {
        let total = progress.total.max(1) as i64;
        let mapped = 20 + (progress.current as i64 * 75 + total / 2) / total;
        self.reporter.report(mapped).await;
    }
}

fn parse_metadata(ctx: &JobContext) -> Result<JournalJobMetadata, ProcessorError> {
    JournalJobMetadata::from_value(&ctx.metadata).map_err(|e| ProcessorError::InvalidMetadata(e.to_string()))
}

fn job_company(ctx: &JobContext, metadata: &JournalJobMetadata) -> Result<CompanyId, ProcessorError> {
    metadata
        .company_scope(ctx.company_id)
        .map_err(|e| ProcessorError::InvalidMetadata(e.to_string()))
}

/// `import:pos_journals`: turns selected transactions into journal postings.
///
/// Produces no file; the run summary is recorded as the job's import results.
#[derive(Debug, Clone)]
pub struct PosJournalsProcessor {
    engine: JournalEngine,
}

impl PosJournalsProcessor {
    pub fn new(engine: JournalEngine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Processor for PosJournalsProcessor {
    async fn process(&self, ctx: JobContext) -> Result<ProcessorOutput, ProcessorError> {
        let metadata = parse_metadata(&ctx)?;
        let company_id = job_company(&ctx, &metadata)?;
        let selection = metadata.selection();
        ctx.report_progress(10).await;

        let sink = JobProgressSink {
            reporter: ctx.progress_reporter(),
        };
        ctx.report_progress(20).await;

        let result = match self
            .engine
            .generate(company_id, &selection, &sink, ctx.cancellation())
            .await
        {
            Ok(result) => result,
            Err(JournalGenerationError::Cancelled { .. }) => return Err(ProcessorError::Cancelled),
            Err(err) => return Err(ProcessorError::Failed(err.to_string())),
        };

        info!(
            job_id = %ctx.job_id,
            company_id = %company_id,
            total_transactions = result.total_transactions,
            journals_created = result.total_journals,
            journals_failed = result.failed.len(),
            "pos journals job finished"
        );
        Ok(ProcessorOutput::import_results(result.to_import_results()))
    }
}

const CSV_HEADER: [&str; 15] = [
    "id",
    "transaction_date",
    "branch_name",
    "source_type",
    "source_id",
    "source_ref",
    "payment_method_id",
    "gross_amount",
    "discount_amount",
    "tax_amount",
    "service_charge_amount",
    "net_amount",
    "currency",
    "status",
    "journal_id",
];

/// `export:pos_aggregates`: writes the selected transactions as CSV.
#[derive(Clone)]
pub struct PosAggregatesExportProcessor {
    repo: Arc<dyn JournalRepository>,
    temp: TempFileManager,
}

impl std::fmt::Debug for PosAggregatesExportProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PosAggregatesExportProcessor")
            .field("temp", &self.temp)
            .finish_non_exhaustive()
    }
}

impl PosAggregatesExportProcessor {
    pub fn new(repo: Arc<dyn JournalRepository>, temp: TempFileManager) -> Self {
        Self { repo, temp }
    }
}

#[async_trait]
impl Processor for PosAggregatesExportProcessor {
    async fn process(&self, ctx: JobContext) -> Result<ProcessorOutput, ProcessorError> {
        let metadata = parse_metadata(&ctx)?;
        let company_id = job_company(&ctx, &metadata)?;
        ctx.report_progress(10).await;

        let rows = self
            .repo
            .select_transactions(company_id, &metadata.selection())
            .await
            .map_err(|e| ProcessorError::Failed(e.to_string()))?;
        ctx.report_progress(50).await;

        if ctx.is_cancelled() {
            return Err(ProcessorError::Cancelled);
        }

        let csv = render_csv(&rows);
        let file_name = format!("pos_aggregates_{}.csv", chrono::Utc::now().format("%Y%m%d%H%M%S"));
        let path = self.temp.create(ctx.job_id, &file_name, csv.as_bytes()).await?;
        ctx.report_progress(90).await;

        info!(job_id = %ctx.job_id, rows = rows.len(), file = %file_name, "pos aggregates export written");
        Ok(ProcessorOutput::file(path, file_name))
    }
}

fn render_csv(rows: &[AggregatedTransaction]) -> String {
    let mut out = String::new();
    push_record(&mut out, CSV_HEADER.iter().map(|h| h.to_string()));
    for tx in rows {
        push_record(
            &mut out,
            [
                tx.id.to_string(),
                tx.transaction_date.format("%Y-%m-%d").to_string(),
                tx.branch_name.clone().unwrap_or_default(),
                tx.source_type.as_str().to_string(),
                tx.source_id.clone(),
                tx.source_ref.clone(),
                tx.payment_method_id.to_string(),
                tx.gross_amount.to_string(),
                tx.discount_amount.to_string(),
                tx.tax_amount.to_string(),
                tx.service_charge_amount.to_string(),
                tx.net_amount.to_string(),
                tx.currency.clone(),
                tx.status.to_string(),
                tx.journal_id.map(|j| j.to_string()).unwrap_or_default(),
            ],
        );
    }
    out
}

fn push_record(out: &mut String, fields: impl IntoIterator<Item = String>) {
    for (i, field) in fields.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&escape_field(&field));
    }
    out.push_str("\r\n");
}

fn escape_field(field: &str) -> std::borrow::Cow<'_, str> {
    if field.contains([',', '"', '\r', '\n']) {
        std::borrow::Cow::Owned(format!("\"{}\"", field.replace('"', "\"\"")))
    } else {
        std::borrow::Cow::Borrowed(field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{CancellationToken, InMemoryJobStore, Job, JobModule, JobStore, JobType, NewJob};
    use crate::journals::repository::InMemoryJournalRepository;
    use backoffice_accounting::{
        Account, AccountKind, AccountMapping, PaymentMethodAccount, PaymentMethodId, SourceType, TransactionStatus,
    };
    use backoffice_core::{CompanyId, TransactionId, UserId};
    use chrono::NaiveDate;
    use serde_json::json;
    use std::time::Duration;

    fn row(company_id: CompanyId, branch: &str) -> AggregatedTransaction {
        AggregatedTransaction {
            id: TransactionId::new(),
            company_id,
            branch_name: Some(branch.to_string()),
            source_type: SourceType::Pos,
            source_id: "import-1".to_string(),
            source_ref: "B-1".to_string(),
            transaction_date: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
            payment_method_id: PaymentMethodId(1),
            gross_amount: 5_000,
            discount_amount: 0,
            tax_amount: 500,
            service_charge_amount: 0,
            net_amount: 5_500,
            currency: "IDR".to_string(),
            journal_id: None,
            is_reconciled: false,
            status: TransactionStatus::Ready,
            version: 1,
            deleted_at: None,
        }
    }

    async fn context(store: &Arc<InMemoryJobStore>, company_id: CompanyId, module: JobModule, job_type: JobType, metadata: serde_json::Value) -> (Job, JobContext) {
        let job = store
            .create(NewJob::new(UserId::new(), company_id, job_type, module, "pos").with_metadata(metadata))
            .await
            .unwrap();
        let job = store.mark_processing(job.id).await.unwrap();
        let ctx = JobContext::new(&job, store.clone(), CancellationToken::new());
        (job, ctx)
    }

    #[test]
    fn csv_fields_are_quoted_when_needed() {
        assert_eq!(escape_field("plain"), "plain");
        assert_eq!(escape_field("a,b"), "\"a,b\"");
        assert_eq!(escape_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[tokio::test]
    async fn journals_processor_records_import_results_and_progress() {
        let company = CompanyId::new();
        let repo = Arc::new(InMemoryJournalRepository::new());
        repo.set_mapping(
            company,
            AccountMapping::new(Some(Account::new("4101", "POS Sales", AccountKind::Revenue))).with_payment_method(
                PaymentMethodAccount {
                    payment_method_id: PaymentMethodId(1),
                    name: "Cash".to_string(),
                    account: Some(Account::new("1101", "Cash", AccountKind::Asset)),
                    bank_account: None,
                },
            ),
        );
        repo.insert_transaction(row(company, "Main"));
        let store = InMemoryJobStore::arc();
        let (job, ctx) = context(&store, company, JobModule::PosJournals, JobType::Import, json!({ "posImportId": "import-1" })).await;

        let processor = PosJournalsProcessor::new(JournalEngine::new(repo, 50));
        let output = processor.process(ctx).await.unwrap();

        assert!(output.file.is_none());
        let results = output.import_results.unwrap();
        assert_eq!(results["type"], "pos_journals");
        assert_eq!(results["total_journals"], 1);
        assert_eq!(store.get(job.id).await.unwrap().unwrap().progress, 95);
    }

    #[tokio::test]
    async fn journals_processor_rejects_bad_metadata() {
        let store = InMemoryJobStore::arc();
        let (_, ctx) = context(&store, CompanyId::new(), JobModule::PosJournals, JobType::Import, json!({ "transactionIds": "nope" })).await;
        let processor = PosJournalsProcessor::new(JournalEngine::new(Arc::new(InMemoryJournalRepository::new()), 50));

        assert!(matches!(processor.process(ctx).await, Err(ProcessorError::InvalidMetadata(_))));
    }

    #[tokio::test]
    async fn journals_processor_refuses_another_companys_transactions() {
        let own = CompanyId::new();
        let other = CompanyId::new();
        let repo = Arc::new(InMemoryJournalRepository::new());
        repo.set_mapping(
            other,
            AccountMapping::new(Some(Account::new("4101", "POS Sales", AccountKind::Revenue))).with_payment_method(
                PaymentMethodAccount {
                    payment_method_id: PaymentMethodId(1),
                    name: "Cash".to_string(),
                    account: Some(Account::new("1101", "Cash", AccountKind::Asset)),
                    bank_account: None,
                },
            ),
        );
        let theirs = row(other, "Main");
        let theirs_id = theirs.id;
        repo.insert_transaction(theirs);
        let store = InMemoryJobStore::arc();
        let (_, ctx) = context(
            &store,
            own,
            JobModule::PosJournals,
            JobType::Import,
            json!({ "companyId": other.to_string(), "posImportId": "import-1" }),
        )
        .await;

        let processor = PosJournalsProcessor::new(JournalEngine::new(repo.clone(), 50));
        let result = processor.process(ctx).await;

        assert!(matches!(result, Err(ProcessorError::InvalidMetadata(ref m)) if m.contains("does not match")));
        assert_eq!(repo.transaction(theirs_id).unwrap().status, TransactionStatus::Ready);
        assert_eq!(repo.commits_attempted(), 0);
    }

    #[tokio::test]
    async fn aggregates_export_refuses_another_company() {
        let dir = tempfile::tempdir().unwrap();
        let own = CompanyId::new();
        let other = CompanyId::new();
        let repo = Arc::new(InMemoryJournalRepository::new());
        repo.insert_transaction(row(other, "Main"));
        let store = InMemoryJobStore::arc();
        let (job, ctx) = context(
            &store,
            own,
            JobModule::PosAggregates,
            JobType::Export,
            json!({ "companyId": other.to_string() }),
        )
        .await;
        let temp = TempFileManager::new(dir.path(), Duration::from_millis(10)).unwrap();

        let result = PosAggregatesExportProcessor::new(repo, temp.clone()).process(ctx).await;

        assert!(matches!(result, Err(ProcessorError::InvalidMetadata(_))));
        assert!(!temp.job_dir(job.id).exists());
    }

    #[tokio::test]
    async fn aggregates_export_writes_a_csv_staging_file() {
        let dir = tempfile::tempdir().unwrap();
        let company = CompanyId::new();
        let repo = Arc::new(InMemoryJournalRepository::new());
        repo.insert_transaction(row(company, "Main, North"));
        repo.insert_transaction(row(CompanyId::new(), "Elsewhere"));
        let store = InMemoryJobStore::arc();
        let (job, ctx) = context(&store, company, JobModule::PosAggregates, JobType::Export, json!({})).await;
        let temp = TempFileManager::new(dir.path(), Duration::from_millis(10)).unwrap();

        let output = PosAggregatesExportProcessor::new(repo, temp.clone()).process(ctx).await.unwrap();

        let file = output.file.unwrap();
        assert!(file.path.starts_with(temp.job_dir(job.id)));
        let body = tokio::fs::read_to_string(&file.path).await.unwrap();
        let lines: Vec<_> = body.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("id,transaction_date,branch_name"));
        assert!(lines[1].contains("\"Main, North\""));
        assert!(lines[1].contains(",5500,IDR,READY,"));
    }
}

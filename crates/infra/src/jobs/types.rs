//! Core job types and lifecycle rules.

use core::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use backoffice_core::{CompanyId, JobId, UserId};

use super::error::JobError;

/// Longest accepted job name.
pub const MAX_JOB_NAME_LEN: usize = 255;

/// Direction of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Export,
    Import,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Export => "export",
            JobType::Import => "import",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "export" => Ok(JobType::Export),
            "import" => Ok(JobType::Import),
            other => Err(JobError::Validation(format!("unknown job type: {other}"))),
        }
    }
}

/// Business domain a job operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobModule {
    Employees,
    Companies,
    Products,
    PosTransactions,
    PosImports,
    FiscalPeriods,
    ChartOfAccounts,
    AccountingPurposes,
    AccountingPurposeAccounts,
    PaymentMethods,
    Categories,
    SubCategories,
    PosAggregates,
    PosJournals,
    BankStatements,
}

impl JobModule {
    pub const ALL: [JobModule; 15] = [
        JobModule::Employees,
        JobModule::Companies,
        JobModule::Products,
        JobModule::PosTransactions,
        JobModule::PosImports,
        JobModule::FiscalPeriods,
        JobModule::ChartOfAccounts,
        JobModule::AccountingPurposes,
        JobModule::AccountingPurposeAccounts,
        JobModule::PaymentMethods,
        JobModule::Categories,
        JobModule::SubCategories,
        JobModule::PosAggregates,
        JobModule::PosJournals,
        JobModule::BankStatements,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobModule::Employees => "employees",
            JobModule::Companies => "companies",
            JobModule::Products => "products",
            JobModule::PosTransactions => "pos_transactions",
            JobModule::PosImports => "pos_imports",
            JobModule::FiscalPeriods => "fiscal_periods",
            JobModule::ChartOfAccounts => "chart_of_accounts",
            JobModule::AccountingPurposes => "accounting_purposes",
            JobModule::AccountingPurposeAccounts => "accounting_purpose_accounts",
            JobModule::PaymentMethods => "payment_methods",
            JobModule::Categories => "categories",
            JobModule::SubCategories => "sub_categories",
            JobModule::PosAggregates => "pos_aggregates",
            JobModule::PosJournals => "pos_journals",
            JobModule::BankStatements => "bank_statements",
        }
    }
}

impl fmt::Display for JobModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobModule {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobModule::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| JobError::Validation(format!("unknown job module: {s}")))
    }
}

/// Routing key for processors: `(type, module)`. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessorKey {
    pub job_type: JobType,
    pub module: JobModule,
}

impl ProcessorKey {
    pub fn new(job_type: JobType, module: JobModule) -> Self {
        Self { job_type, module }
    }

    pub fn export(module: JobModule) -> Self {
        Self::new(JobType::Export, module)
    }

    pub fn import(module: JobModule) -> Self {
        Self::new(JobType::Import, module)
    }
}

impl fmt::Display for ProcessorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.job_type, self.module)
    }
}

/// Job lifecycle status.
///
/// `pending -> processing -> {completed | failed}`; `pending | processing -> cancelled`.
/// A failed job may be re-armed to `pending` by an explicit retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ACTIVE: [JobStatus; 2] = [JobStatus::Pending, JobStatus::Processing];
    pub const FINISHED: [JobStatus; 3] =
        [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }

    pub fn is_terminal(&self) -> bool {
        Self::FINISHED.contains(self)
    }

    /// Statuses a job may be in for a move to `to` to be legal.
    pub fn allowed_sources(to: JobStatus) -> &'static [JobStatus] {
        match to {
            JobStatus::Pending => &[JobStatus::Failed],
            JobStatus::Processing => &[JobStatus::Pending],
            JobStatus::Completed | JobStatus::Failed => &[JobStatus::Processing],
            JobStatus::Cancelled => &[JobStatus::Pending, JobStatus::Processing],
        }
    }

    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        Self::allowed_sources(to).contains(self)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ]
        .into_iter()
        .find(|status| status.as_str() == s)
        .ok_or_else(|| JobError::Storage(format!("unknown job status in storage: {s}")))
    }
}

/// Clamp an arbitrary progress value into `0..=100`.
pub fn clamp_progress(value: i64) -> u8 {
    value.clamp(0, 100) as u8
}

/// Request to create a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub user_id: UserId,
    pub company_id: CompanyId,
    pub job_type: JobType,
    pub module: JobModule,
    pub name: String,
    /// Processor-specific input; never validated by the queue itself.
    pub metadata: serde_json::Value,
}

impl NewJob {
    pub fn new(
        user_id: UserId,
        company_id: CompanyId,
        job_type: JobType,
        module: JobModule,
        name: impl Into<String>,
    ) -> Self {
        Self {
            user_id,
            company_id,
            job_type,
            module,
            name: name.into(),
            metadata: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn validate(&self) -> Result<(), JobError> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(JobError::Validation("job name must not be empty".to_string()));
        }
        if name.chars().count() > MAX_JOB_NAME_LEN {
            return Err(JobError::Validation(format!(
                "job name must be at most {MAX_JOB_NAME_LEN} characters"
            )));
        }
        Ok(())
    }
}

/// What `mark_completed` records on a job.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct JobCompletion {
    pub result_url: Option<String>,
    pub file_path: Option<String>,
    pub file_size: u64,
    pub expires_at: Option<DateTime<Utc>>,
    /// Merged into the job metadata under `importResults`.
    pub import_results: Option<serde_json::Value>,
}

/// A unit of asynchronous export/import work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub user_id: UserId,
    pub company_id: CompanyId,
    pub job_type: JobType,
    pub module: JobModule,
    pub name: String,
    pub status: JobStatus,
    pub progress: u8,
    pub metadata: serde_json::Value,
    pub result_url: Option<String>,
    pub file_path: Option<String>,
    pub file_size: Option<u64>,
    pub error_message: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_by: Option<UserId>,
    pub updated_by: Option<UserId>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub deleted_by: Option<UserId>,
}

impl Job {
    pub fn from_new(new: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            user_id: new.user_id,
            company_id: new.company_id,
            job_type: new.job_type,
            module: new.module,
            name: new.name.trim().to_string(),
            status: JobStatus::Pending,
            progress: 0,
            metadata: new.metadata,
            result_url: None,
            file_path: None,
            file_size: None,
            error_message: None,
            expires_at: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            created_by: Some(new.user_id),
            updated_by: Some(new.user_id),
            deleted_at: None,
            deleted_by: None,
        }
    }

    pub fn processor_key(&self) -> ProcessorKey {
        ProcessorKey::new(self.job_type, self.module)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Active jobs count against the one-active-job-per-user rule.
    pub fn is_active(&self) -> bool {
        !self.is_deleted() && self.status.is_active()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn check_transition(&self, to: JobStatus) -> Result<(), JobError> {
        if self.is_deleted() {
            return Err(JobError::NotFound(self.id));
        }
        if !self.status.can_transition_to(to) {
            return Err(JobError::InvalidStatus {
                from: self.status,
                to,
            });
        }
        Ok(())
    }

    pub fn mark_processing(&mut self, now: DateTime<Utc>) -> Result<(), JobError> {
        self.check_transition(JobStatus::Processing)?;
        self.status = JobStatus::Processing;
        self.started_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_completed(&mut self, completion: JobCompletion, now: DateTime<Utc>) -> Result<(), JobError> {
        self.check_transition(JobStatus::Completed)?;
        self.status = JobStatus::Completed;
        self.progress = 100;
        self.result_url = completion.result_url;
        self.file_path = completion.file_path;
        self.file_size = Some(completion.file_size);
        self.expires_at = completion.expires_at;
        self.error_message = None;
        self.completed_at = Some(now);
        self.updated_at = now;
        if let Some(results) = completion.import_results {
            merge_import_results(&mut self.metadata, results);
        }
        Ok(())
    }

    pub fn mark_failed(&mut self, message: &str, now: DateTime<Utc>) -> Result<(), JobError> {
        self.check_transition(JobStatus::Failed)?;
        self.status = JobStatus::Failed;
        self.error_message = Some(message.to_string());
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) -> Result<(), JobError> {
        self.check_transition(JobStatus::Cancelled)?;
        self.status = JobStatus::Cancelled;
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Re-arm a failed job for another attempt.
    pub fn reset_to_pending(&mut self, now: DateTime<Utc>) -> Result<(), JobError> {
        self.check_transition(JobStatus::Pending)?;
        self.status = JobStatus::Pending;
        self.progress = 0;
        self.error_message = None;
        self.started_at = None;
        self.completed_at = None;
        self.updated_at = now;
        Ok(())
    }

    /// Progress writes on finished jobs are accepted and ignored.
    pub fn set_progress(&mut self, progress: u8, now: DateTime<Utc>) {
        if self.status.is_active() {
            self.progress = progress.min(100);
            self.updated_at = now;
        }
    }

    pub fn soft_delete(&mut self, by: Option<UserId>, now: DateTime<Utc>) {
        self.deleted_at = Some(now);
        self.deleted_by = by;
        self.updated_at = now;
    }
}

/// Merge processor import results into job metadata under `importResults`.
pub fn merge_import_results(metadata: &mut serde_json::Value, results: serde_json::Value) {
    match metadata {
        serde_json::Value::Object(map) => {
            map.insert("importResults".to_string(), results);
        }
        other => {
            let mut map = serde_json::Map::new();
            if !other.is_null() {
                map.insert("input".to_string(), other.take());
            }
            map.insert("importResults".to_string(), results);
            *other = serde_json::Value::Object(map);
        }
    }
}

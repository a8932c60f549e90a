//! Which aggregated transactions a generation run works on.

use chrono::NaiveDate;
use serde::Deserialize;
use thiserror::Error;

use backoffice_accounting::{AggregatedTransaction, PaymentMethodId, SourceType, TransactionStatus};
use backoffice_core::{CompanyId, TransactionId};

/// Criteria for filter-based selection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionFilter {
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub branch_name: Option<String>,
    pub payment_method_id: Option<PaymentMethodId>,
    pub unreconciled_only: bool,
    pub status: Option<TransactionStatus>,
}

/// How transactions are picked. Soft-deleted rows are never selected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionSelection {
    /// Exactly these rows, whatever their status. Ineligible ones are rejected per row.
    Ids(Vec<TransactionId>),
    /// Rows of one POS import batch.
    ImportBatch {
        pos_import_id: String,
        status: Option<TransactionStatus>,
    },
    Filter(TransactionFilter),
}

impl TransactionSelection {
    /// Statuses considered when the selection filters by status at all.
    pub fn statuses(&self) -> Vec<TransactionStatus> {
        let explicit = match self {
            TransactionSelection::Ids(_) => return TransactionStatus::ALL.to_vec(),
            TransactionSelection::ImportBatch { status, .. } => *status,
            TransactionSelection::Filter(filter) => filter.status,
        };
        explicit.map_or_else(|| TransactionStatus::JOURNAL_DEFAULT.to_vec(), |s| vec![s])
    }

    /// Whether `tx` of `company_id` falls in this selection.
    pub fn matches(&self, company_id: CompanyId, tx: &AggregatedTransaction) -> bool {
        if tx.company_id != company_id || tx.is_deleted() {
            return false;
        }
        if !self.statuses().contains(&tx.status) {
            return false;
        }
        match self {
            TransactionSelection::Ids(ids) => ids.contains(&tx.id),
            TransactionSelection::ImportBatch { pos_import_id, .. } => {
                tx.source_type == SourceType::Pos && tx.source_id == *pos_import_id
            }
            TransactionSelection::Filter(f) => {
                f.date_from.is_none_or(|d| tx.transaction_date >= d)
                    && f.date_to.is_none_or(|d| tx.transaction_date <= d)
                    && f
                        .branch_name
                        .as_deref()
                        .is_none_or(|b| tx.branch_name.as_deref() == Some(b))
                    && f.payment_method_id.is_none_or(|p| tx.payment_method_id == p)
                    && (!f.unreconciled_only || !tx.is_reconciled)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("companyId {named} does not match the job's company {job}")]
pub struct ForeignCompany {
    pub named: CompanyId,
    pub job: CompanyId,
}

/// Input of a `pos_journals` / `pos_aggregates` job, as found in job metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct JournalJobMetadata {
    #[serde(rename = "companyId")]
    pub company_id: Option<CompanyId>,
    #[serde(rename = "transactionIds", default)]
    pub transaction_ids: Vec<TransactionId>,
    #[serde(rename = "posImportId")]
    pub pos_import_id: Option<String>,
    pub status: Option<TransactionStatus>,
    pub transaction_date_from: Option<NaiveDate>,
    pub transaction_date_to: Option<NaiveDate>,
    pub branch_name: Option<String>,
    pub payment_method_id: Option<PaymentMethodId>,
    #[serde(default)]
    pub include_unreconciled_only: bool,
}

impl JournalJobMetadata {
    pub fn from_value(value: &serde_json::Value) -> Result<Self, serde_json::Error> {
        if value.is_null() {
            return Ok(Self::default());
        }
        Self::deserialize(value)
    }

    /// Explicit ids win over an import batch, which wins over filters.
    pub fn selection(&self) -> TransactionSelection {
        if !self.transaction_ids.is_empty() {
            return TransactionSelection::Ids(self.transaction_ids.clone());
        }
        if let Some(pos_import_id) = self.pos_import_id.as_deref().filter(|id| !id.is_empty()) {
            return TransactionSelection::ImportBatch {
                pos_import_id: pos_import_id.to_string(),
                status: self.status,
            };
        }
        TransactionSelection::Filter(TransactionFilter {
            date_from: self.transaction_date_from,
            date_to: self.transaction_date_to,
            branch_name: self.branch_name.clone().filter(|b| !b.is_empty()),
            payment_method_id: self.payment_method_id,
            unreconciled_only: self.include_unreconciled_only,
            status: self.status,
        })
    }

    /// The company the job runs for, which is always the job's own.
    ///
    /// Metadata may repeat it; naming any other company is rejected.
    pub fn company_scope(&self, job_company: CompanyId) -> Result<CompanyId, ForeignCompany> {
        match self.company_id {
            Some(named) if named != job_company => Err(ForeignCompany {
                named,
                job: job_company,
            }),
            _ => Ok(job_company),
        }
    }
}

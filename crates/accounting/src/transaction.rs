//! Aggregated point-of-sale transactions (input to journal generation).

use core::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use backoffice_core::{CompanyId, DomainError, JournalId, TransactionId};

/// Lifecycle status of an aggregated transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Ready,
    Pending,
    Processing,
    Completed,
    Cancelled,
    Failed,
}

impl TransactionStatus {
    pub const ALL: [TransactionStatus; 6] = [
        TransactionStatus::Ready,
        TransactionStatus::Pending,
        TransactionStatus::Processing,
        TransactionStatus::Completed,
        TransactionStatus::Cancelled,
        TransactionStatus::Failed,
    ];

    /// Statuses selected by journal generation when the caller does not specify one.
    pub const JOURNAL_DEFAULT: [TransactionStatus; 2] =
        [TransactionStatus::Ready, TransactionStatus::Processing];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Ready => "READY",
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Processing => "PROCESSING",
            TransactionStatus::Completed => "COMPLETED",
            TransactionStatus::Cancelled => "CANCELLED",
            TransactionStatus::Failed => "FAILED",
        }
    }
}

impl core::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TransactionStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| DomainError::validation(format!("unknown transaction status: {s}")))
    }
}

/// Upstream system that produced the aggregated row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceType {
    Pos,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Pos => "POS",
        }
    }
}

impl FromStr for SourceType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "POS" => Ok(SourceType::Pos),
            other => Err(DomainError::validation(format!("unknown source type: {other}"))),
        }
    }
}

/// Payment method reference (integer key in the payment method master data).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaymentMethodId(pub i64);

impl core::fmt::Display for PaymentMethodId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A summarized point-of-sale sale awaiting conversion into a journal posting.
///
/// Amounts are in the smallest currency unit. Journal generation only ever
/// touches `status`, `journal_id` and `version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatedTransaction {
    pub id: TransactionId,
    pub company_id: CompanyId,
    pub branch_name: Option<String>,
    pub source_type: SourceType,
    /// Parent import batch.
    pub source_id: String,
    /// Bill number in the source system.
    pub source_ref: String,
    pub transaction_date: NaiveDate,
    pub payment_method_id: PaymentMethodId,
    pub gross_amount: i64,
    pub discount_amount: i64,
    pub tax_amount: i64,
    pub service_charge_amount: i64,
    pub net_amount: i64,
    pub currency: String,
    pub journal_id: Option<JournalId>,
    pub is_reconciled: bool,
    pub status: TransactionStatus,
    pub version: u64,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl AggregatedTransaction {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Net amount implied by the components: gross + tax + service - discount.
    pub fn expected_net(&self) -> i128 {
        self.gross_amount as i128 + self.tax_amount as i128 + self.service_charge_amount as i128
            - self.discount_amount as i128
    }

    /// Branch label used in journal numbers and descriptions.
    pub fn branch_label(&self) -> &str {
        self.branch_name
            .as_deref()
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .unwrap_or("Unknown")
    }

    /// Why this row cannot be journalled, if anything.
    pub fn ineligibility(&self) -> Option<String> {
        if self.is_deleted() {
            return Some("transaction is deleted".to_string());
        }
        if let Some(journal_id) = self.journal_id {
            return Some(format!("transaction already linked to journal {journal_id}"));
        }
        if !TransactionStatus::JOURNAL_DEFAULT.contains(&self.status) {
            return Some(format!("status {} is not eligible for journal generation", self.status));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AggregatedTransaction {
        AggregatedTransaction {
            id: TransactionId::new(),
            company_id: CompanyId::new(),
            branch_name: Some("  Main Store ".to_string()),
            source_type: SourceType::Pos,
            source_id: "import-1".to_string(),
            source_ref: "B-001".to_string(),
            transaction_date: NaiveDate::from_ymd_opt(2025, 3, 14).unwrap(),
            payment_method_id: PaymentMethodId(1),
            gross_amount: 10_000,
            discount_amount: 500,
            tax_amount: 1_000,
            service_charge_amount: 250,
            net_amount: 10_750,
            currency: "IDR".to_string(),
            journal_id: None,
            is_reconciled: false,
            status: TransactionStatus::Ready,
            version: 1,
            deleted_at: None,
        }
    }

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("ready".parse::<TransactionStatus>().unwrap(), TransactionStatus::Ready);
        assert_eq!(
            "PROCESSING".parse::<TransactionStatus>().unwrap(),
            TransactionStatus::Processing
        );
        assert!("POSTED".parse::<TransactionStatus>().is_err());
    }

    #[test]
    fn expected_net_matches_components() {
        let tx = sample();
        assert_eq!(tx.expected_net(), tx.net_amount as i128);
        assert_eq!(tx.branch_label(), "Main Store");
    }

    #[test]
    fn linked_or_completed_rows_are_ineligible() {
        let mut tx = sample();
        assert!(tx.ineligibility().is_none());

        tx.status = TransactionStatus::Completed;
        assert!(tx.ineligibility().unwrap().contains("COMPLETED"));

        tx.status = TransactionStatus::Ready;
        tx.journal_id = Some(JournalId::new());
        assert!(tx.ineligibility().unwrap().contains("already linked"));
    }
}

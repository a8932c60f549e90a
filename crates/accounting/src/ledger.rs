use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use backoffice_core::{CompanyId, DomainError, DomainResult, TransactionId};

/// High-level account kind (determines normal balance side).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountKind {
    Asset,
    Liability,
    Equity,
    Revenue,
    Expense,
}

/// Chart-of-accounts entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub code: String, // e.g. "1101"
    pub name: String, // e.g. "Cash on hand"
    pub kind: AccountKind,
}

impl Account {
    pub fn new(code: impl Into<String>, name: impl Into<String>, kind: AccountKind) -> Self {
        Self {
            id: Uuid::now_v7(),
            code: code.into(),
            name: name.into(),
            kind,
        }
    }
}

/// One side of a journal entry (immutable).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntryLine {
    pub account: Account,
    /// Positive amount in smallest unit (e.g., cents).
    pub amount: i64,
    /// true = debit, false = credit.
    pub is_debit: bool,
    pub description: String,
}

impl JournalEntryLine {
    pub fn debit(account: &Account, amount: i64, description: impl Into<String>) -> Self {
        Self {
            account: account.clone(),
            amount,
            is_debit: true,
            description: description.into(),
        }
    }

    pub fn credit(account: &Account, amount: i64, description: impl Into<String>) -> Self {
        Self {
            account: account.clone(),
            amount,
            is_debit: false,
            description: description.into(),
        }
    }
}

/// A balanced journal entry derived from one aggregated transaction,
/// ready to be written by the journal repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalPosting {
    pub company_id: CompanyId,
    pub transaction_id: TransactionId,
    /// Version of the source row when the posting was built.
    pub source_version: u64,
    pub journal_number: String,
    pub journal_date: NaiveDate,
    /// Accounting period, `YYYY-MM`.
    pub period: String,
    pub branch_name: String,
    pub description: String,
    pub currency: String,
    pub lines: Vec<JournalEntryLine>,
}

impl JournalPosting {
    pub fn total_debits(&self) -> i128 {
        self.lines
            .iter()
            .filter(|l| l.is_debit)
            .map(|l| l.amount as i128)
            .sum()
    }

    pub fn total_credits(&self) -> i128 {
        self.lines
            .iter()
            .filter(|l| !l.is_debit)
            .map(|l| l.amount as i128)
            .sum()
    }

    /// Enforce the double-entry invariants: at least one leg on each side,
    /// positive amounts, debits equal credits.
    pub fn validate(&self) -> DomainResult<()> {
        if self.lines.is_empty() {
            return Err(DomainError::validation("journal entry must have lines"));
        }

        let mut debit_total: i128 = 0;
        let mut credit_total: i128 = 0;
        let mut debit_legs = 0usize;
        let mut credit_legs = 0usize;

        for line in &self.lines {
            if line.amount <= 0 {
                return Err(DomainError::validation("amount must be positive"));
            }
            if line.is_debit {
                debit_total += line.amount as i128;
                debit_legs += 1;
            } else {
                credit_total += line.amount as i128;
                credit_legs += 1;
            }
        }

        if debit_legs == 0 || credit_legs == 0 {
            return Err(DomainError::invariant(
                "journal entry needs at least one debit and one credit",
            ));
        }

        if debit_total != credit_total {
            return Err(DomainError::invariant("debits must equal credits"));
        }

        Ok(())
    }
}

//! Building balanced postings from aggregated transactions.

use thiserror::Error;

use crate::ledger::{JournalEntryLine, JournalPosting};
use crate::mapping::AccountMapping;
use crate::transaction::{AggregatedTransaction, PaymentMethodId};

/// Why a single transaction did not produce a journal.
///
/// Rejections are per-row: they are collected into the run result and never
/// abort a generation run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PostingRejection {
    #[error("no ledger account mapped for payment method {payment_method_id}")]
    MissingAccountMapping { payment_method_id: PaymentMethodId },

    #[error("sales revenue account is not configured")]
    MissingSalesAccount,

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("not eligible: {0}")]
    NotEligible(String),

    #[error("transaction was modified concurrently (expected version {expected})")]
    VersionConflict { expected: u64 },

    #[error("unbalanced posting: {0}")]
    Unbalanced(String),
}

impl PostingRejection {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            PostingRejection::MissingAccountMapping { .. } => "missing_account_mapping",
            PostingRejection::MissingSalesAccount => "missing_sales_account",
            PostingRejection::InvalidAmount(_) => "invalid_amount",
            PostingRejection::NotEligible(_) => "not_eligible",
            PostingRejection::VersionConflict { .. } => "version_conflict",
            PostingRejection::Unbalanced(_) => "unbalanced",
        }
    }
}

/// Journal number for a transaction: `POS-{BRANCH}-{YYYY-MM-DD}-{bill}`.
pub fn journal_number(tx: &AggregatedTransaction) -> String {
    let branch = tx
        .branch_label()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
        .to_uppercase();
    format!(
        "POS-{}-{}-{}",
        branch,
        tx.transaction_date.format("%Y-%m-%d"),
        tx.source_ref.trim()
    )
}

fn check_amounts(tx: &AggregatedTransaction) -> Result<(), PostingRejection> {
    let components = [
        ("gross", tx.gross_amount),
        ("discount", tx.discount_amount),
        ("tax", tx.tax_amount),
        ("service charge", tx.service_charge_amount),
    ];
    if let Some((name, value)) = components.iter().find(|(_, v)| *v < 0) {
        return Err(PostingRejection::InvalidAmount(format!(
            "{name} amount is negative ({value})"
        )));
    }
    if tx.net_amount <= 0 {
        return Err(PostingRejection::InvalidAmount(format!(
            "net amount must be positive ({})",
            tx.net_amount
        )));
    }
    if tx.expected_net() != tx.net_amount as i128 {
        return Err(PostingRejection::InvalidAmount(format!(
            "net amount {} does not equal gross + tax + service - discount ({})",
            tx.net_amount,
            tx.expected_net()
        )));
    }
    Ok(())
}

/// Build the balanced posting for one transaction.
///
/// Legs:
/// - debit the payment method's account with the net amount
/// - debit the discount account with the discount (when configured)
/// - credit tax payable / service charge (when configured)
/// - credit sales revenue with the remainder
pub fn build_posting(
    tx: &AggregatedTransaction,
    mapping: &AccountMapping,
) -> Result<JournalPosting, PostingRejection> {
    if let Some(reason) = tx.ineligibility() {
        return Err(PostingRejection::NotEligible(reason));
    }
    check_amounts(tx)?;

    let revenue_account = mapping
        .sales_revenue()
        .ok_or(PostingRejection::MissingSalesAccount)?;
    let debit_account =
        mapping
            .debit_account(tx.payment_method_id)
            .ok_or(PostingRejection::MissingAccountMapping {
                payment_method_id: tx.payment_method_id,
            })?;
    let payment_name = mapping
        .payment_method(tx.payment_method_id)
        .map(|pm| pm.name.as_str())
        .filter(|name| !name.is_empty())
        .unwrap_or("Payment");

    let mut lines = vec![JournalEntryLine::debit(
        debit_account,
        tx.net_amount,
        format!("POS Sales - {payment_name}"),
    )];
    let mut revenue: i128 = tx.gross_amount as i128;

    if tx.discount_amount > 0 {
        match mapping.sales_discount() {
            Some(account) => lines.push(JournalEntryLine::debit(
                account,
                tx.discount_amount,
                "POS Sales Discount",
            )),
            None => revenue -= tx.discount_amount as i128,
        }
    }
    if tx.tax_amount > 0 {
        match mapping.tax_payable() {
            Some(account) => {
                lines.push(JournalEntryLine::credit(account, tx.tax_amount, "POS Sales Tax"))
            }
            None => revenue += tx.tax_amount as i128,
        }
    }
    if tx.service_charge_amount > 0 {
        match mapping.service_charge() {
            Some(account) => lines.push(JournalEntryLine::credit(
                account,
                tx.service_charge_amount,
                "POS Service Charge",
            )),
            None => revenue += tx.service_charge_amount as i128,
        }
    }

    if revenue < 0 {
        return Err(PostingRejection::InvalidAmount(format!(
            "discount exceeds recognisable revenue ({revenue})"
        )));
    }
    if revenue > 0 {
        let revenue = i64::try_from(revenue).map_err(|_| {
            PostingRejection::InvalidAmount("revenue amount overflows".to_string())
        })?;
        lines.push(JournalEntryLine::credit(revenue_account, revenue, "POS Sales Revenue"));
    }

    let branch = tx.branch_label().to_string();
    let date = tx.transaction_date;
    let posting = JournalPosting {
        company_id: tx.company_id,
        transaction_id: tx.id,
        source_version: tx.version,
        journal_number: journal_number(tx),
        journal_date: date,
        period: date.format("%Y-%m").to_string(),
        description: format!("POS Sales {} - {}", date.format("%Y-%m-%d"), branch),
        branch_name: branch,
        currency: tx.currency.clone(),
        lines,
    };

    posting
        .validate()
        .map_err(|e| PostingRejection::Unbalanced(e.to_string()))?;
    Ok(posting)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{Account, AccountKind};
    use crate::mapping::PaymentMethodAccount;
    use crate::transaction::{SourceType, TransactionStatus};
    use backoffice_core::{CompanyId, TransactionId};
    use chrono::NaiveDate;
    use proptest::prelude::*;

    fn tx(gross: i64, discount: i64, tax: i64, service: i64) -> AggregatedTransaction {
        AggregatedTransaction {
            id: TransactionId::new(),
            company_id: CompanyId::new(),
            branch_name: Some("Grand Mall".to_string()),
            source_type: SourceType::Pos,
            source_id: "import-1".to_string(),
            source_ref: "B-0042".to_string(),
            transaction_date: NaiveDate::from_ymd_opt(2025, 2, 3).unwrap(),
            payment_method_id: PaymentMethodId(1),
            gross_amount: gross,
            discount_amount: discount,
            tax_amount: tax,
            service_charge_amount: service,
            net_amount: gross + tax + service - discount,
            currency: "IDR".to_string(),
            journal_id: None,
            is_reconciled: false,
            status: TransactionStatus::Ready,
            version: 1,
            deleted_at: None,
        }
    }

    fn cash_mapping() -> AccountMapping {
        AccountMapping::new(Some(Account::new("4100", "Sales", AccountKind::Revenue)))
            .with_payment_method(PaymentMethodAccount {
                payment_method_id: PaymentMethodId(1),
                name: "Cash".to_string(),
                account: Some(Account::new("1101", "Cash", AccountKind::Asset)),
                bank_account: None,
            })
    }

    #[test]
    fn minimal_mapping_produces_two_legs() {
        let posting = build_posting(&tx(10_000, 500, 1_000, 250), &cash_mapping()).unwrap();

        assert_eq!(posting.lines.len(), 2);
        assert_eq!(posting.total_debits(), 10_750);
        assert_eq!(posting.total_credits(), 10_750);
        assert_eq!(posting.journal_number, "POS-GRAND-MALL-2025-02-03-B-0042");
        assert_eq!(posting.period, "2025-02");
    }

    #[test]
    fn configured_accounts_get_their_own_legs() {
        let mapping = cash_mapping()
            .with_tax_account(Account::new("2130", "VAT payable", AccountKind::Liability))
            .with_service_charge_account(Account::new("4200", "Service", AccountKind::Revenue))
            .with_discount_account(Account::new("4900", "Discount", AccountKind::Expense));

        let posting = build_posting(&tx(10_000, 500, 1_000, 250), &mapping).unwrap();

        assert_eq!(posting.lines.len(), 5);
        let revenue = posting
            .lines
            .iter()
            .find(|l| l.account.code == "4100")
            .unwrap();
        assert_eq!(revenue.amount, 10_000);
        assert!(posting.validate().is_ok());
    }

    #[test]
    fn unmapped_payment_method_is_rejected() {
        let mut t = tx(1_000, 0, 0, 0);
        t.payment_method_id = PaymentMethodId(99);

        let err = build_posting(&t, &cash_mapping()).unwrap_err();
        assert_eq!(
            err,
            PostingRejection::MissingAccountMapping {
                payment_method_id: PaymentMethodId(99)
            }
        );
    }

    #[test]
    fn inconsistent_net_is_rejected() {
        let mut t = tx(1_000, 0, 100, 0);
        t.net_amount = 1_000;
        assert!(matches!(
            build_posting(&t, &cash_mapping()),
            Err(PostingRejection::InvalidAmount(_))
        ));
    }

    #[test]
    fn zero_net_is_rejected() {
        let t = tx(0, 0, 0, 0);
        assert_eq!(
            build_posting(&t, &cash_mapping()).unwrap_err().code(),
            "invalid_amount"
        );
    }

    #[test]
    fn missing_sales_account_is_reported() {
        let mapping = AccountMapping::new(None).with_payment_method(PaymentMethodAccount {
            payment_method_id: PaymentMethodId(1),
            name: "Cash".to_string(),
            account: Some(Account::new("1101", "Cash", AccountKind::Asset)),
            bank_account: None,
        });
        assert_eq!(
            build_posting(&tx(100, 0, 0, 0), &mapping).unwrap_err(),
            PostingRejection::MissingSalesAccount
        );
    }

    proptest! {
        #[test]
        fn postings_always_balance(
            gross in 0i64..10_000_000,
            discount in 0i64..1_000_000,
            tax in 0i64..1_000_000,
            service in 0i64..1_000_000,
            split_accounts in any::<bool>(),
        ) {
            let mut mapping = cash_mapping();
            if split_accounts {
                mapping = mapping
                    .with_tax_account(Account::new("2130", "VAT", AccountKind::Liability))
                    .with_service_charge_account(Account::new("4200", "Service", AccountKind::Revenue))
                    .with_discount_account(Account::new("4900", "Discount", AccountKind::Expense));
            }

            if let Ok(posting) = build_posting(&tx(gross, discount, tax, service), &mapping) {
                prop_assert_eq!(posting.total_debits(), posting.total_credits());
                prop_assert!(posting.lines.iter().all(|l| l.amount > 0));
            }
        }
    }
}

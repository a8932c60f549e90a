//! Postgres-backed journal repository.
//!
//! ## Chunk commits
//!
//! `commit_chunk` runs in one transaction. For every posting the source row is
//! claimed first with a version-guarded `UPDATE`; a row that no longer matches
//! is reported as a conflict and nothing is written for it. The header and its
//! lines are inserted only after the claim succeeded. The foreign key from
//! `aggregated_transactions.journal_id` is deferred to commit time.
//!
//! ## Account resolution
//!
//! Company-level accounts come from accounting purposes (first active account
//! by priority on the expected side):
//!
//! | Purpose | Side | Use |
//! |---------|------|-----|
//! | `SAL-INV` | CREDIT | sales revenue (mandatory) |
//! | `SAL-TAX` | CREDIT | tax payable |
//! | `SAL-SVC` | CREDIT | service charge |
//! | `SAL-DISC` | DEBIT | sales discount |

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument, Span};

use backoffice_accounting::{
    Account, AccountKind, AccountMapping, AggregatedTransaction, JournalPosting, PaymentMethodAccount,
    PaymentMethodId,
};
use backoffice_core::{CompanyId, JournalId, TransactionId};

use super::repository::{ChunkCommit, CreatedJournal, JournalRepository, JournalStoreError};
use super::selection::TransactionSelection;

pub const SALES_PURPOSE: &str = "SAL-INV";
pub const TAX_PURPOSE: &str = "SAL-TAX";
pub const SERVICE_CHARGE_PURPOSE: &str = "SAL-SVC";
pub const DISCOUNT_PURPOSE: &str = "SAL-DISC";

const TRANSACTION_COLUMNS: &str = r#"
    id, company_id, branch_name, source_type, source_id, source_ref, transaction_date,
    payment_method_id, gross_amount, discount_amount, tax_amount, service_charge_amount,
    net_amount, currency, journal_id, is_reconciled, status, version, deleted_at
"#;

#[derive(Debug, Clone)]
pub struct PostgresJournalRepository {
    pool: Arc<PgPool>,
}

impl PostgresJournalRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    async fn load_purpose_accounts(&self, company_id: CompanyId) -> Result<Vec<(String, Account)>, JournalStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT p.purpose_code, c.id, c.account_code, c.account_name, c.account_type
            FROM accounting_purposes p
            JOIN accounting_purpose_accounts pa ON pa.purpose_id = p.id
            JOIN chart_of_accounts c ON c.id = pa.account_id
            WHERE p.company_id = $1
              AND p.purpose_code = ANY($2)
              AND p.is_active
              AND pa.is_active
              AND c.deleted_at IS NULL
              AND pa.side = CASE WHEN p.purpose_code = $3 THEN 'DEBIT' ELSE 'CREDIT' END
            ORDER BY p.purpose_code, pa.priority ASC
            "#,
        )
        .bind(company_id.as_uuid())
        .bind(vec![
            SALES_PURPOSE.to_string(),
            TAX_PURPOSE.to_string(),
            SERVICE_CHARGE_PURPOSE.to_string(),
            DISCOUNT_PURPOSE.to_string(),
        ])
        .bind(DISCOUNT_PURPOSE)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_purpose_accounts", e))?;

        rows.iter()
            .map(|row| {
                let purpose: String = row.try_get("purpose_code").map_err(|e| decode_error("purpose", e))?;
                let account = AccountRow::from_row(row).map_err(|e| decode_error("account", e))?;
                Ok((purpose, account.try_into()?))
            })
            .collect()
    }

    async fn load_payment_methods(
        &self,
        company_id: CompanyId,
        payment_methods: &[PaymentMethodId],
    ) -> Result<Vec<PaymentMethodAccount>, JournalStoreError> {
        let ids: Vec<i64> = payment_methods.iter().map(|p| p.0).collect();
        let rows = sqlx::query(
            r#"
            SELECT
                pm.id AS payment_method_id,
                pm.name AS payment_method_name,
                a.id AS account_id,
                a.account_code AS account_code,
                a.account_name AS account_name,
                a.account_type AS account_type,
                b.id AS bank_account_id,
                b.account_code AS bank_account_code,
                b.account_name AS bank_account_name,
                b.account_type AS bank_account_type
            FROM payment_methods pm
            LEFT JOIN chart_of_accounts a ON a.id = pm.coa_account_id AND a.deleted_at IS NULL
            LEFT JOIN bank_accounts ba ON ba.id = pm.bank_account_id
            LEFT JOIN chart_of_accounts b ON b.id = ba.coa_account_id AND b.deleted_at IS NULL
            WHERE pm.company_id = $1 AND pm.id = ANY($2)
            "#,
        )
        .bind(company_id.as_uuid())
        .bind(ids)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_payment_methods", e))?;

        rows.iter()
            .map(|row| {
                PaymentMethodRow::from_row(row)
                    .map_err(|e| decode_error("payment method", e))?
                    .try_into()
            })
            .collect()
    }
}

#[async_trait]
impl JournalRepository for PostgresJournalRepository {
    #[instrument(skip(self, selection), fields(company_id = %company_id, selected = tracing::field::Empty), err)]
    async fn select_transactions(
        &self,
        company_id: CompanyId,
        selection: &TransactionSelection,
    ) -> Result<Vec<AggregatedTransaction>, JournalStoreError> {
        let statuses: Vec<String> = selection.statuses().iter().map(|s| s.as_str().to_string()).collect();
        let mut ids: Option<Vec<uuid::Uuid>> = None;
        let mut import_id: Option<&str> = None;
        let mut filter = None;
        match selection {
            TransactionSelection::Ids(list) => ids = Some(list.iter().map(|id| *id.as_uuid()).collect()),
            TransactionSelection::ImportBatch { pos_import_id, .. } => import_id = Some(pos_import_id.as_str()),
            TransactionSelection::Filter(f) => filter = Some(f),
        }

        let sql = format!(
            r#"
            SELECT {TRANSACTION_COLUMNS}
            FROM aggregated_transactions
            WHERE company_id = $1
              AND deleted_at IS NULL
              AND status = ANY($2)
              AND ($3::uuid[] IS NULL OR id = ANY($3))
              AND ($4::text IS NULL OR (source_type = 'POS' AND source_id = $4))
              AND ($5::date IS NULL OR transaction_date >= $5)
              AND ($6::date IS NULL OR transaction_date <= $6)
              AND ($7::text IS NULL OR branch_name = $7)
              AND ($8::bigint IS NULL OR payment_method_id = $8)
              AND (NOT $9 OR is_reconciled = FALSE)
            ORDER BY transaction_date ASC, source_ref ASC, id ASC
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(company_id.as_uuid())
            .bind(statuses)
            .bind(ids)
            .bind(import_id)
            .bind(filter.and_then(|f| f.date_from))
            .bind(filter.and_then(|f| f.date_to))
            .bind(filter.and_then(|f| f.branch_name.as_deref()))
            .bind(filter.and_then(|f| f.payment_method_id).map(|p| p.0))
            .bind(filter.is_some_and(|f| f.unreconciled_only))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("select_transactions", e))?;

        let transactions = rows
            .iter()
            .map(|row| {
                TransactionRow::from_row(row)
                    .map_err(|e| decode_error("aggregated transaction", e))?
                    .try_into()
            })
            .collect::<Result<Vec<_>, _>>()?;
        Span::current().record("selected", transactions.len());
        Ok(transactions)
    }

    #[instrument(skip(self, payment_methods), fields(company_id = %company_id, payment_methods = payment_methods.len()), err)]
    async fn load_account_mapping(
        &self,
        company_id: CompanyId,
        payment_methods: &[PaymentMethodId],
    ) -> Result<AccountMapping, JournalStoreError> {
        let purposes = self.load_purpose_accounts(company_id).await?;
        let first = |code: &str| {
            purposes
                .iter()
                .find(|(purpose, _)| purpose == code)
                .map(|(_, account)| account.clone())
        };

        let mut mapping = AccountMapping::new(first(SALES_PURPOSE));
        if let Some(account) = first(TAX_PURPOSE) {
            mapping = mapping.with_tax_account(account);
        }
        if let Some(account) = first(SERVICE_CHARGE_PURPOSE) {
            mapping = mapping.with_service_charge_account(account);
        }
        if let Some(account) = first(DISCOUNT_PURPOSE) {
            mapping = mapping.with_discount_account(account);
        }
        for pm in self.load_payment_methods(company_id, payment_methods).await? {
            mapping = mapping.with_payment_method(pm);
        }
        debug!(payment_methods = mapping.payment_method_count(), "account mapping loaded");
        Ok(mapping)
    }

    #[instrument(skip(self, postings), fields(postings = postings.len(), created = tracing::field::Empty), err)]
    async fn commit_chunk(&self, postings: &[JournalPosting]) -> Result<ChunkCommit, JournalStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let mut commit = ChunkCommit::default();
        for posting in postings {
            let journal_id = JournalId::new();
            if !claim_transaction(&mut tx, posting, journal_id).await? {
                commit.conflicts.push(posting.clone());
                continue;
            }
            insert_journal(&mut tx, journal_id, posting).await?;
            commit.created.push(CreatedJournal::from_posting(journal_id, posting));
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Span::current().record("created", commit.created.len());
        Ok(commit)
    }
}

/// Link the source row to `journal_id` if it is still at the posted version.
async fn claim_transaction(
    tx: &mut Transaction<'_, Postgres>,
    posting: &JournalPosting,
    journal_id: JournalId,
) -> Result<bool, JournalStoreError> {
    let result = sqlx::query(
        r#"
        UPDATE aggregated_transactions
        SET status = 'COMPLETED',
            journal_id = $2,
            version = version + 1,
            updated_at = NOW()
        WHERE id = $1
          AND version = $3
          AND journal_id IS NULL
          AND deleted_at IS NULL
        "#,
    )
    .bind(posting.transaction_id.as_uuid())
    .bind(journal_id.as_uuid())
    .bind(posting.source_version as i64)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("claim_transaction", e))?;
    Ok(result.rows_affected() == 1)
}

async fn insert_journal(
    tx: &mut Transaction<'_, Postgres>,
    journal_id: JournalId,
    posting: &JournalPosting,
) -> Result<(), JournalStoreError> {
    let total = i64::try_from(posting.total_debits())
        .map_err(|_| JournalStoreError::Storage(format!("journal {} total overflows", posting.journal_number)))?;

    sqlx::query(
        r#"
        INSERT INTO journal_headers (
            id, company_id, journal_number, journal_type, journal_date, period,
            branch_name, description, currency, total_amount, source_module,
            source_transaction_id, status
        )
        VALUES ($1, $2, $3, 'CASH', $4, $5, $6, $7, $8, $9, 'POS_AGGREGATES', $10, 'POSTED')
        "#,
    )
    .bind(journal_id.as_uuid())
    .bind(posting.company_id.as_uuid())
    .bind(&posting.journal_number)
    .bind(posting.journal_date)
    .bind(&posting.period)
    .bind(&posting.branch_name)
    .bind(&posting.description)
    .bind(&posting.currency)
    .bind(total)
    .bind(posting.transaction_id.as_uuid())
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("insert_journal_header", e))?;

    for (index, line) in posting.lines.iter().enumerate() {
        let (debit, credit) = if line.is_debit { (line.amount, 0) } else { (0, line.amount) };
        sqlx::query(
            r#"
            INSERT INTO journal_lines (
                id, journal_header_id, line_number, account_id, description, debit_amount, credit_amount
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(journal_id.as_uuid())
        .bind(index as i32 + 1)
        .bind(line.account.id)
        .bind(&line.description)
        .bind(debit)
        .bind(credit)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("insert_journal_line", e))?;
    }
    Ok(())
}

fn parse_account_kind(value: &str) -> Result<AccountKind, JournalStoreError> {
    match value.to_ascii_uppercase().as_str() {
        "ASSET" => Ok(AccountKind::Asset),
        "LIABILITY" => Ok(AccountKind::Liability),
        "EQUITY" => Ok(AccountKind::Equity),
        "REVENUE" | "INCOME" => Ok(AccountKind::Revenue),
        "EXPENSE" => Ok(AccountKind::Expense),
        other => Err(JournalStoreError::Decode {
            entity: "account",
            message: format!("unknown account type {other}"),
        }),
    }
}

fn decode_error(entity: &'static str, err: sqlx::Error) -> JournalStoreError {
    JournalStoreError::Decode {
        entity,
        message: err.to_string(),
    }
}

/// SQLSTATE classes worth repeating: connection exceptions, serialization
/// failures, deadlocks.
fn is_transient_sqlstate(code: &str) -> bool {
    code.starts_with("08") || code == "40001" || code == "40P01"
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JournalStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
            let message = format!("database error in {operation} ({code}): {}", db_err.message());
            if is_transient_sqlstate(&code) {
                JournalStoreError::Transient(message)
            } else {
                JournalStoreError::Storage(message)
            }
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::WorkerCrashed => {
            JournalStoreError::Transient(format!("sqlx error in {operation}: {err}"))
        }
        sqlx::Error::PoolClosed => JournalStoreError::Storage(format!("connection pool closed in {operation}")),
        _ => JournalStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

// SQLx row types

#[derive(Debug)]
struct AccountRow {
    id: uuid::Uuid,
    code: String,
    name: String,
    kind: String,
}

impl<'r> sqlx::FromRow<'r, PgRow> for AccountRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(AccountRow {
            id: row.try_get("id")?,
            code: row.try_get("account_code")?,
            name: row.try_get("account_name")?,
            kind: row.try_get("account_type")?,
        })
    }
}

impl TryFrom<AccountRow> for Account {
    type Error = JournalStoreError;

    fn try_from(row: AccountRow) -> Result<Self, Self::Error> {
        Ok(Account {
            id: row.id,
            code: row.code,
            name: row.name,
            kind: parse_account_kind(&row.kind)?,
        })
    }
}

#[derive(Debug)]
struct PaymentMethodRow {
    id: i64,
    name: String,
    account: Option<AccountRow>,
    bank_account: Option<AccountRow>,
}

fn optional_account(row: &PgRow, prefix: &str) -> Result<Option<AccountRow>, sqlx::Error> {
    let id: Option<uuid::Uuid> = row.try_get(format!("{prefix}_id").as_str())?;
    let Some(id) = id else {
        return Ok(None);
    };
    Ok(Some(AccountRow {
        id,
        code: row.try_get(format!("{prefix}_code").as_str())?,
        name: row.try_get(format!("{prefix}_name").as_str())?,
        kind: row.try_get(format!("{prefix}_type").as_str())?,
    }))
}

impl<'r> sqlx::FromRow<'r, PgRow> for PaymentMethodRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(PaymentMethodRow {
            id: row.try_get("payment_method_id")?,
            name: row.try_get("payment_method_name")?,
            account: optional_account(row, "account")?,
            bank_account: optional_account(row, "bank_account")?,
        })
    }
}

impl TryFrom<PaymentMethodRow> for PaymentMethodAccount {
    type Error = JournalStoreError;

    fn try_from(row: PaymentMethodRow) -> Result<Self, Self::Error> {
        Ok(PaymentMethodAccount {
            payment_method_id: PaymentMethodId(row.id),
            name: row.name,
            account: row.account.map(Account::try_from).transpose()?,
            bank_account: row.bank_account.map(Account::try_from).transpose()?,
        })
    }
}

#[derive(Debug)]
struct TransactionRow {
    id: uuid::Uuid,
    company_id: uuid::Uuid,
    branch_name: Option<String>,
    source_type: String,
    source_id: String,
    source_ref: String,
    transaction_date: chrono::NaiveDate,
    payment_method_id: i64,
    gross_amount: i64,
    discount_amount: i64,
    tax_amount: i64,
    service_charge_amount: i64,
    net_amount: i64,
    currency: String,
    journal_id: Option<uuid::Uuid>,
    is_reconciled: bool,
    status: String,
    version: i64,
    deleted_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for TransactionRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(TransactionRow {
            id: row.try_get("id")?,
            company_id: row.try_get("company_id")?,
            branch_name: row.try_get("branch_name")?,
            source_type: row.try_get("source_type")?,
            source_id: row.try_get("source_id")?,
            source_ref: row.try_get("source_ref")?,
            transaction_date: row.try_get("transaction_date")?,
            payment_method_id: row.try_get("payment_method_id")?,
            gross_amount: row.try_get("gross_amount")?,
            discount_amount: row.try_get("discount_amount")?,
            tax_amount: row.try_get("tax_amount")?,
            service_charge_amount: row.try_get("service_charge_amount")?,
            net_amount: row.try_get("net_amount")?,
            currency: row.try_get("currency")?,
            journal_id: row.try_get("journal_id")?,
            is_reconciled: row.try_get("is_reconciled")?,
            status: row.try_get("status")?,
            version: row.try_get("version")?,
            deleted_at: row.try_get("deleted_at")?,
        })
    }
}

impl TryFrom<TransactionRow> for AggregatedTransaction {
    type Error = JournalStoreError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        let decode = |message: String| JournalStoreError::Decode {
            entity: "aggregated transaction",
            message,
        };
        Ok(AggregatedTransaction {
            id: TransactionId::from_uuid(row.id),
            company_id: CompanyId::from_uuid(row.company_id),
            branch_name: row.branch_name,
            source_type: row.source_type.parse().map_err(|e| decode(format!("{e}")))?,
            source_id: row.source_id,
            source_ref: row.source_ref,
            transaction_date: row.transaction_date,
            payment_method_id: PaymentMethodId(row.payment_method_id),
            gross_amount: row.gross_amount,
            discount_amount: row.discount_amount,
            tax_amount: row.tax_amount,
            service_charge_amount: row.service_charge_amount,
            net_amount: row.net_amount,
            currency: row.currency,
            journal_id: row.journal_id.map(JournalId::from_uuid),
            is_reconciled: row.is_reconciled,
            status: row.status.parse().map_err(|e| decode(format!("{e}")))?,
            version: u64::try_from(row.version).map_err(|_| decode(format!("negative version {}", row.version)))?,
            deleted_at: row.deleted_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_faults_are_retryable() {
        assert!(map_sqlx_error("commit_chunk", sqlx::Error::PoolTimedOut).is_retryable());
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        assert!(map_sqlx_error("commit_chunk", sqlx::Error::Io(io)).is_retryable());
        assert!(!map_sqlx_error("commit_chunk", sqlx::Error::RowNotFound).is_retryable());
        assert!(!map_sqlx_error("commit_chunk", sqlx::Error::PoolClosed).is_retryable());
    }

    #[test]
    fn serialization_and_connection_sqlstates_are_transient() {
        assert!(is_transient_sqlstate("40001"));
        assert!(is_transient_sqlstate("40P01"));
        assert!(is_transient_sqlstate("08006"));
        assert!(!is_transient_sqlstate("23505"));
    }
}

//! Postgres-backed job store.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobError | Scenario |
//! |------------|----------------------|----------|----------|
//! | Database (unique violation) | `23505` | `AlreadyProcessing` | `jobs_one_active_per_user` rejected a second active job |
//! | Database (other) | Any other | `Storage` | Other database errors |
//! | PoolClosed | N/A | `Storage` | Connection pool was closed |
//! | Other | N/A | `Storage` | Network errors, decode failures, etc. |
//!
//! ## Transitions
//!
//! Status changes lock the row (`SELECT ... FOR UPDATE`), apply the lifecycle
//! rule from [`Job`], and write the row back inside one transaction. Two workers
//! racing for the same pending job serialize on the row lock; the loser sees
//! `processing` and gets `InvalidStatus`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{instrument, Span};

use backoffice_core::{CompanyId, JobId, UserId};

use super::error::JobError;
use super::store::JobStore;
use super::types::{Job, JobCompletion, JobStatus, NewJob};

const JOB_COLUMNS: &str = r#"
    id, user_id, company_id, type, module, name, status, progress, metadata,
    result_url, file_path, file_size, error_message, expires_at,
    created_at, updated_at, started_at, completed_at,
    created_by, updated_by, deleted_at, deleted_by
"#;

#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    async fn fetch_many(&self, operation: &'static str, query: sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>) -> Result<Vec<Job>, JobError> {
        let rows = query
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        rows.iter().map(decode_job).collect()
    }

    /// Lock a live job, apply `apply`, and persist the result.
    async fn transition<F>(
        &self,
        operation: &'static str,
        id: JobId,
        user_id: Option<UserId>,
        apply: F,
    ) -> Result<Job, JobError>
    where
        F: FnOnce(&mut Job, DateTime<Utc>) -> Result<(), JobError> + Send,
    {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let mut job = lock_job(&mut tx, id, user_id).await?.ok_or(JobError::NotFound(id))?;
        apply(&mut job, Utc::now())?;
        write_job(&mut tx, &job, operation).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Span::current().record("status", job.status.as_str());
        Ok(job)
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, new), fields(user_id = %new.user_id, module = %new.module), err)]
    async fn create(&self, new: NewJob) -> Result<Job, JobError> {
        new.validate()?;
        let job = Job::from_new(new, Utc::now());

        let sql = format!(
            r#"
            INSERT INTO jobs (
                id, user_id, company_id, type, module, name, status, progress, metadata,
                created_at, updated_at, created_by, updated_by
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10, $11, $11)
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(job.id.as_uuid())
            .bind(job.user_id.as_uuid())
            .bind(job.company_id.as_uuid())
            .bind(job.job_type.as_str())
            .bind(job.module.as_str())
            .bind(&job.name)
            .bind(job.status.as_str())
            .bind(job.progress as i16)
            .bind(&job.metadata)
            .bind(job.created_at)
            .bind(job.created_by.map(|u| *u.as_uuid()))
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("create_job", e))?;

        decode_job(&row)
    }

    #[instrument(skip(self), fields(job_id = %id, user_id = %user_id), err)]
    async fn find_by_id(&self, id: JobId, user_id: UserId) -> Result<Option<Job>, JobError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 AND user_id = $2 AND deleted_at IS NULL"
        );
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(user_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_job", e))?;
        row.as_ref().map(decode_job).transpose()
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: JobId) -> Result<Option<Job>, JobError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 AND deleted_at IS NULL");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;
        row.as_ref().map(decode_job).transpose()
    }

    #[instrument(skip(self), fields(user_id = %user_id), err)]
    async fn find_recent_by_user(&self, user_id: UserId, limit: usize) -> Result<Vec<Job>, JobError> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE user_id = $1
              AND status IN ('pending', 'processing', 'completed')
              AND deleted_at IS NULL
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#
        );
        self.fetch_many(
            "find_recent_jobs",
            sqlx::query(&sql).bind(user_id.as_uuid()).bind(limit as i64),
        )
        .await
    }

    #[instrument(skip(self), fields(user_id = %user_id), err)]
    async fn has_active_job(&self, user_id: UserId) -> Result<bool, JobError> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM jobs
                WHERE user_id = $1
                  AND status = ANY($2)
                  AND deleted_at IS NULL
            ) AS active
            "#,
        )
        .bind(user_id.as_uuid())
        .bind(status_names(&JobStatus::ACTIVE))
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("has_active_job", e))?;

        row.try_get("active")
            .map_err(|e| JobError::Storage(format!("failed to read active flag: {e}")))
    }

    #[instrument(skip(self), err)]
    async fn find_pending(&self, limit: usize) -> Result<Vec<Job>, JobError> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE status = 'pending' AND deleted_at IS NULL
            ORDER BY created_at ASC
            LIMIT $1
            "#
        );
        self.fetch_many("find_pending_jobs", sqlx::query(&sql).bind(limit as i64))
            .await
    }

    #[instrument(skip(self), fields(job_id = %id, status = tracing::field::Empty), err)]
    async fn mark_processing(&self, id: JobId) -> Result<Job, JobError> {
        self.transition("mark_processing", id, None, |job, now| job.mark_processing(now))
            .await
    }

    #[instrument(skip(self, completion), fields(job_id = %id, status = tracing::field::Empty), err)]
    async fn mark_completed(&self, id: JobId, completion: JobCompletion) -> Result<Job, JobError> {
        self.transition("mark_completed", id, None, move |job, now| {
            job.mark_completed(completion, now)
        })
        .await
    }

    #[instrument(skip(self, message), fields(job_id = %id, status = tracing::field::Empty), err)]
    async fn mark_failed(&self, id: JobId, message: &str) -> Result<Job, JobError> {
        let message = message.to_string();
        self.transition("mark_failed", id, None, move |job, now| job.mark_failed(&message, now))
            .await
    }

    #[instrument(skip(self), fields(job_id = %id, user_id = %user_id, status = tracing::field::Empty), err)]
    async fn mark_cancelled(&self, id: JobId, user_id: UserId) -> Result<Job, JobError> {
        self.transition("mark_cancelled", id, Some(user_id), move |job, now| {
            job.mark_cancelled(now)?;
            job.updated_by = Some(user_id);
            Ok(())
        })
        .await
    }

    #[instrument(skip(self), fields(job_id = %id, user_id = %user_id, status = tracing::field::Empty), err)]
    async fn reset_to_pending(&self, id: JobId, user_id: UserId) -> Result<Job, JobError> {
        // The partial unique index rejects the write if another job is active.
        self.transition("reset_to_pending", id, Some(user_id), move |job, now| {
            job.reset_to_pending(now)?;
            job.updated_by = Some(user_id);
            Ok(())
        })
        .await
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn update_progress(&self, id: JobId, progress: u8) -> Result<(), JobError> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET progress = $2, updated_at = NOW()
            WHERE id = $1 AND status = ANY($3) AND deleted_at IS NULL
            "#,
        )
        .bind(id.as_uuid())
        .bind(progress.min(100) as i16)
        .bind(status_names(&JobStatus::ACTIVE))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_progress", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn find_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobError> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE status = 'completed'
              AND expires_at IS NOT NULL
              AND expires_at <= $1
              AND deleted_at IS NULL
            ORDER BY expires_at ASC
            LIMIT $2
            "#
        );
        self.fetch_many("find_expired_jobs", sqlx::query(&sql).bind(now).bind(limit as i64))
            .await
    }

    #[instrument(skip(self), fields(job_id = %id, user_id = %user_id), err)]
    async fn soft_delete(&self, id: JobId, user_id: UserId) -> Result<Job, JobError> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET deleted_at = NOW(), deleted_by = $2, updated_at = NOW(), updated_by = $2
            WHERE id = $1 AND user_id = $2 AND deleted_at IS NULL
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(user_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("soft_delete_job", e))?;
        row.as_ref()
            .map(decode_job)
            .transpose()?
            .ok_or(JobError::NotFound(id))
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn soft_delete_expired(&self, id: JobId) -> Result<(), JobError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET deleted_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(id.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("soft_delete_expired", e))?;

        if result.rows_affected() == 0 {
            return Err(JobError::NotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(user_id = %user_id, company_id = %company_id), err)]
    async fn soft_delete_finished(&self, user_id: UserId, company_id: CompanyId) -> Result<Vec<Job>, JobError> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET deleted_at = NOW(), deleted_by = $1, updated_at = NOW(), updated_by = $1
            WHERE user_id = $1
              AND company_id = $2
              AND status = ANY($3)
              AND deleted_at IS NULL
            RETURNING {JOB_COLUMNS}
            "#
        );
        self.fetch_many(
            "soft_delete_finished",
            sqlx::query(&sql)
                .bind(user_id.as_uuid())
                .bind(company_id.as_uuid())
                .bind(status_names(&JobStatus::FINISHED)),
        )
        .await
    }
}

async fn lock_job(
    tx: &mut Transaction<'_, Postgres>,
    id: JobId,
    user_id: Option<UserId>,
) -> Result<Option<Job>, JobError> {
    let sql = format!(
        r#"
        SELECT {JOB_COLUMNS}
        FROM jobs
        WHERE id = $1
          AND ($2::uuid IS NULL OR user_id = $2)
          AND deleted_at IS NULL
        FOR UPDATE
        "#
    );
    let row = sqlx::query(&sql)
        .bind(id.as_uuid())
        .bind(user_id.map(|u| *u.as_uuid()))
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("lock_job", e))?;
    row.as_ref().map(decode_job).transpose()
}

async fn write_job(tx: &mut Transaction<'_, Postgres>, job: &Job, operation: &'static str) -> Result<(), JobError> {
    sqlx::query(
        r#"
        UPDATE jobs
        SET status = $2,
            progress = $3,
            metadata = $4,
            result_url = $5,
            file_path = $6,
            file_size = $7,
            error_message = $8,
            expires_at = $9,
            updated_at = $10,
            started_at = $11,
            completed_at = $12,
            updated_by = $13
        WHERE id = $1
        "#,
    )
    .bind(job.id.as_uuid())
    .bind(job.status.as_str())
    .bind(job.progress as i16)
    .bind(&job.metadata)
    .bind(&job.result_url)
    .bind(&job.file_path)
    .bind(job.file_size.map(|s| s as i64))
    .bind(&job.error_message)
    .bind(job.expires_at)
    .bind(job.updated_at)
    .bind(job.started_at)
    .bind(job.completed_at)
    .bind(job.updated_by.map(|u| *u.as_uuid()))
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error(operation, e))?;
    Ok(())
}

fn status_names(statuses: &[JobStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

fn decode_job(row: &PgRow) -> Result<Job, JobError> {
    JobRow::from_row(row)
        .map_err(|e| JobError::Storage(format!("failed to deserialize job row: {e}")))?
        .try_into()
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobError {
    match err {
        sqlx::Error::Database(db_err) => {
            if db_err.code().as_deref() == Some("23505") {
                JobError::AlreadyProcessing
            } else {
                JobError::Storage(format!("database error in {}: {}", operation, db_err.message()))
            }
        }
        sqlx::Error::PoolClosed => JobError::Storage(format!("connection pool closed in {operation}")),
        _ => JobError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

#[derive(Debug)]
struct JobRow {
    id: uuid::Uuid,
    user_id: uuid::Uuid,
    company_id: uuid::Uuid,
    job_type: String,
    module: String,
    name: String,
    status: String,
    progress: i16,
    metadata: serde_json::Value,
    result_url: Option<String>,
    file_path: Option<String>,
    file_size: Option<i64>,
    error_message: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    created_by: Option<uuid::Uuid>,
    updated_by: Option<uuid::Uuid>,
    deleted_at: Option<DateTime<Utc>>,
    deleted_by: Option<uuid::Uuid>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            company_id: row.try_get("company_id")?,
            job_type: row.try_get("type")?,
            module: row.try_get("module")?,
            name: row.try_get("name")?,
            status: row.try_get("status")?,
            progress: row.try_get("progress")?,
            metadata: row.try_get("metadata")?,
            result_url: row.try_get("result_url")?,
            file_path: row.try_get("file_path")?,
            file_size: row.try_get("file_size")?,
            error_message: row.try_get("error_message")?,
            expires_at: row.try_get("expires_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            created_by: row.try_get("created_by")?,
            updated_by: row.try_get("updated_by")?,
            deleted_at: row.try_get("deleted_at")?,
            deleted_by: row.try_get("deleted_by")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: JobId::from_uuid(row.id),
            user_id: UserId::from_uuid(row.user_id),
            company_id: CompanyId::from_uuid(row.company_id),
            job_type: row
                .job_type
                .parse()
                .map_err(|_| JobError::Storage(format!("unknown job type in storage: {}", row.job_type)))?,
            module: row
                .module
                .parse()
                .map_err(|_| JobError::Storage(format!("unknown job module in storage: {}", row.module)))?,
            name: row.name,
            status: row.status.parse()?,
            progress: row.progress.clamp(0, 100) as u8,
            metadata: row.metadata,
            result_url: row.result_url,
            file_path: row.file_path,
            file_size: row.file_size.map(|s| s.max(0) as u64),
            error_message: row.error_message,
            expires_at: row.expires_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            created_by: row.created_by.map(UserId::from_uuid),
            updated_by: row.updated_by.map(UserId::from_uuid),
            deleted_at: row.deleted_at,
            deleted_by: row.deleted_by.map(UserId::from_uuid),
        })
    }
}

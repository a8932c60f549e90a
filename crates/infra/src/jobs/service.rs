//! Caller-facing job operations.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use backoffice_core::{CompanyId, JobId, UserId};

use super::cancellation::InFlightJobs;
use super::error::JobError;
use super::registry::ProcessorRegistry;
use super::results::ResultStore;
use super::store::{JobStore, RECENT_JOBS_LIMIT};
use super::types::{clamp_progress, Job, JobModule, JobStatus, JobType, NewJob};

/// How many expired jobs one sweep handles.
pub const CLEANUP_BATCH_SIZE: usize = 100;

/// Outcome of an expired-result sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub expired_found: usize,
    pub deleted_jobs: usize,
    pub blob_removal_failed: bool,
}

pub struct JobsService {
    store: Arc<dyn JobStore>,
    results: Arc<dyn ResultStore>,
    registry: Arc<ProcessorRegistry>,
    in_flight: Arc<InFlightJobs>,
}

impl std::fmt::Debug for JobsService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobsService")
            .field("registry", &self.registry)
            .field("in_flight", &self.in_flight.len())
            .finish_non_exhaustive()
    }
}

impl JobsService {
    pub fn new(
        store: Arc<dyn JobStore>,
        results: Arc<dyn ResultStore>,
        registry: Arc<ProcessorRegistry>,
        in_flight: Arc<InFlightJobs>,
    ) -> Self {
        Self {
            store,
            results,
            registry,
            in_flight,
        }
    }

    /// Create a pending job; fails with `AlreadyProcessing` if the user has an active one.
    pub async fn create_job(&self, new: NewJob) -> Result<Job, JobError> {
        new.validate()?;
        let job = self.store.create(new).await?;
        info!(
            target: "audit",
            action = "job.create",
            job_id = %job.id,
            user_id = %job.user_id,
            company_id = %job.company_id,
            job_type = %job.job_type,
            module = %job.module,
            "job created"
        );
        Ok(job)
    }

    pub async fn get_job(&self, id: JobId, user_id: UserId) -> Result<Job, JobError> {
        self.store
            .find_by_id(id, user_id)
            .await?
            .ok_or(JobError::NotFound(id))
    }

    pub async fn recent_jobs(&self, user_id: UserId) -> Result<Vec<Job>, JobError> {
        self.store.find_recent_by_user(user_id, RECENT_JOBS_LIMIT).await
    }

    pub async fn has_active_job(&self, user_id: UserId) -> Result<bool, JobError> {
        self.store.has_active_job(user_id).await
    }

    /// Cancel a pending or processing job. A running processor is only signalled.
    pub async fn cancel_job(&self, id: JobId, user_id: UserId) -> Result<Job, JobError> {
        let job = self.store.mark_cancelled(id, user_id).await?;
        let signalled = self.in_flight.cancel(id);
        info!(target: "audit", action = "job.cancel", job_id = %id, user_id = %user_id, signalled, "job cancelled");
        Ok(job)
    }

    /// Put a failed job back in the queue.
    pub async fn retry_job(&self, id: JobId, user_id: UserId) -> Result<Job, JobError> {
        let job = self.store.reset_to_pending(id, user_id).await?;
        info!(target: "audit", action = "job.retry", job_id = %id, user_id = %user_id, "job re-queued");
        Ok(job)
    }

    /// Soft-delete a job and drop its stored result.
    pub async fn delete_job(&self, id: JobId, user_id: UserId) -> Result<(), JobError> {
        let job = self.store.soft_delete(id, user_id).await?;
        self.remove_blobs(std::slice::from_ref(&job)).await;
        info!(target: "audit", action = "job.delete", job_id = %id, user_id = %user_id, "job deleted");
        Ok(())
    }

    /// Soft-delete all finished jobs of a user in a company. Returns how many.
    pub async fn clear_finished(&self, user_id: UserId, company_id: CompanyId) -> Result<usize, JobError> {
        let deleted = self.store.soft_delete_finished(user_id, company_id).await?;
        self.remove_blobs(&deleted).await;
        info!(
            target: "audit",
            action = "job.bulk_delete",
            user_id = %user_id,
            company_id = %company_id,
            count = deleted.len(),
            "finished jobs cleared"
        );
        Ok(deleted.len())
    }

    pub async fn update_progress(&self, id: JobId, user_id: UserId, value: i64) -> Result<(), JobError> {
        self.get_job(id, user_id).await?;
        self.store.update_progress(id, clamp_progress(value)).await
    }

    /// Signed URL of a completed job's result.
    pub async fn result_link(&self, id: JobId, user_id: UserId, now: DateTime<Utc>) -> Result<String, JobError> {
        let job = self.get_job(id, user_id).await?;
        if job.status != JobStatus::Completed {
            return Err(JobError::InvalidStatus {
                from: job.status,
                to: JobStatus::Completed,
            });
        }
        if job.is_expired(now) {
            return Err(JobError::Expired);
        }
        job.result_url.ok_or(JobError::NotFound(id))
    }

    /// Remove stored results of expired jobs and soft-delete the jobs.
    pub async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<CleanupReport, JobError> {
        let expired = self.store.find_expired(now, CLEANUP_BATCH_SIZE).await?;
        let mut report = CleanupReport {
            expired_found: expired.len(),
            ..CleanupReport::default()
        };
        if expired.is_empty() {
            return Ok(report);
        }

        report.blob_removal_failed = !self.remove_blobs(&expired).await;

        for job in &expired {
            match self.store.soft_delete_expired(job.id).await {
                Ok(()) => report.deleted_jobs += 1,
                Err(err) => warn!(job_id = %job.id, error = %err, "failed to delete expired job"),
            }
        }
        info!(found = report.expired_found, deleted = report.deleted_jobs, "expired jobs cleaned up");
        Ok(report)
    }

    pub fn available_modules(&self, job_type: JobType) -> Vec<JobModule> {
        self.registry.available_modules(job_type)
    }

    /// Best-effort blob removal; returns false when the store reported an error.
    async fn remove_blobs(&self, jobs: &[Job]) -> bool {
        let paths: Vec<String> = jobs.iter().filter_map(|j| j.file_path.clone()).collect();
        if paths.is_empty() {
            return true;
        }
        match self.results.remove(&paths).await {
            Ok(()) => true,
            Err(err) => {
                warn!(count = paths.len(), error = %err, "failed to remove job result files");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::results::InMemoryResultStore;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::JobCompletion;

    struct Fixture {
        store: Arc<InMemoryJobStore>,
        results: Arc<InMemoryResultStore>,
        in_flight: Arc<InFlightJobs>,
        service: JobsService,
    }

    fn fixture() -> Fixture {
        let store = InMemoryJobStore::arc();
        let results = Arc::new(InMemoryResultStore::new());
        let in_flight = InFlightJobs::new();
        let service = JobsService::new(
            store.clone(),
            results.clone(),
            Arc::new(ProcessorRegistry::default()),
            in_flight.clone(),
        );
        Fixture {
            store,
            results,
            in_flight,
            service,
        }
    }

    fn new_job(user: UserId, company: CompanyId) -> NewJob {
        NewJob::new(user, company, JobType::Export, JobModule::Products, "Products export")
    }

    async fn completed_with_blob(f: &Fixture, user: UserId, expires_at: DateTime<Utc>) -> Job {
        let job = f.service.create_job(new_job(user, CompanyId::new())).await.unwrap();
        f.store.mark_processing(job.id).await.unwrap();
        let path = format!("{user}/{}/products.csv", job.id);
        f.results.upload(&path, b"x".to_vec(), "text/csv").await.unwrap();
        f.store
            .mark_completed(
                job.id,
                JobCompletion {
                    result_url: Some(format!("memory://{path}")),
                    file_path: Some(path),
                    file_size: 1,
                    expires_at: Some(expires_at),
                    import_results: None,
                },
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn second_submission_is_rejected_while_first_is_active() {
        let f = fixture();
        let user = UserId::new();
        f.service.create_job(new_job(user, CompanyId::new())).await.unwrap();

        let err = f.service.create_job(new_job(user, CompanyId::new())).await.unwrap_err();
        assert_eq!(err, JobError::AlreadyProcessing);
    }

    #[tokio::test]
    async fn cancel_is_limited_to_unfinished_jobs_and_signals_the_token() {
        let f = fixture();
        let user = UserId::new();
        let job = f.service.create_job(new_job(user, CompanyId::new())).await.unwrap();
        f.store.mark_processing(job.id).await.unwrap();
        let guard = f.in_flight.register(job.id).unwrap();

        let cancelled = f.service.cancel_job(job.id, user).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(guard.token().is_cancelled());

        assert!(matches!(
            f.service.cancel_job(job.id, user).await,
            Err(JobError::InvalidStatus { from: JobStatus::Cancelled, .. })
        ));
    }

    #[tokio::test]
    async fn result_link_reports_expiry() {
        let f = fixture();
        let user = UserId::new();
        let expires_at = Utc::now() + chrono::Duration::hours(1);
        let job = completed_with_blob(&f, user, expires_at).await;

        assert!(f.service.result_link(job.id, user, Utc::now()).await.is_ok());
        assert_eq!(
            f.service
                .result_link(job.id, user, expires_at + chrono::Duration::seconds(1))
                .await,
            Err(JobError::Expired)
        );
        assert_eq!(
            f.service.result_link(job.id, UserId::new(), Utc::now()).await,
            Err(JobError::NotFound(job.id))
        );
    }

    #[tokio::test]
    async fn cleanup_removes_blobs_and_deletes_jobs() {
        let f = fixture();
        let user = UserId::new();
        let job = completed_with_blob(&f, user, Utc::now() - chrono::Duration::minutes(1)).await;
        assert_eq!(f.results.paths().len(), 1);

        let report = f.service.cleanup_expired(Utc::now()).await.unwrap();

        assert_eq!(report.expired_found, 1);
        assert_eq!(report.deleted_jobs, 1);
        assert!(f.results.is_empty());
        assert!(matches!(f.service.get_job(job.id, user).await, Err(JobError::NotFound(_))));
    }

    #[tokio::test]
    async fn clear_finished_keeps_active_jobs() {
        let f = fixture();
        let user = UserId::new();
        let company = CompanyId::new();

        let done = f.service.create_job(new_job(user, company)).await.unwrap();
        f.store.mark_processing(done.id).await.unwrap();
        f.store.mark_failed(done.id, "boom").await.unwrap();
        let active = f.service.create_job(new_job(user, company)).await.unwrap();

        assert_eq!(f.service.clear_finished(user, company).await.unwrap(), 1);
        assert!(f.service.get_job(active.id, user).await.is_ok());
        assert!(f.service.get_job(done.id, user).await.is_err());
    }

    #[tokio::test]
    async fn progress_updates_are_clamped() {
        let f = fixture();
        let user = UserId::new();
        let job = f.service.create_job(new_job(user, CompanyId::new())).await.unwrap();

        f.service.update_progress(job.id, user, 180).await.unwrap();
        assert_eq!(f.service.get_job(job.id, user).await.unwrap().progress, 100);

        f.service.update_progress(job.id, user, -3).await.unwrap();
        assert_eq!(f.service.get_job(job.id, user).await.unwrap().progress, 0);
    }

    #[tokio::test]
    async fn retry_rearms_a_failed_job() {
        let f = fixture();
        let user = UserId::new();
        let job = f.service.create_job(new_job(user, CompanyId::new())).await.unwrap();
        f.store.mark_processing(job.id).await.unwrap();
        f.store.mark_failed(job.id, "boom").await.unwrap();

        let retried = f.service.retry_job(job.id, user).await.unwrap();
        assert_eq!(retried.status, JobStatus::Pending);
        assert!(f.service.has_active_job(user).await.unwrap());
    }
}

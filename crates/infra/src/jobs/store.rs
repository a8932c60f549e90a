//! Job storage abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use backoffice_core::{CompanyId, JobId, UserId};

use super::error::JobError;
use super::types::{Job, JobCompletion, JobStatus, NewJob};

/// How many jobs `recent_jobs` returns.
pub const RECENT_JOBS_LIMIT: usize = 10;

/// Persistence for job records.
///
/// Every lifecycle change is a single atomic operation on the store; callers
/// never read, modify and write back a job themselves. Owner-scoped lookups
/// report foreign jobs as absent.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a pending job, failing with `AlreadyProcessing` when the user
    /// already has an active one. Check and insert are one atomic step.
    async fn create(&self, new: NewJob) -> Result<Job, JobError>;

    async fn find_by_id(&self, id: JobId, user_id: UserId) -> Result<Option<Job>, JobError>;

    /// Unscoped lookup for the worker.
    async fn get(&self, id: JobId) -> Result<Option<Job>, JobError>;

    /// Newest non-deleted pending/processing/completed jobs of a user.
    async fn find_recent_by_user(&self, user_id: UserId, limit: usize) -> Result<Vec<Job>, JobError>;

    async fn has_active_job(&self, user_id: UserId) -> Result<bool, JobError>;

    /// Oldest pending jobs first.
    async fn find_pending(&self, limit: usize) -> Result<Vec<Job>, JobError>;

    async fn mark_processing(&self, id: JobId) -> Result<Job, JobError>;

    async fn mark_completed(&self, id: JobId, completion: JobCompletion) -> Result<Job, JobError>;

    async fn mark_failed(&self, id: JobId, message: &str) -> Result<Job, JobError>;

    async fn mark_cancelled(&self, id: JobId, user_id: UserId) -> Result<Job, JobError>;

    /// Move a failed job back to pending, subject to the one-active-job rule.
    async fn reset_to_pending(&self, id: JobId, user_id: UserId) -> Result<Job, JobError>;

    /// Best-effort; ignored for finished jobs. `progress` is already clamped.
    async fn update_progress(&self, id: JobId, progress: u8) -> Result<(), JobError>;

    /// Completed, non-deleted jobs whose result expired at or before `now`.
    async fn find_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobError>;

    async fn soft_delete(&self, id: JobId, user_id: UserId) -> Result<Job, JobError>;

    /// Soft-delete a job without an owner check (administrative sweeps).
    async fn soft_delete_expired(&self, id: JobId) -> Result<(), JobError>;

    /// Soft-delete a user's finished jobs within a company; returns them.
    async fn soft_delete_finished(&self, user_id: UserId, company_id: CompanyId) -> Result<Vec<Job>, JobError>;
}

#[async_trait]
impl<S: JobStore + ?Sized> JobStore for Arc<S> {
    async fn create(&self, new: NewJob) -> Result<Job, JobError> {
        (**self).create(new).await
    }

    async fn find_by_id(&self, id: JobId, user_id: UserId) -> Result<Option<Job>, JobError> {
        (**self).find_by_id(id, user_id).await
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobError> {
        (**self).get(id).await
    }

    async fn find_recent_by_user(&self, user_id: UserId, limit: usize) -> Result<Vec<Job>, JobError> {
        (**self).find_recent_by_user(user_id, limit).await
    }

    async fn has_active_job(&self, user_id: UserId) -> Result<bool, JobError> {
        (**self).has_active_job(user_id).await
    }

    async fn find_pending(&self, limit: usize) -> Result<Vec<Job>, JobError> {
        (**self).find_pending(limit).await
    }

    async fn mark_processing(&self, id: JobId) -> Result<Job, JobError> {
        (**self).mark_processing(id).await
    }

    async fn mark_completed(&self, id: JobId, completion: JobCompletion) -> Result<Job, JobError> {
        (**self).mark_completed(id, completion).await
    }

    async fn mark_failed(&self, id: JobId, message: &str) -> Result<Job, JobError> {
        (**self).mark_failed(id, message).await
    }

    async fn mark_cancelled(&self, id: JobId, user_id: UserId) -> Result<Job, JobError> {
        (**self).mark_cancelled(id, user_id).await
    }

    async fn reset_to_pending(&self, id: JobId, user_id: UserId) -> Result<Job, JobError> {
        (**self).reset_to_pending(id, user_id).await
    }

    async fn update_progress(&self, id: JobId, progress: u8) -> Result<(), JobError> {
        (**self).update_progress(id, progress).await
    }

    async fn find_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobError> {
        (**self).find_expired(now, limit).await
    }

    async fn soft_delete(&self, id: JobId, user_id: UserId) -> Result<Job, JobError> {
        (**self).soft_delete(id, user_id).await
    }

    async fn soft_delete_expired(&self, id: JobId) -> Result<(), JobError> {
        (**self).soft_delete_expired(id).await
    }

    async fn soft_delete_finished(&self, user_id: UserId, company_id: CompanyId) -> Result<Vec<Job>, JobError> {
        (**self).soft_delete_finished(user_id, company_id).await
    }
}

/// In-memory job store for tests/dev.
///
/// A single write lock covers each operation, which makes the
/// one-active-job check and the insert indivisible.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply a transition to a live (non-deleted) job under the write lock.
    fn transition<F>(&self, id: JobId, user_id: Option<UserId>, apply: F) -> Result<Job, JobError>
    where
        F: FnOnce(&mut Job, DateTime<Utc>) -> Result<(), JobError>,
    {
        let mut jobs = self.jobs.write();
        let job = jobs
            .get_mut(&id)
            .filter(|j| !j.is_deleted() && user_id.is_none_or(|u| j.user_id == u))
            .ok_or(JobError::NotFound(id))?;
        apply(job, Utc::now())?;
        Ok(job.clone())
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, new: NewJob) -> Result<Job, JobError> {
        let mut jobs = self.jobs.write();
        if jobs.values().any(|j| j.user_id == new.user_id && j.is_active()) {
            return Err(JobError::AlreadyProcessing);
        }
        let job = Job::from_new(new, Utc::now());
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn find_by_id(&self, id: JobId, user_id: UserId) -> Result<Option<Job>, JobError> {
        let jobs = self.jobs.read();
        Ok(jobs
            .get(&id)
            .filter(|j| j.user_id == user_id && !j.is_deleted())
            .cloned())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobError> {
        Ok(self.jobs.read().get(&id).filter(|j| !j.is_deleted()).cloned())
    }

    async fn find_recent_by_user(&self, user_id: UserId, limit: usize) -> Result<Vec<Job>, JobError> {
        let jobs = self.jobs.read();
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| {
                j.user_id == user_id
                    && !j.is_deleted()
                    && matches!(
                        j.status,
                        JobStatus::Pending | JobStatus::Processing | JobStatus::Completed
                    )
            })
            .cloned()
            .collect();

        result.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        result.truncate(limit);
        Ok(result)
    }

    async fn has_active_job(&self, user_id: UserId) -> Result<bool, JobError> {
        Ok(self
            .jobs
            .read()
            .values()
            .any(|j| j.user_id == user_id && j.is_active()))
    }

    async fn find_pending(&self, limit: usize) -> Result<Vec<Job>, JobError> {
        let jobs = self.jobs.read();
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending && !j.is_deleted())
            .cloned()
            .collect();

        // Oldest first (FIFO)
        result.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        result.truncate(limit);
        Ok(result)
    }

    async fn mark_processing(&self, id: JobId) -> Result<Job, JobError> {
        self.transition(id, None, |job, now| job.mark_processing(now))
    }

    async fn mark_completed(&self, id: JobId, completion: JobCompletion) -> Result<Job, JobError> {
        self.transition(id, None, |job, now| job.mark_completed(completion, now))
    }

    async fn mark_failed(&self, id: JobId, message: &str) -> Result<Job, JobError> {
        self.transition(id, None, |job, now| job.mark_failed(message, now))
    }

    async fn mark_cancelled(&self, id: JobId, user_id: UserId) -> Result<Job, JobError> {
        self.transition(id, Some(user_id), |job, now| {
            job.mark_cancelled(now)?;
            job.updated_by = Some(user_id);
            Ok(())
        })
    }

    async fn reset_to_pending(&self, id: JobId, user_id: UserId) -> Result<Job, JobError> {
        let mut jobs = self.jobs.write();
        if jobs
            .values()
            .any(|j| j.id != id && j.user_id == user_id && j.is_active())
        {
            return Err(JobError::AlreadyProcessing);
        }
        let job = jobs
            .get_mut(&id)
            .filter(|j| j.user_id == user_id && !j.is_deleted())
            .ok_or(JobError::NotFound(id))?;
        job.reset_to_pending(Utc::now())?;
        job.updated_by = Some(user_id);
        Ok(job.clone())
    }

    async fn update_progress(&self, id: JobId, progress: u8) -> Result<(), JobError> {
        if let Some(job) = self.jobs.write().get_mut(&id) {
            job.set_progress(progress, Utc::now());
        }
        Ok(())
    }

    async fn find_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobError> {
        let jobs = self.jobs.read();
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.status == JobStatus::Completed && !j.is_deleted() && j.is_expired(now))
            .cloned()
            .collect();

        result.sort_by_key(|j| j.expires_at);
        result.truncate(limit);
        Ok(result)
    }

    async fn soft_delete(&self, id: JobId, user_id: UserId) -> Result<Job, JobError> {
        self.transition(id, Some(user_id), |job, now| {
            job.soft_delete(Some(user_id), now);
            Ok(())
        })
    }

    async fn soft_delete_expired(&self, id: JobId) -> Result<(), JobError> {
        self.transition(id, None, |job, now| {
            job.soft_delete(None, now);
            Ok(())
        })
        .map(|_| ())
    }

    async fn soft_delete_finished(&self, user_id: UserId, company_id: CompanyId) -> Result<Vec<Job>, JobError> {
        let mut jobs = self.jobs.write();
        let now = Utc::now();
        let deleted = jobs
            .values_mut()
            .filter(|j| {
                j.user_id == user_id
                    && j.company_id == company_id
                    && !j.is_deleted()
                    && j.status.is_terminal()
            })
            .map(|job| {
                job.soft_delete(Some(user_id), now);
                job.clone()
            })
            .collect();
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::{JobModule, JobType};

    fn new_job(user: UserId) -> NewJob {
        NewJob::new(user, CompanyId::new(), JobType::Export, JobModule::Employees, "export")
    }

    #[tokio::test]
    async fn second_active_job_for_user_is_rejected() {
        let store = InMemoryJobStore::new();
        let user = UserId::new();

        store.create(new_job(user)).await.unwrap();
        assert_eq!(store.create(new_job(user)).await.unwrap_err(), JobError::AlreadyProcessing);

        // Another user is unaffected
        assert!(store.create(new_job(UserId::new())).await.is_ok());
    }

    #[tokio::test]
    async fn finished_job_frees_the_user_slot() {
        let store = InMemoryJobStore::new();
        let user = UserId::new();

        let job = store.create(new_job(user)).await.unwrap();
        store.mark_processing(job.id).await.unwrap();
        store.mark_failed(job.id, "boom").await.unwrap();

        assert!(!store.has_active_job(user).await.unwrap());
        assert!(store.create(new_job(user)).await.is_ok());
    }

    #[tokio::test]
    async fn foreign_jobs_look_absent() {
        let store = InMemoryJobStore::new();
        let job = store.create(new_job(UserId::new())).await.unwrap();

        assert!(store.find_by_id(job.id, UserId::new()).await.unwrap().is_none());
        assert_eq!(
            store.mark_cancelled(job.id, UserId::new()).await.unwrap_err(),
            JobError::NotFound(job.id)
        );
    }

    #[tokio::test]
    async fn terminal_states_are_stable() {
        let store = InMemoryJobStore::new();
        let job = store.create(new_job(UserId::new())).await.unwrap();
        store.mark_processing(job.id).await.unwrap();
        store.mark_completed(job.id, JobCompletion::default()).await.unwrap();

        assert!(matches!(
            store.mark_completed(job.id, JobCompletion::default()).await,
            Err(JobError::InvalidStatus { .. })
        ));
        assert!(store.mark_failed(job.id, "late").await.is_err());
        assert!(store.mark_processing(job.id).await.is_err());
        assert!(store.mark_cancelled(job.id, job.user_id).await.is_err());
    }

    #[tokio::test]
    async fn retry_respects_the_active_job_rule() {
        let store = InMemoryJobStore::new();
        let user = UserId::new();

        let failed = store.create(new_job(user)).await.unwrap();
        store.mark_processing(failed.id).await.unwrap();
        store.mark_failed(failed.id, "boom").await.unwrap();

        let other = store.create(new_job(user)).await.unwrap();
        assert_eq!(
            store.reset_to_pending(failed.id, user).await.unwrap_err(),
            JobError::AlreadyProcessing
        );

        store.mark_cancelled(other.id, user).await.unwrap();
        let rearmed = store.reset_to_pending(failed.id, user).await.unwrap();
        assert_eq!(rearmed.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn expired_results_are_found_until_deleted() {
        let store = InMemoryJobStore::new();
        let job = store.create(new_job(UserId::new())).await.unwrap();
        store.mark_processing(job.id).await.unwrap();
        let past = Utc::now() - chrono::Duration::minutes(1);
        store
            .mark_completed(
                job.id,
                JobCompletion {
                    expires_at: Some(past),
                    ..JobCompletion::default()
                },
            )
            .await
            .unwrap();

        let expired = store.find_expired(Utc::now(), 100).await.unwrap();
        assert_eq!(expired.len(), 1);

        store.soft_delete_expired(job.id).await.unwrap();
        assert!(store.find_expired(Utc::now(), 100).await.unwrap().is_empty());
    }
}

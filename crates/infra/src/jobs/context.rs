//! What a processor gets to see of its job.

use std::sync::Arc;

use tracing::warn;

use backoffice_core::{CompanyId, JobId, UserId};

use super::cancellation::CancellationToken;
use super::store::JobStore;
use super::types::{clamp_progress, Job, JobModule, JobType};

/// Writes job progress back to the store.
///
/// Best-effort: store errors are logged and swallowed, and values are clamped
/// into `0..=100` before they leave this type.
#[derive(Clone)]
pub struct ProgressReporter {
    store: Arc<dyn JobStore>,
    job_id: JobId,
}

impl ProgressReporter {
    pub fn new(store: Arc<dyn JobStore>, job_id: JobId) -> Self {
        Self { store, job_id }
    }

    pub async fn report(&self, value: i64) {
        let progress = clamp_progress(value);
        if let Err(err) = self.store.update_progress(self.job_id, progress).await {
            warn!(job_id = %self.job_id, progress, error = %err, "failed to update job progress");
        }
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("job_id", &self.job_id)
            .finish_non_exhaustive()
    }
}

/// Execution context passed to a processor.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub user_id: UserId,
    pub company_id: CompanyId,
    pub job_type: JobType,
    pub module: JobModule,
    /// Processor-specific input, as submitted.
    pub metadata: serde_json::Value,
    progress: ProgressReporter,
    cancel: CancellationToken,
}

impl JobContext {
    pub fn new(job: &Job, store: Arc<dyn JobStore>, cancel: CancellationToken) -> Self {
        Self {
            job_id: job.id,
            user_id: job.user_id,
            company_id: job.company_id,
            job_type: job.job_type,
            module: job.module,
            metadata: job.metadata.clone(),
            progress: ProgressReporter::new(store, job.id),
            cancel,
        }
    }

    pub async fn report_progress(&self, value: i64) {
        self.progress.report(value).await;
    }

    pub fn progress_reporter(&self) -> ProgressReporter {
        self.progress.clone()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

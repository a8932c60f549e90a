//! Persisting a processor's output and completing the job.
//!
//! With a result file this is a compensating sequence:
//!
//! 1. check the staging file exists and is under the size ceiling
//! 2. upload it to `{user_id}/{job_id}/{file_name}`
//! 3. sign a URL valid for the retention window
//! 4. mark the job completed
//! 5. delete the staging file
//!
//! If 3 or 4 fails after 2 succeeded, the uploaded object is removed before the
//! error is returned. A completed job always has its object; an object never
//! outlives a failed completion.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use super::error::JobError;
use super::registry::{ProcessorOutput, ResultFile};
use super::results::{content_type_for, result_path, ResultStore};
use super::store::JobStore;
use super::temp::TempFileManager;
use super::types::{Job, JobCompletion};

#[derive(Clone)]
pub struct JobCompleter {
    store: Arc<dyn JobStore>,
    results: Arc<dyn ResultStore>,
    temp: TempFileManager,
    max_result_bytes: u64,
    result_ttl: Duration,
}

impl JobCompleter {
    pub fn new(
        store: Arc<dyn JobStore>,
        results: Arc<dyn ResultStore>,
        temp: TempFileManager,
        max_result_bytes: u64,
        result_ttl: Duration,
    ) -> Self {
        Self {
            store,
            results,
            temp,
            max_result_bytes,
            result_ttl,
        }
    }

    pub fn temp(&self) -> &TempFileManager {
        &self.temp
    }

    /// Persist `output` and mark `job` completed.
    pub async fn complete(&self, job: &Job, output: ProcessorOutput) -> Result<Job, JobError> {
        match output.file {
            Some(file) => self.complete_with_file(job, file, output.import_results).await,
            None => {
                let completed = self
                    .store
                    .mark_completed(
                        job.id,
                        JobCompletion {
                            import_results: output.import_results,
                            ..JobCompletion::default()
                        },
                    )
                    .await?;
                info!(target: "audit", action = "job.complete", job_id = %job.id, user_id = %job.user_id, module = %job.module, "job completed without result file");
                Ok(completed)
            }
        }
    }

    async fn complete_with_file(
        &self,
        job: &Job,
        file: ResultFile,
        import_results: Option<serde_json::Value>,
    ) -> Result<Job, JobError> {
        let result = self.upload_and_mark(job, &file, import_results).await;
        // The staging file is no longer needed whichever way this went.
        self.temp.remove_or_retry(&file.path).await;
        result
    }

    async fn upload_and_mark(
        &self,
        job: &Job,
        file: &ResultFile,
        import_results: Option<serde_json::Value>,
    ) -> Result<Job, JobError> {
        let metadata = tokio::fs::metadata(&file.path).await.map_err(|err| {
            JobError::FileUploadFailed(format!("result file {} is not readable: {err}", file.path.display()))
        })?;
        let size = metadata.len();
        if size > self.max_result_bytes {
            return Err(JobError::FileUploadFailed(format!(
                "result file is {size} bytes, above the {} byte limit",
                self.max_result_bytes
            )));
        }

        let bytes = tokio::fs::read(&file.path)
            .await
            .map_err(|err| JobError::FileUploadFailed(format!("failed to read result file: {err}")))?;
        let storage_path = result_path(job.user_id, job.id, &file.file_name);

        self.results
            .upload(&storage_path, bytes, content_type_for(&file.file_name))
            .await
            .map_err(|err| JobError::FileUploadFailed(err.to_string()))?;

        let url = match self.results.create_signed_url(&storage_path, self.result_ttl).await {
            Ok(url) => url,
            Err(err) => {
                self.rollback_upload(job, &storage_path).await;
                return Err(JobError::FileUploadFailed(format!("failed to sign result url: {err}")));
            }
        };

        let expires_at = Utc::now()
            + chrono::Duration::from_std(self.result_ttl).unwrap_or(chrono::Duration::hours(24));
        let completion = JobCompletion {
            result_url: Some(url),
            file_path: Some(storage_path.clone()),
            file_size: size,
            expires_at: Some(expires_at),
            import_results,
        };

        match self.store.mark_completed(job.id, completion).await {
            Ok(completed) => {
                info!(
                    target: "audit",
                    action = "job.complete",
                    job_id = %job.id,
                    user_id = %job.user_id,
                    module = %job.module,
                    file_path = %storage_path,
                    file_size = size,
                    "job completed"
                );
                Ok(completed)
            }
            Err(err) => {
                self.rollback_upload(job, &storage_path).await;
                Err(err)
            }
        }
    }

    async fn rollback_upload(&self, job: &Job, storage_path: &str) {
        warn!(job_id = %job.id, path = storage_path, "rolling back uploaded result");
        if let Err(err) = self.results.remove(&[storage_path.to_string()]).await {
            error!(job_id = %job.id, path = storage_path, error = %err, "failed to roll back uploaded result");
        }
    }
}

impl std::fmt::Debug for JobCompleter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobCompleter")
            .field("temp", &self.temp)
            .field("max_result_bytes", &self.max_result_bytes)
            .field("result_ttl", &self.result_ttl)
            .finish_non_exhaustive()
    }
}

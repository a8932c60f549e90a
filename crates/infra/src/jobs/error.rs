//! Job queue error taxonomy.

use thiserror::Error;

use backoffice_core::JobId;

use super::types::JobStatus;

/// Errors surfaced by the job store, the completion step and the jobs service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// The user already has a pending or processing job.
    #[error("user already has a job in progress")]
    AlreadyProcessing,

    /// Absent, soft-deleted, or owned by someone else.
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job is {from}, cannot move to {to}")]
    InvalidStatus { from: JobStatus, to: JobStatus },

    #[error("processing failed: {0}")]
    ProcessingFailed(String),

    #[error("file upload failed: {0}")]
    FileUploadFailed(String),

    #[error("job result has expired")]
    Expired,

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("job storage error: {0}")]
    Storage(String),
}

//! Background job queue.
//!
//! ## Components
//!
//! - `JobStore`: persistence of job records and their status machine
//! - `ResultStore`: object storage for result files with signed links
//! - `ProcessorRegistry`: `(type, module)` to processor lookup
//! - `JobWorker`: polls pending jobs and runs them under a timeout
//! - `JobsService`: caller-facing operations (create, cancel, retry, delete, cleanup)
//! - `TempFileManager`: sandboxed staging files for results

pub mod cancellation;
pub mod completion;
pub mod context;
pub mod error;
pub mod postgres;
pub mod registry;
pub mod results;
pub mod service;
pub mod store;
pub mod temp;
pub mod types;
pub mod worker;

pub use cancellation::{CancellationToken, InFlightGuard, InFlightJobs};
pub use completion::JobCompleter;
pub use context::{JobContext, ProgressReporter};
pub use error::JobError;
pub use postgres::PostgresJobStore;
pub use registry::{
    processor_fn, Processor, ProcessorError, ProcessorOutput, ProcessorRegistry, ProcessorRegistryBuilder,
    RegistryError, ResultFile,
};
pub use results::{InMemoryResultStore, LocalResultStore, ResultStore, ResultStoreError};
pub use service::{CleanupReport, JobsService};
pub use store::{InMemoryJobStore, JobStore};
pub use temp::{TempFileError, TempFileManager};
pub use types::{Job, JobCompletion, JobModule, JobStatus, JobType, NewJob, ProcessorKey};
pub use worker::{JobOutcome, JobWorker, ShutdownReport, WorkerConfig, WorkerError};

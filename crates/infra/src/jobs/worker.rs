//! The job worker: lifecycle driving, timeout race, polling, cleanup and drain.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use backoffice_core::JobId;

use crate::config::JobQueueConfig;

use super::cancellation::InFlightJobs;
use super::completion::JobCompleter;
use super::context::JobContext;
use super::error::JobError;
use super::registry::{ProcessorError, ProcessorOutput, ProcessorRegistry};
use super::service::JobsService;
use super::store::JobStore;
use super::types::Job;

/// Worker tuning, usually derived from [`JobQueueConfig`].
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub job_timeout: Duration,
    /// Advisory; only the poller consults it.
    pub max_concurrent: usize,
    pub poll_interval: Duration,
    pub cleanup_interval: Duration,
    pub shutdown_timeout: Duration,
    /// Sleep between in-flight checks while draining.
    pub drain_check_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from(&JobQueueConfig::default())
    }
}

impl From<&JobQueueConfig> for WorkerConfig {
    fn from(config: &JobQueueConfig) -> Self {
        Self {
            job_timeout: config.job_timeout,
            max_concurrent: config.max_concurrent.max(1),
            poll_interval: config.poll_interval,
            cleanup_interval: config.cleanup_interval,
            shutdown_timeout: config.shutdown_timeout,
            drain_check_interval: Duration::from_millis(100),
        }
    }
}

impl WorkerConfig {
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Why `process_job` did not run a job at all.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkerError {
    #[error("worker is shutting down; new jobs are rejected")]
    ShuttingDown,

    #[error("job {0} is already running on this worker")]
    AlreadyRunning(JobId),

    /// The job could not be moved to processing (missing, foreign, or not pending).
    #[error("job could not be started: {0}")]
    NotStarted(#[source] JobError),
}

/// How a started job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(Job),
    Failed { job_id: JobId, message: String },
}

impl JobOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, JobOutcome::Completed(_))
    }
}

/// Result of a graceful shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Jobs still running when the drain window closed.
    pub stranded: Vec<JobId>,
    pub waited: Duration,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.stranded.is_empty()
    }
}

struct WorkerInner {
    store: Arc<dyn JobStore>,
    registry: Arc<ProcessorRegistry>,
    completer: JobCompleter,
    in_flight: Arc<InFlightJobs>,
    config: WorkerConfig,
    shutting_down: AtomicBool,
    stop: watch::Sender<bool>,
}

/// Runs jobs: one `process_job` call drives one job from pending to a final state.
///
/// Cheap to clone; clones share the in-flight set and the shutdown flag.
#[derive(Clone)]
pub struct JobWorker {
    inner: Arc<WorkerInner>,
}

impl std::fmt::Debug for JobWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobWorker")
            .field("config", &self.inner.config)
            .field("in_flight", &self.inner.in_flight.len())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

impl JobWorker {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<ProcessorRegistry>,
        completer: JobCompleter,
        in_flight: Arc<InFlightJobs>,
        config: WorkerConfig,
    ) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            inner: Arc::new(WorkerInner {
                store,
                registry,
                completer,
                in_flight,
                config,
                shutting_down: AtomicBool::new(false),
                stop,
            }),
        }
    }

    pub fn in_flight(&self) -> &Arc<InFlightJobs> {
        &self.inner.in_flight
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Run one job through its lifecycle.
    ///
    /// `Err` means the job was never started. Once started, every failure
    /// (processor error, panic, timeout, completion failure) is recorded on the
    /// job and reported as `JobOutcome::Failed`.
    pub async fn process_job(&self, job_id: JobId) -> Result<JobOutcome, WorkerError> {
        if self.is_shutting_down() {
            return Err(WorkerError::ShuttingDown);
        }

        let guard = self
            .inner
            .in_flight
            .register(job_id)
            .ok_or(WorkerError::AlreadyRunning(job_id))?;

        let job = self
            .inner
            .store
            .mark_processing(job_id)
            .await
            .map_err(WorkerError::NotStarted)?;

        info!(job_id = %job.id, user_id = %job.user_id, key = %job.processor_key(), "job started");

        let Some(processor) = self.inner.registry.get(job.processor_key()) else {
            let message = format!("no processor registered for {}", job.processor_key());
            error!(job_id = %job.id, "{message}");
            return Ok(self.fail(&job, message).await);
        };

        let ctx = JobContext::new(&job, Arc::clone(&self.inner.store), guard.token().clone());
        let mut handle = tokio::spawn(async move { processor.process(ctx).await });

        let raced = tokio::time::timeout(self.inner.config.job_timeout, &mut handle).await;
        let message = match raced {
            Ok(Ok(Ok(output))) => match self.inner.completer.complete(&job, output).await {
                Ok(completed) => {
                    info!(job_id = %job.id, "job finished");
                    return Ok(JobOutcome::Completed(completed));
                }
                Err(err) => err.to_string(),
            },
            Ok(Ok(Err(err))) => err.to_string(),
            Ok(Err(join_err)) if join_err.is_panic() => "processor panicked".to_string(),
            Ok(Err(join_err)) => format!("processor task ended unexpectedly: {join_err}"),
            Err(_) => {
                // The task keeps running detached; it can only notice the token.
                guard.token().cancel();
                self.discard_late_output(job.id, handle);
                format!(
                    "job timed out after {} ms",
                    self.inner.config.job_timeout.as_millis()
                )
            }
        };

        Ok(self.fail(&job, message).await)
    }

    /// Remove whatever staging file a timed-out processor still produces.
    fn discard_late_output(&self, job_id: JobId, handle: JoinHandle<Result<ProcessorOutput, ProcessorError>>) {
        let temp = self.inner.completer.temp().clone();
        tokio::spawn(async move {
            let Ok(Ok(output)) = handle.await else {
                return;
            };
            if let Some(file) = output.file {
                debug!(job_id = %job_id, path = %file.path.display(), "discarding output of timed-out job");
                temp.remove_or_retry(&file.path).await;
            }
        });
    }

    /// Best-effort failure bookkeeping; never propagates.
    async fn fail(&self, job: &Job, message: String) -> JobOutcome {
        warn!(job_id = %job.id, error = %message, "job failed");
        match self.inner.store.mark_failed(job.id, &message).await {
            Ok(_) => {
                info!(target: "audit", action = "job.fail", job_id = %job.id, user_id = %job.user_id, error = %message, "job failed");
            }
            Err(err) => {
                error!(job_id = %job.id, error = %err, "failed to mark job as failed");
            }
        }
        JobOutcome::Failed {
            job_id: job.id,
            message,
        }
    }

    /// Periodically sweep expired results until shutdown.
    pub fn start_cleanup(&self, service: Arc<JobsService>) -> JoinHandle<()> {
        let mut stop = self.inner.stop.subscribe();
        let period = self.inner.config.cleanup_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately; skip it so the sweep runs one period after start.
            ticker.tick().await;
            loop {
                if *stop.borrow() {
                    break;
                }
                tokio::select! {
                    _ = ticker.tick() => {
                        match service.cleanup_expired(chrono::Utc::now()).await {
                            Ok(report) => debug!(deleted = report.deleted_jobs, "expired job sweep finished"),
                            Err(err) => error!(error = %err, "expired job sweep failed"),
                        }
                    }
                    changed = stop.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("cleanup loop stopped");
        })
    }

    /// Poll for pending jobs and start them, up to `max_concurrent` in flight.
    pub fn start_polling(&self) -> JoinHandle<()> {
        let worker = self.clone();
        let mut stop = self.inner.stop.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(worker.inner.config.poll_interval);
            loop {
                if *stop.borrow() {
                    break;
                }
                tokio::select! {
                    _ = ticker.tick() => {
                        worker.poll_once().await;
                    }
                    changed = stop.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("polling loop stopped");
        })
    }

    /// One polling round. Returns the ids of the jobs it started.
    pub async fn poll_once(&self) -> Vec<JobId> {
        if self.is_shutting_down() {
            return Vec::new();
        }
        let max = self.inner.config.max_concurrent;
        let pending = match self.inner.store.find_pending(max * 2).await {
            Ok(jobs) => jobs,
            Err(err) => {
                error!(error = %err, "failed to fetch pending jobs");
                return Vec::new();
            }
        };

        let mut started = Vec::new();
        for job in pending {
            if self.inner.in_flight.len() + started.len() >= max {
                break;
            }
            if self.inner.in_flight.contains(job.id) {
                continue;
            }
            let worker = self.clone();
            let job_id = job.id;
            tokio::spawn(async move {
                if let Err(err) = worker.process_job(job_id).await {
                    debug!(job_id = %job_id, error = %err, "polled job not started");
                }
            });
            started.push(job_id);
        }
        started
    }

    /// Stop accepting work, stop background loops, then wait for running jobs
    /// to finish or the drain window to close. Stranded jobs are left running.
    pub async fn graceful_shutdown(&self) -> ShutdownReport {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        self.inner.stop.send_replace(true);
        info!(in_flight = self.inner.in_flight.len(), "worker shutting down");

        let started = tokio::time::Instant::now();
        loop {
            if self.inner.in_flight.is_empty() {
                let waited = started.elapsed();
                info!(waited_ms = waited.as_millis() as u64, "all jobs drained");
                return ShutdownReport {
                    stranded: Vec::new(),
                    waited,
                };
            }
            if started.elapsed() >= self.inner.config.shutdown_timeout {
                let stranded = self.inner.in_flight.ids();
                warn!(count = stranded.len(), jobs = ?stranded, "shutdown timeout reached; jobs still running");
                return ShutdownReport {
                    stranded,
                    waited: started.elapsed(),
                };
            }
            tokio::time::sleep(self.inner.config.drain_check_interval).await;
        }
    }
}

//! End-to-end job lifecycle over the in-memory stores.
//!
//! Submit through the service, run through the worker, persist through the
//! completer, and check what callers can observe afterwards.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use backoffice_core::{CompanyId, UserId};
use backoffice_infra::jobs::{
    processor_fn, InFlightJobs, InMemoryJobStore, InMemoryResultStore, JobCompleter, JobError, JobModule,
    JobOutcome, JobStatus, JobStore, JobType, JobWorker, JobsService, NewJob, ProcessorError, ProcessorKey,
    ProcessorOutput, ProcessorRegistry, TempFileManager, WorkerConfig,
};

struct Queue {
    _dir: tempfile::TempDir,
    store: Arc<InMemoryJobStore>,
    results: Arc<InMemoryResultStore>,
    service: Arc<JobsService>,
    worker: JobWorker,
}

fn registry(temp: TempFileManager) -> ProcessorRegistry {
    ProcessorRegistry::builder()
        .register(
            ProcessorKey::export(JobModule::Employees),
            processor_fn(move |ctx| {
                let temp = temp.clone();
                async move {
                    ctx.report_progress(40).await;
                    let path = temp
                        .create(ctx.job_id, "employees.csv", b"id,name\n1,Ann\n2,Bo\n")
                        .await?;
                    Ok::<_, ProcessorError>(ProcessorOutput::file(path, "employees.csv"))
                }
            }),
        )
        .unwrap()
        .register(
            ProcessorKey::export(JobModule::Products),
            processor_fn(|_ctx| async {
                tokio::time::sleep(Duration::from_secs(600)).await;
                Ok(ProcessorOutput::default())
            }),
        )
        .unwrap()
        .build()
}

fn queue(config: WorkerConfig) -> Queue {
    let dir = tempfile::tempdir().unwrap();
    let store = InMemoryJobStore::arc();
    let results = Arc::new(InMemoryResultStore::new());
    let temp = TempFileManager::new(dir.path(), Duration::from_millis(10)).unwrap();
    let registry = Arc::new(registry(temp.clone()));
    let in_flight = InFlightJobs::new();
    let completer = JobCompleter::new(
        store.clone(),
        results.clone(),
        temp,
        10 * 1024 * 1024,
        Duration::from_secs(24 * 3600),
    );
    let service = Arc::new(JobsService::new(
        store.clone(),
        results.clone(),
        registry.clone(),
        in_flight.clone(),
    ));
    let worker = JobWorker::new(store.clone(), registry, completer, in_flight, config);
    Queue {
        _dir: dir,
        store,
        results,
        service,
        worker,
    }
}

fn export(user: UserId, module: JobModule) -> NewJob {
    NewJob::new(user, CompanyId::new(), JobType::Export, module, format!("{module} export"))
}

#[tokio::test]
async fn export_job_runs_to_completion_with_a_signed_link() {
    let q = queue(WorkerConfig::default());
    let user = UserId::new();

    let job = q.service.create_job(export(user, JobModule::Employees)).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);

    let outcome = q.worker.process_job(job.id).await.unwrap();
    assert!(outcome.is_completed());

    let done = q.service.get_job(job.id, user).await.unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.progress, 100);
    assert!(done.started_at.is_some() && done.completed_at.is_some());
    let link = q.service.result_link(job.id, user, Utc::now()).await.unwrap();
    assert!(!link.is_empty());
    assert_eq!(q.results.paths(), vec![done.file_path.clone().unwrap()]);
    assert!(!q.service.has_active_job(user).await.unwrap());
}

#[tokio::test]
async fn back_to_back_submissions_are_rejected() {
    let q = queue(WorkerConfig::default());
    let user = UserId::new();

    q.service.create_job(export(user, JobModule::Employees)).await.unwrap();
    let second = q.service.create_job(export(user, JobModule::Products)).await;

    assert_eq!(second.unwrap_err(), JobError::AlreadyProcessing);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_submissions_yield_exactly_one_job() {
    let q = queue(WorkerConfig::default());
    let user = UserId::new();

    let attempts: Vec<_> = (0..16)
        .map(|_| {
            let service = q.service.clone();
            tokio::spawn(async move { service.create_job(export(user, JobModule::Employees)).await })
        })
        .collect();

    let mut created = 0;
    let mut rejected = 0;
    for attempt in attempts {
        match attempt.await.unwrap() {
            Ok(_) => created += 1,
            Err(JobError::AlreadyProcessing) => rejected += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(created, 1);
    assert_eq!(rejected, 15);
}

#[tokio::test(start_paused = true)]
async fn slow_processor_is_failed_by_the_timeout() {
    let q = queue(WorkerConfig::default().with_job_timeout(Duration::from_secs(30)));
    let user = UserId::new();
    let job = q.service.create_job(export(user, JobModule::Products)).await.unwrap();

    let outcome = q.worker.process_job(job.id).await.unwrap();

    assert!(matches!(outcome, JobOutcome::Failed { ref message, .. } if message.contains("timed out")));
    let failed = q.service.get_job(job.id, user).await.unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(q.worker.in_flight().is_empty());

    // A failed job frees the slot and can be re-armed explicitly.
    let retried = q.service.retry_job(job.id, user).await.unwrap();
    assert_eq!(retried.status, JobStatus::Pending);
}

#[tokio::test]
async fn cancelled_job_is_not_started() {
    let q = queue(WorkerConfig::default());
    let user = UserId::new();
    let job = q.service.create_job(export(user, JobModule::Employees)).await.unwrap();
    q.service.cancel_job(job.id, user).await.unwrap();

    let started = q.worker.process_job(job.id).await;
    assert!(started.is_err());
    assert!(q.worker.in_flight().is_empty());
    assert!(q.results.is_empty());
    assert_eq!(
        q.service.get_job(job.id, user).await.unwrap().status,
        JobStatus::Cancelled
    );
}

#[tokio::test]
async fn expired_results_are_swept() {
    let q = queue(WorkerConfig::default());
    let user = UserId::new();
    let job = q.service.create_job(export(user, JobModule::Employees)).await.unwrap();
    q.worker.process_job(job.id).await.unwrap();

    let later = Utc::now() + chrono::Duration::days(2);
    assert_eq!(
        q.service.result_link(job.id, user, later).await,
        Err(JobError::Expired)
    );

    let report = q.service.cleanup_expired(later).await.unwrap();
    assert_eq!(report.deleted_jobs, 1);
    assert!(q.results.is_empty());
    assert!(q.service.recent_jobs(user).await.unwrap().is_empty());
}

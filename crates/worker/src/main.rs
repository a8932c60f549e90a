use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use backoffice_infra::jobs::{
    InFlightJobs, JobCompleter, JobModule, JobWorker, JobsService, LocalResultStore, PostgresJobStore, ProcessorKey,
    ProcessorRegistry, TempFileManager, WorkerConfig,
};
use backoffice_infra::journals::{
    JournalEngine, JournalRepository, PosAggregatesExportProcessor, PosJournalsProcessor, PostgresJournalRepository,
};
use backoffice_infra::{JobQueueConfig, MIGRATOR};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    backoffice_observability::init();

    let config = JobQueueConfig::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_concurrent as u32 + 5)
        .connect(config.database_url()?)
        .await
        .context("failed to connect to postgres")?;
    MIGRATOR.run(&pool).await.context("failed to run migrations")?;

    let store = Arc::new(PostgresJobStore::new(pool.clone()));
    let results = Arc::new(LocalResultStore::new(
        &config.result_store_dir,
        config.result_base_url.clone(),
        &config.result_signing_key,
    ));
    let temp = TempFileManager::new(&config.temp_dir, config.local_file_retry_delay)?;
    let journals: Arc<dyn JournalRepository> = Arc::new(PostgresJournalRepository::new(pool));

    let registry = Arc::new(
        ProcessorRegistry::builder()
            .register(
                ProcessorKey::import(JobModule::PosJournals),
                PosJournalsProcessor::new(JournalEngine::new(journals.clone(), config.journal_chunk_size)),
            )?
            .register(
                ProcessorKey::export(JobModule::PosAggregates),
                PosAggregatesExportProcessor::new(journals, temp.clone()),
            )?
            .build(),
    );
    tracing::info!(processors = registry.len(), "processor registry built");

    let in_flight = InFlightJobs::new();
    let completer = JobCompleter::new(
        store.clone(),
        results.clone(),
        temp,
        config.max_result_bytes,
        config.result_expiration,
    );
    let service = Arc::new(JobsService::new(
        store.clone(),
        results,
        registry.clone(),
        in_flight.clone(),
    ));
    let worker = JobWorker::new(store, registry, completer, in_flight, WorkerConfig::from(&config));

    let cleanup = worker.start_cleanup(service);
    let polling = worker.start_polling();
    tracing::info!(
        max_concurrent = config.max_concurrent,
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        "job worker started"
    );

    shutdown_signal().await;
    tracing::info!("shutdown signal received, draining in-flight jobs");

    let report = worker.graceful_shutdown().await;
    if report.is_clean() {
        tracing::info!(waited_ms = report.waited.as_millis() as u64, "job worker stopped");
    } else {
        tracing::warn!(stranded = report.stranded.len(), "job worker stopped with jobs still running");
    }

    let _ = tokio::join!(cleanup, polling);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

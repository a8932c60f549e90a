//! Processor contract and the `(type, module)` routing table.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use super::context::JobContext;
use super::temp::TempFileError;
use super::types::{JobModule, JobType, ProcessorKey};

/// A local staging file produced by a processor, to be persisted as the job result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultFile {
    pub path: PathBuf,
    pub file_name: String,
}

/// What a processor hands back on success.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProcessorOutput {
    pub file: Option<ResultFile>,
    pub import_results: Option<serde_json::Value>,
}

impl ProcessorOutput {
    pub fn file(path: impl Into<PathBuf>, file_name: impl Into<String>) -> Self {
        Self {
            file: Some(ResultFile {
                path: path.into(),
                file_name: file_name.into(),
            }),
            import_results: None,
        }
    }

    pub fn import_results(results: serde_json::Value) -> Self {
        Self {
            file: None,
            import_results: Some(results),
        }
    }
}

/// Processor failure. The display text becomes the job's error message.
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("invalid job metadata: {0}")]
    InvalidMetadata(String),

    #[error("job was cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    TempFile(#[from] TempFileError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Performs the work for one `(type, module)` combination.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, ctx: JobContext) -> Result<ProcessorOutput, ProcessorError>;
}

/// Adapter turning an async closure into a [`Processor`].
pub struct FnProcessor<F>(F);

/// Wrap an async closure as a processor.
pub fn processor_fn<F, Fut>(f: F) -> FnProcessor<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ProcessorOutput, ProcessorError>> + Send + 'static,
{
    FnProcessor(f)
}

#[async_trait]
impl<F, Fut> Processor for FnProcessor<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ProcessorOutput, ProcessorError>> + Send + 'static,
{
    async fn process(&self, ctx: JobContext) -> Result<ProcessorOutput, ProcessorError> {
        (self.0)(ctx).await
    }
}

/// Startup configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("processor already registered for {0}")]
    DuplicateProcessor(ProcessorKey),
}

/// Immutable routing table built once at startup and handed to the worker.
#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    processors: HashMap<ProcessorKey, Arc<dyn Processor>>,
}

impl ProcessorRegistry {
    pub fn builder() -> ProcessorRegistryBuilder {
        ProcessorRegistryBuilder::default()
    }

    pub fn get(&self, key: ProcessorKey) -> Option<Arc<dyn Processor>> {
        self.processors.get(&key).cloned()
    }

    pub fn contains(&self, key: ProcessorKey) -> bool {
        self.processors.contains_key(&key)
    }

    /// Modules with a processor registered for `job_type`, in a stable order.
    pub fn available_modules(&self, job_type: JobType) -> Vec<JobModule> {
        let mut modules: Vec<_> = self
            .processors
            .keys()
            .filter(|key| key.job_type == job_type)
            .map(|key| key.module)
            .collect();
        modules.sort();
        modules
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}

impl std::fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<_> = self.processors.keys().map(ToString::to_string).collect();
        keys.sort();
        f.debug_struct("ProcessorRegistry").field("keys", &keys).finish()
    }
}

#[derive(Default)]
pub struct ProcessorRegistryBuilder {
    processors: HashMap<ProcessorKey, Arc<dyn Processor>>,
}

impl ProcessorRegistryBuilder {
    /// Register a processor; a second registration for the same key is rejected.
    pub fn register<P>(mut self, key: ProcessorKey, processor: P) -> Result<Self, RegistryError>
    where
        P: Processor + 'static,
    {
        self.register_arc(key, Arc::new(processor))?;
        Ok(self)
    }

    pub fn register_arc(&mut self, key: ProcessorKey, processor: Arc<dyn Processor>) -> Result<(), RegistryError> {
        if self.processors.contains_key(&key) {
            return Err(RegistryError::DuplicateProcessor(key));
        }
        self.processors.insert(key, processor);
        Ok(())
    }

    pub fn build(self) -> ProcessorRegistry {
        ProcessorRegistry {
            processors: self.processors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> impl Processor {
        processor_fn(|_ctx| async { Ok(ProcessorOutput::default()) })
    }

    #[test]
    fn duplicate_registration_is_a_startup_error() {
        let key = ProcessorKey::export(JobModule::Employees);
        let result = ProcessorRegistry::builder()
            .register(key, noop())
            .and_then(|b| b.register(key, noop()));

        assert!(matches!(result, Err(RegistryError::DuplicateProcessor(k)) if k == key));
    }

    #[test]
    fn available_modules_are_filtered_by_type() {
        let registry = ProcessorRegistry::builder()
            .register(ProcessorKey::export(JobModule::Products), noop())
            .unwrap()
            .register(ProcessorKey::export(JobModule::Employees), noop())
            .unwrap()
            .register(ProcessorKey::import(JobModule::PosJournals), noop())
            .unwrap()
            .build();

        assert_eq!(
            registry.available_modules(JobType::Export),
            vec![JobModule::Employees, JobModule::Products]
        );
        assert_eq!(registry.available_modules(JobType::Import), vec![JobModule::PosJournals]);
        assert!(registry.get(ProcessorKey::import(JobModule::Employees)).is_none());
    }
}

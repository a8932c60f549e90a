//! Cooperative cancellation and in-flight job tracking.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use backoffice_core::JobId;

/// A cancellation token handed to processors.
///
/// Cancellation is advisory: nothing is aborted. Processors poll
/// `is_cancelled()` (or await `cancelled()`) at convenient points and stop on
/// their own.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Signal every clone of this token.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as any token clone, so this only ends on cancel.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry of jobs currently executing on this process.
///
/// The only shared mutable state of the worker: `process_job` calls for
/// different jobs insert and remove concurrently, and shutdown polls the size.
#[derive(Debug, Default)]
pub struct InFlightJobs {
    jobs: Mutex<HashMap<JobId, CancellationToken>>,
}

impl InFlightJobs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a job; `None` when it is already running here.
    pub fn register(self: &Arc<Self>, job_id: JobId) -> Option<InFlightGuard> {
        let mut jobs = self.jobs.lock();
        if jobs.contains_key(&job_id) {
            return None;
        }
        let token = CancellationToken::new();
        jobs.insert(job_id, token.clone());
        Some(InFlightGuard {
            registry: Arc::clone(self),
            job_id,
            token,
        })
    }

    /// Signal a running job's token. Returns whether the job was in flight.
    pub fn cancel(&self, job_id: JobId) -> bool {
        match self.jobs.lock().get(&job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, job_id: JobId) -> bool {
        self.jobs.lock().contains_key(&job_id)
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<JobId> {
        let mut ids: Vec<_> = self.jobs.lock().keys().copied().collect();
        ids.sort();
        ids
    }
}

/// Removes its job from the in-flight registry when dropped, on every exit path.
#[derive(Debug)]
pub struct InFlightGuard {
    registry: Arc<InFlightJobs>,
    job_id: JobId,
    token: CancellationToken,
}

impl InFlightGuard {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.registry.jobs.lock().remove(&self.job_id);
    }
}

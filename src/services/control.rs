//! In-process control registry for running jobs
//!
//! Delivers pause/cancel requests to controller tasks in this process and
//! fans a worker shutdown out to all of them. Cross-process requests travel
//! through the job store's `control_request` column instead; the controller
//! checks both at chunk boundaries.
//!
//! RAII cleanup via `JobGuard`: a job is registered for exactly as long as its
//! controller holds the guard.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::types::ControlRequest;

/// Internal entry tracking a job's token and the strongest pending request
struct JobEntry {
    token: CancellationToken,
    request: Option<ControlRequest>,
}

/// RAII guard that removes the job from the registry when dropped.
/// Must be kept alive for the duration of job processing.
pub struct JobGuard {
    job_id: Uuid,
    registry: ControlRegistry,
}

impl JobGuard {
    /// Request currently pending for this job, if any
    pub fn requested(&self) -> Option<ControlRequest> {
        self.registry.requested(&self.job_id)
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.job_id);
    }
}

/// Thread-safe registry of jobs running in this process.
/// Per-job tokens are children of the shutdown token.
#[derive(Clone)]
pub struct ControlRegistry {
    jobs: Arc<Mutex<HashMap<Uuid, JobEntry>>>,
    shutdown: CancellationToken,
}

impl Default for ControlRegistry {
    fn default() -> Self {
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        }
    }
}

impl ControlRegistry {
    /// Register a job. Returns a `JobGuard` that must be held in scope
    /// during processing.
    pub fn register(&self, job_id: Uuid) -> JobGuard {
        self.jobs.lock().insert(
            job_id,
            JobEntry {
                token: self.shutdown.child_token(),
                request: None,
            },
        );
        JobGuard {
            job_id,
            registry: self.clone(),
        }
    }

    /// Signal a running job. Cancel overrides an earlier pause, never the
    /// other way round. Returns false if the job is not running here.
    pub fn signal(&self, job_id: &Uuid, request: ControlRequest) -> bool {
        let mut jobs = self.jobs.lock();
        match jobs.get_mut(job_id) {
            Some(entry) => {
                if entry.request != Some(ControlRequest::Cancel) {
                    entry.request = Some(request);
                }
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Pending request for a job. A shutdown without an explicit request
    /// reads as a pause.
    pub fn requested(&self, job_id: &Uuid) -> Option<ControlRequest> {
        let jobs = self.jobs.lock();
        let entry = jobs.get(job_id)?;
        match entry.request {
            Some(request) => Some(request),
            None if entry.token.is_cancelled() => Some(ControlRequest::Pause),
            None => None,
        }
    }

    pub fn running_jobs(&self) -> Vec<Uuid> {
        self.jobs.lock().keys().copied().collect()
    }

    /// Ask every running job to pause at its next chunk boundary
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Token cancelled on worker shutdown
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Remove a finished job. Called automatically by `JobGuard::drop`.
    fn remove(&self, job_id: &Uuid) {
        self.jobs.lock().remove(job_id);
    }
}

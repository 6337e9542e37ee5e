//! Job supervisor
//!
//! Owns the controller tasks of this worker: creates and starts jobs, routes
//! pause/resume/cancel, recovers jobs orphaned by a dead worker and drains
//! running jobs on shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::services::controller::{EngineContext, JobController};
use crate::types::{
    ControlRequest, CreateJobRequest, Job, JobStatus, MappingSetRef, CANCELLED_MESSAGE,
};

pub const ORPHANED_REASON: &str = "orphaned: worker stopped heartbeating";

pub const DEFAULT_HISTORY_LIMIT: i64 = 50;
pub const MAX_HISTORY_LIMIT: i64 = 500;

pub struct JobSupervisor {
    ctx: EngineContext,
    controller: Arc<JobController>,
    running: Arc<Mutex<HashMap<Uuid, JoinHandle<Job>>>>,
}

impl JobSupervisor {
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            controller: Arc::new(JobController::new(ctx.clone())),
            ctx,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    /// Validate, pin the mapping set, store the job and start it
    pub async fn create(&self, request: CreateJobRequest) -> Result<Job, EngineError> {
        request.validate().map_err(EngineError::InvalidRequest)?;

        let mapping = match &request.mapping_set {
            MappingSetRef::Id(id) => self.ctx.mappings.get(*id).await?,
            MappingSetRef::Name(name) => self.ctx.mappings.latest(name).await?,
        }
        .ok_or_else(|| {
            EngineError::InvalidRequest(format!("mapping set {:?} not found", request.mapping_set))
        })?;
        mapping.validate().map_err(EngineError::InvalidRequest)?;

        let batch_size = request.effective_batch_size();
        let job = Job::new(
            request.kind,
            request.source,
            request.target,
            mapping.id,
            batch_size,
            request.dry_run,
        );
        self.ctx.store.insert(&job).await?;
        info!(
            "Created {} job {} with mapping set {} v{}",
            job.kind.as_str(),
            job.id,
            mapping.name,
            mapping.version
        );
        self.notify(&job).await;

        self.start_job(job.id, "start").await
    }

    /// Continue a paused job from its cursor
    pub async fn resume(&self, id: Uuid) -> Result<Job, EngineError> {
        self.start_job(id, "resume").await
    }

    async fn start_job(&self, id: Uuid, action: &'static str) -> Result<Job, EngineError> {
        self.prune_finished();
        if self.is_running(&id) {
            return Err(EngineError::AlreadyRunning(id));
        }

        let job = match self.ctx.store.claim(id).await? {
            Some(job) => job,
            None => {
                return Err(match self.ctx.store.get(id).await? {
                    None => EngineError::NotFound(id),
                    Some(job) if job.status == JobStatus::Processing => {
                        EngineError::AlreadyRunning(id)
                    }
                    Some(job) => EngineError::InvalidTransition {
                        job_id: id,
                        status: job.status,
                        action,
                    },
                })
            }
        };

        let guard = self.ctx.control.register(id);
        let controller = self.controller.clone();
        let snapshot = job.clone();
        let handle = tokio::spawn(async move { controller.run(job, guard).await });
        self.running.lock().insert(id, handle);

        Ok(snapshot)
    }

    /// Ask a processing job to pause at its next chunk boundary.
    /// Returns false if the job is not processing.
    pub async fn pause(&self, id: Uuid) -> Result<bool, EngineError> {
        let accepted = self.ctx.store.request_control(id, ControlRequest::Pause).await?;
        let signalled = self.ctx.control.signal(&id, ControlRequest::Pause);
        if accepted || signalled {
            info!("Pause requested for job {}", id);
            return Ok(true);
        }
        self.status(id).await.map(|_| false)
    }

    /// Cancel a job. Idle jobs fail immediately; processing jobs stop at
    /// their next chunk boundary. Returns false for finished jobs.
    pub async fn cancel(&self, id: Uuid) -> Result<bool, EngineError> {
        let idle = [JobStatus::Pending, JobStatus::Paused];
        if let Some(job) = self
            .ctx
            .store
            .transition(id, &idle, JobStatus::Failed, Some(CANCELLED_MESSAGE))
            .await?
        {
            info!("Cancelled idle job {}", id);
            self.notify(&job).await;
            return Ok(true);
        }

        let accepted = self.ctx.store.request_control(id, ControlRequest::Cancel).await?;
        let signalled = self.ctx.control.signal(&id, ControlRequest::Cancel);
        if accepted || signalled {
            info!("Cancel requested for running job {}", id);
            return Ok(true);
        }
        self.status(id).await.map(|_| false)
    }

    pub async fn status(&self, id: Uuid) -> Result<Job, EngineError> {
        self.ctx
            .store
            .get(id)
            .await?
            .ok_or(EngineError::NotFound(id))
    }

    /// Most recent jobs first
    pub async fn history(&self, limit: Option<i64>) -> Result<Vec<Job>, EngineError> {
        let limit = limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .clamp(1, MAX_HISTORY_LIMIT);
        Ok(self.ctx.store.list_recent(limit).await?)
    }

    /// Pause jobs left in `processing` by a worker that stopped heartbeating
    pub async fn recover_orphans(&self) -> Result<Vec<Uuid>, EngineError> {
        let stale_after = chrono::Duration::from_std(self.ctx.settings.stale_after)
            .map_err(anyhow::Error::from)?;
        let threshold = Utc::now() - stale_after;
        let exclude = self.ctx.control.running_jobs();

        let paused = self
            .ctx
            .store
            .pause_stale(threshold, ORPHANED_REASON, &exclude)
            .await?;
        for id in &paused {
            warn!("Paused orphaned job {} (no heartbeat since {})", id, threshold);
            if let Ok(Some(job)) = self.ctx.store.get(*id).await {
                self.notify(&job).await;
            }
        }
        Ok(paused)
    }

    /// Periodically run `recover_orphans` until shutdown
    pub fn spawn_stale_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let supervisor = self.clone();
        let shutdown = self.ctx.control.shutdown_token();
        let period = (self.ctx.settings.stale_after / 3).max(Duration::from_secs(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = supervisor.recover_orphans().await {
                            error!("Stale job sweep failed: {}", e);
                        }
                    }
                }
            }
        })
    }

    pub fn is_running(&self, id: &Uuid) -> bool {
        self.running
            .lock()
            .get(id)
            .map_or(false, |handle| !handle.is_finished())
    }

    /// Wait for a job's controller task, if this supervisor started it
    pub async fn join(&self, id: Uuid) -> Option<Job> {
        let handle = self.running.lock().remove(&id)?;
        match handle.await {
            Ok(job) => Some(job),
            Err(e) => {
                error!("Controller task of job {} panicked: {}", id, e);
                None
            }
        }
    }

    pub async fn join_all(&self) -> Vec<Job> {
        let handles: Vec<(Uuid, JoinHandle<Job>)> = self.running.lock().drain().collect();
        let mut jobs = Vec::with_capacity(handles.len());
        for (id, handle) in handles {
            match handle.await {
                Ok(job) => jobs.push(job),
                Err(e) => error!("Controller task of job {} panicked: {}", id, e),
            }
        }
        jobs
    }

    /// Pause every running job at its next chunk boundary and wait for them
    pub async fn shutdown(&self) -> Vec<Job> {
        let running = self.ctx.control.running_jobs();
        if !running.is_empty() {
            info!("Pausing {} running job(s) for shutdown", running.len());
        }
        self.ctx.control.shutdown();
        self.join_all().await
    }

    fn prune_finished(&self) {
        self.running.lock().retain(|_, handle| !handle.is_finished());
    }

    async fn notify(&self, job: &Job) {
        if let Err(e) = self.ctx.notifier.notify(job).await {
            warn!("Failed to publish status for job {}: {}", job.id, e);
        }
    }
}

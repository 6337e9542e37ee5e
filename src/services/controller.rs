//! Job controller: drives one claimed job from `processing` to its next state
//!
//! Per chunk: check for pause/cancel, read, map, write, add the outcome to the
//! counters, advance the cursor, heartbeat. Row and batch failures only move
//! counters; setup problems, lost sources and a destination that stays down
//! fail the job.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::error::EngineError;
use crate::services::control::{ControlRegistry, JobGuard};
use crate::services::job_store::{JobStore, MappingRepository};
use crate::services::mapping::resolve_record;
use crate::services::notifier::JobNotifier;
use crate::services::progress::ProgressReporter;
use crate::services::source::{RecordSource, SourceProvider};
use crate::services::writer::{BatchWriter, DestinationProvider};
use crate::types::{ControlRequest, Job, JobStatus, MappingSet, CANCELLED_MESSAGE};

pub const PAUSED_BY_OPERATOR: &str = "paused by operator";
pub const PAUSED_FOR_SHUTDOWN: &str = "worker shutting down";
pub const UNMAPPABLE_RECORD: &str = "unmappable record";

/// Tunables shared by the controller and the supervisor
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Minimum time between progress flushes
    pub heartbeat_interval: Duration,
    /// Re-read the stored control request every N chunks
    pub status_poll_every: u64,
    /// Consecutive unreachable-destination batches before the job fails
    pub max_consecutive_write_failures: u32,
    /// Heartbeat age after which a processing job counts as orphaned
    pub stale_after: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(2),
            status_poll_every: 10,
            max_consecutive_write_failures: 5,
            stale_after: Duration::from_secs(900),
        }
    }
}

/// Everything a controller needs, behind trait objects
#[derive(Clone)]
pub struct EngineContext {
    pub store: Arc<dyn JobStore>,
    pub mappings: Arc<dyn MappingRepository>,
    pub sources: Arc<dyn SourceProvider>,
    pub destinations: Arc<dyn DestinationProvider>,
    pub notifier: Arc<dyn JobNotifier>,
    pub control: ControlRegistry,
    pub settings: EngineSettings,
}

/// How the chunk loop ended without an error
enum RunEnd {
    /// Source exhausted; the source is kept so it can release what it consumed
    Exhausted(Option<Box<dyn RecordSource>>),
    Paused(&'static str),
    Cancelled,
}

pub struct JobController {
    ctx: EngineContext,
}

impl JobController {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Run a job that was already claimed (status `processing`). Returns the
    /// job as last persisted.
    pub async fn run(&self, mut job: Job, guard: JobGuard) -> Job {
        info!(
            "Starting {} job {} (batch size {}, resuming at {:?})",
            job.kind.as_str(),
            job.id,
            job.batch_size,
            job.cursor
        );

        let mut reporter = ProgressReporter::new(
            self.ctx.store.clone(),
            self.ctx.notifier.clone(),
            self.ctx.settings.heartbeat_interval,
        );

        let mut consumed_source = None;
        match self.execute(&mut job, &guard, &mut reporter).await {
            Ok(RunEnd::Exhausted(source)) => {
                job.status = if job.failed > 0 {
                    JobStatus::CompletedWithErrors
                } else {
                    JobStatus::Completed
                };
                job.completed_at = Some(Utc::now());
                consumed_source = source;
            }
            Ok(RunEnd::Paused(reason)) => {
                job.status = JobStatus::Paused;
                job.pause_reason = Some(reason.to_string());
            }
            Ok(RunEnd::Cancelled) => {
                job.status = JobStatus::Failed;
                job.error_message = Some(CANCELLED_MESSAGE.to_string());
                job.completed_at = Some(Utc::now());
            }
            Err(e) => {
                error!("Job {} failed: {}", job.id, e);
                job.status = JobStatus::Failed;
                job.error_message = Some(e.to_string());
                job.completed_at = Some(Utc::now());
            }
        }

        let persisted = match reporter.flush(&mut job).await {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to persist final state of job {}: {:#}", job.id, e);
                false
            }
        };
        if let Err(e) = self.ctx.store.clear_control(job.id).await {
            warn!("Failed to clear control request of job {}: {:#}", job.id, e);
        }

        if let Some(mut source) = consumed_source.filter(|_| persisted) {
            if let Err(e) = source.release_consumed().await {
                warn!("Job {} finished but its source was not released: {:#}", job.id, e);
            }
        }

        info!(
            "Job {} is {}: {} processed ({} succeeded, {} failed, {} skipped)",
            job.id, job.status, job.processed, job.succeeded, job.failed, job.skipped
        );
        job
    }

    async fn execute(
        &self,
        job: &mut Job,
        guard: &JobGuard,
        reporter: &mut ProgressReporter,
    ) -> Result<RunEnd, EngineError> {
        let mapping = self.load_mapping(job).await?;

        let mut source = self.ctx.sources.open(job).await?;
        if let Some(hint) = source.total_hint() {
            job.total_records = Some(hint.max(job.processed));
        }

        if job.dry_run {
            let total = source
                .count()
                .await
                .map_err(|e| EngineError::Setup(format!("cannot count records: {:#}", e)))?;
            info!("Dry run of job {}: {} records would be processed", job.id, total);
            job.total_records = Some(total);
            return Ok(RunEnd::Exhausted(None));
        }

        let destination = self.ctx.destinations.destination(&job.target)?;
        let writer = BatchWriter::new(destination, job.target.clone());
        writer.check().await.map_err(|e| {
            EngineError::Setup(format!("destination {} is not usable: {}", job.target.name, e))
        })?;

        reporter.flush(job).await?;

        let batch_size = u64::from(job.batch_size.max(1));
        let mut batch_no = job.processed.div_ceil(batch_size);
        let mut chunks_read: u64 = 0;
        let mut unavailable_streak: u32 = 0;

        loop {
            if let Some(end) = self.check_control(job, guard, chunks_read).await? {
                return Ok(end);
            }

            let chunk = match source.next_chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => {
                    return Err(EngineError::Fatal(format!("source read failed: {:#}", e)))
                }
            };
            chunks_read += 1;
            batch_no += 1;

            let mut unmapped_failures = 0;
            let mut mapped = Vec::with_capacity(chunk.len());
            for row in chunk.rows {
                match row.record {
                    Ok(raw) => {
                        let record = resolve_record(&raw, &mapping);
                        if record.is_empty() {
                            unmapped_failures += 1;
                            job.record_error(format!("row {}", row.number), UNMAPPABLE_RECORD);
                        } else {
                            mapped.push((row.number, record));
                        }
                    }
                    Err(message) => {
                        unmapped_failures += 1;
                        job.record_error(format!("row {}", row.number), message);
                    }
                }
            }

            let outcome = writer.write_batch(batch_no, mapped).await;
            for entry in &outcome.errors {
                job.record_error(entry.context.clone(), entry.message.clone());
            }
            job.record_outcome(
                outcome.succeeded,
                outcome.failed + unmapped_failures,
                outcome.skipped,
            );
            job.cursor = Some(chunk.cursor);

            if outcome.unavailable {
                unavailable_streak += 1;
                if unavailable_streak >= self.ctx.settings.max_consecutive_write_failures {
                    return Err(EngineError::Fatal(format!(
                        "destination unavailable for {} consecutive batches",
                        unavailable_streak
                    )));
                }
            } else if outcome.total() > 0 {
                unavailable_streak = 0;
            }

            reporter.maybe_flush(job).await?;
        }

        Ok(RunEnd::Exhausted(Some(source)))
    }

    async fn load_mapping(&self, job: &Job) -> Result<MappingSet, EngineError> {
        let mapping = self
            .ctx
            .mappings
            .get(job.mapping_set_id)
            .await?
            .ok_or_else(|| {
                EngineError::Setup(format!("mapping set {} not found", job.mapping_set_id))
            })?;
        mapping
            .validate()
            .map_err(|e| EngineError::Setup(format!("mapping set {} is invalid: {}", mapping.id, e)))?;
        Ok(mapping)
    }

    /// Chunk-boundary control check. The in-process registry is read every
    /// time; the store is read every `status_poll_every` chunks.
    async fn check_control(
        &self,
        job: &Job,
        guard: &JobGuard,
        chunks_read: u64,
    ) -> Result<Option<RunEnd>, EngineError> {
        let local = guard.requested();
        let poll_every = self.ctx.settings.status_poll_every.max(1);
        let stored = if local != Some(ControlRequest::Cancel) && chunks_read % poll_every == 0 {
            self.ctx.store.control_request(job.id).await?
        } else {
            None
        };

        let end = match (local, stored) {
            (Some(ControlRequest::Cancel), _) | (_, Some(ControlRequest::Cancel)) => {
                Some(RunEnd::Cancelled)
            }
            (_, Some(ControlRequest::Pause)) => Some(RunEnd::Paused(PAUSED_BY_OPERATOR)),
            (Some(ControlRequest::Pause), None) if self.ctx.control.is_shutting_down() => {
                Some(RunEnd::Paused(PAUSED_FOR_SHUTDOWN))
            }
            (Some(ControlRequest::Pause), None) => Some(RunEnd::Paused(PAUSED_BY_OPERATOR)),
            (None, None) => None,
        };
        Ok(end)
    }
}

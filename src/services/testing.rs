//! In-memory engine doubles shared by unit tests

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::{DestinationError, EngineError};
use crate::services::control::ControlRegistry;
use crate::services::controller::{EngineContext, EngineSettings};
use crate::services::job_store::{JobStore, MappingRepository};
use crate::services::mapping::as_timestamp;
use crate::services::notifier::BroadcastNotifier;
use crate::services::source::{Chunk, RecordSource, SourceProvider, SourceRow};
use crate::services::writer::{Destination, DestinationProvider};
use crate::types::{
    ControlRequest, FieldValue, Job, JobCursor, JobKind, JobStatus, MappedRecord, MappingRule,
    MappingSet, RawRecord, SourceLocator, TargetDescriptor, WriteMode,
};

pub type TestRow = std::result::Result<RawRecord, String>;

/// `n` lead rows; even rows have a blank CAPTADOR
pub fn lead_rows(n: usize) -> Vec<TestRow> {
    (1..=n)
        .map(|i| {
            let mut raw = RawRecord::new();
            raw.insert("ID", i.to_string());
            raw.insert("NAME", format!("Lead {}", i));
            raw.insert("CAPTADOR", if i % 2 == 0 { "  " } else { "Bruno" });
            raw.insert("SCOUTER_NAME", "Carla");
            Ok(raw)
        })
        .collect()
}

pub fn lead_mapping() -> MappingSet {
    MappingSet::new(
        "bitrix-leads",
        vec![
            MappingRule::new("crm_id", &["ID"]),
            MappingRule::new("name", &["NAME", "TITLE"]),
            MappingRule::new("scouter", &["CAPTADOR", "SCOUTER_NAME"]),
        ],
    )
}

pub fn sample_job(batch_size: u32) -> Job {
    Job::new(
        JobKind::CsvImport,
        SourceLocator::File {
            path: "/data/uploads/leads.csv".into(),
            delimiter: None,
        },
        TargetDescriptor::table("leads"),
        Uuid::nil(),
        batch_size,
        false,
    )
}

// ==========================================================================
// Job store
// ==========================================================================

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
}

impl MemoryJobStore {
    /// Write a control request the way another process would
    pub fn set_control(&self, id: Uuid, request: ControlRequest) {
        if let Some(job) = self.jobs.lock().get_mut(&id) {
            job.control_request = Some(request);
        }
    }

    pub fn set_heartbeat(&self, id: Uuid, at: DateTime<Utc>) {
        if let Some(job) = self.jobs.lock().get_mut(&id) {
            job.heartbeat_at = Some(at);
        }
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: &Job) -> Result<()> {
        self.jobs.lock().insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self.jobs.lock().get(&id).cloned())
    }

    async fn list_recent(&self, limit: i64) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self.jobs.lock().values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit.max(0) as usize);
        Ok(jobs)
    }

    async fn claim(&self, id: Uuid) -> Result<Option<Job>> {
        let mut jobs = self.jobs.lock();
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(None);
        };
        if !job.status.can_start() {
            return Ok(None);
        }
        let now = Utc::now();
        job.status = JobStatus::Processing;
        job.started_at.get_or_insert(now);
        job.heartbeat_at = Some(now);
        job.updated_at = now;
        job.pause_reason = None;
        job.control_request = None;
        Ok(Some(job.clone()))
    }

    async fn save(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.lock();
        let control = jobs.get(&job.id).and_then(|j| j.control_request);
        let mut stored = job.clone();
        stored.control_request = control;
        jobs.insert(job.id, stored);
        Ok(())
    }

    async fn request_control(&self, id: Uuid, request: ControlRequest) -> Result<bool> {
        let mut jobs = self.jobs.lock();
        match jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Processing => {
                if job.control_request != Some(ControlRequest::Cancel) {
                    job.control_request = Some(request);
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn control_request(&self, id: Uuid) -> Result<Option<ControlRequest>> {
        Ok(self.jobs.lock().get(&id).and_then(|j| j.control_request))
    }

    async fn clear_control(&self, id: Uuid) -> Result<()> {
        if let Some(job) = self.jobs.lock().get_mut(&id) {
            job.control_request = None;
        }
        Ok(())
    }

    async fn transition(
        &self,
        id: Uuid,
        from: &[JobStatus],
        to: JobStatus,
        reason: Option<&str>,
    ) -> Result<Option<Job>> {
        let mut jobs = self.jobs.lock();
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(None);
        };
        if !from.contains(&job.status) {
            return Ok(None);
        }
        job.status = to;
        job.pause_reason = reason.filter(|_| to == JobStatus::Paused).map(str::to_string);
        if to == JobStatus::Failed {
            if let Some(reason) = reason {
                job.error_message = Some(reason.to_string());
            }
        }
        if to.is_terminal() {
            job.completed_at = Some(Utc::now());
        }
        job.control_request = None;
        job.updated_at = Utc::now();
        Ok(Some(job.clone()))
    }

    async fn pause_stale(
        &self,
        older_than: DateTime<Utc>,
        reason: &str,
        exclude: &[Uuid],
    ) -> Result<Vec<Uuid>> {
        let mut paused = Vec::new();
        for job in self.jobs.lock().values_mut() {
            let beat = job.heartbeat_at.unwrap_or(job.updated_at);
            if job.status == JobStatus::Processing && beat < older_than && !exclude.contains(&job.id) {
                job.status = JobStatus::Paused;
                job.pause_reason = Some(reason.to_string());
                job.control_request = None;
                paused.push(job.id);
            }
        }
        Ok(paused)
    }
}

#[derive(Default)]
pub struct MemoryMappings {
    sets: Mutex<Vec<MappingSet>>,
}

impl MemoryMappings {
    pub fn add(&self, set: MappingSet) {
        self.sets.lock().push(set);
    }
}

#[async_trait]
impl MappingRepository for MemoryMappings {
    async fn get(&self, id: Uuid) -> Result<Option<MappingSet>> {
        Ok(self.sets.lock().iter().find(|s| s.id == id).cloned())
    }

    async fn latest(&self, name: &str) -> Result<Option<MappingSet>> {
        Ok(self
            .sets
            .lock()
            .iter()
            .filter(|s| s.name == name)
            .max_by_key(|s| s.version)
            .cloned())
    }
}

// ==========================================================================
// Source
// ==========================================================================

type ChunkHook = Arc<dyn Fn(u64) + Send + Sync>;

/// Serves a fixed row list as a file-like source with a row-offset cursor
#[derive(Default)]
pub struct MemorySourceProvider {
    rows: Arc<Vec<TestRow>>,
    hook: Mutex<Option<ChunkHook>>,
    gate: Mutex<Option<Arc<tokio::sync::Semaphore>>>,
    missing: AtomicBool,
    released: Arc<AtomicBool>,
}

impl MemorySourceProvider {
    pub fn new(rows: Vec<TestRow>) -> Self {
        Self {
            rows: Arc::new(rows),
            ..Default::default()
        }
    }

    /// Call `hook(n)` when the n-th chunk (1-based, per open) is handed out
    pub fn on_chunk(&self, hook: impl Fn(u64) + Send + Sync + 'static) {
        *self.hook.lock() = Some(Arc::new(hook));
    }

    pub fn clear_hook(&self) {
        *self.hook.lock() = None;
    }

    /// Every chunk waits for one permit
    pub fn gate(&self, semaphore: Arc<tokio::sync::Semaphore>) {
        *self.gate.lock() = Some(semaphore);
    }

    /// Behave like an upload that was deleted
    pub fn set_missing(&self, missing: bool) {
        self.missing.store(missing, Ordering::SeqCst);
    }

    pub fn released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceProvider for MemorySourceProvider {
    async fn open(&self, job: &Job) -> std::result::Result<Box<dyn RecordSource>, EngineError> {
        let position = match &job.cursor {
            None => 0,
            Some(JobCursor::RowOffset { rows }) => *rows as usize,
            Some(other) => {
                return Err(EngineError::ResumeInconsistency(format!("unexpected cursor {:?}", other)))
            }
        };
        if self.missing.load(Ordering::SeqCst) {
            let message = "upload is no longer readable".to_string();
            return Err(if job.cursor.is_some() {
                EngineError::ResumeInconsistency(message)
            } else {
                EngineError::Setup(message)
            });
        }
        Ok(Box::new(VecSource {
            rows: self.rows.clone(),
            position,
            batch_size: job.batch_size.max(1) as usize,
            chunks: 0,
            hook: self.hook.lock().clone(),
            gate: self.gate.lock().clone(),
            released: self.released.clone(),
        }))
    }
}

struct VecSource {
    rows: Arc<Vec<TestRow>>,
    position: usize,
    batch_size: usize,
    chunks: u64,
    hook: Option<ChunkHook>,
    gate: Option<Arc<tokio::sync::Semaphore>>,
    released: Arc<AtomicBool>,
}

#[async_trait]
impl RecordSource for VecSource {
    fn total_hint(&self) -> Option<u64> {
        Some(self.rows.len() as u64)
    }

    async fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        if let Some(gate) = &self.gate {
            gate.acquire().await?.forget();
        }
        if self.position >= self.rows.len() {
            return Ok(None);
        }
        let end = (self.position + self.batch_size).min(self.rows.len());
        let rows = self.rows[self.position..end]
            .iter()
            .enumerate()
            .map(|(i, record)| SourceRow {
                number: (self.position + i + 1) as u64,
                record: record.clone(),
            })
            .collect();
        self.position = end;
        self.chunks += 1;
        if let Some(hook) = &self.hook {
            hook(self.chunks);
        }
        Ok(Some(Chunk {
            rows,
            cursor: JobCursor::RowOffset { rows: end as u64 },
        }))
    }

    async fn count(&mut self) -> Result<u64> {
        Ok(self.rows.len() as u64)
    }

    async fn release_consumed(&mut self) -> Result<()> {
        self.released.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ==========================================================================
// Destination
// ==========================================================================

#[derive(Default)]
pub struct MemoryDestination {
    upserted: Mutex<BTreeMap<String, MappedRecord>>,
    inserted: Mutex<Vec<MappedRecord>>,
    versions: Mutex<HashMap<String, DateTime<Utc>>>,
    failures: Mutex<VecDeque<DestinationError>>,
    unavailable: AtomicBool,
    check_fails: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inserted(&self) -> Vec<MappedRecord> {
        self.inserted.lock().clone()
    }

    pub fn stored(&self, key: &str) -> Option<MappedRecord> {
        self.upserted.lock().get(key).cloned()
    }

    pub fn upserted_count(&self) -> usize {
        self.upserted.lock().len()
    }

    pub fn set_version(&self, key: &str, at: DateTime<Utc>) {
        self.versions.lock().insert(key.to_string(), at);
    }

    /// Fail the next write with `error`
    pub fn fail_next(&self, error: DestinationError) {
        self.failures.lock().push_back(error);
    }

    /// Fail every write as unreachable
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn fail_check(&self) {
        self.check_fails.store(true, Ordering::SeqCst);
    }

    pub fn write_calls(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Destination for MemoryDestination {
    async fn check(&self) -> std::result::Result<(), DestinationError> {
        if self.check_fails.load(Ordering::SeqCst) {
            return Err(DestinationError::Unavailable("connection refused".into()));
        }
        Ok(())
    }

    async fn existing_versions(
        &self,
        _key_field: &str,
        timestamp_field: &str,
        keys: &[String],
    ) -> std::result::Result<HashMap<String, DateTime<Utc>>, DestinationError> {
        let versions = self.versions.lock();
        let upserted = self.upserted.lock();
        Ok(keys
            .iter()
            .filter_map(|key| {
                let stored = upserted
                    .get(key)
                    .and_then(|r| r.get(timestamp_field))
                    .and_then(as_timestamp);
                stored
                    .or_else(|| versions.get(key).copied())
                    .map(|ts| (key.clone(), ts))
            })
            .collect())
    }

    async fn write(
        &self,
        records: &[MappedRecord],
        mode: WriteMode,
        conflict_key: Option<&str>,
    ) -> std::result::Result<(), DestinationError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DestinationError::Unavailable("connection reset".into()));
        }
        if let Some(error) = self.failures.lock().pop_front() {
            return Err(error);
        }
        match (mode, conflict_key) {
            (WriteMode::Upsert, Some(key_field)) => {
                let mut upserted = self.upserted.lock();
                for record in records {
                    let key = record
                        .get(key_field)
                        .and_then(FieldValue::key_text)
                        .ok_or_else(|| DestinationError::Rejected("null conflict key".into()))?;
                    let entry = upserted.entry(key).or_default();
                    for (field, value) in record.iter() {
                        entry.insert(field, value.clone());
                    }
                }
            }
            _ => self.inserted.lock().extend(records.iter().cloned()),
        }
        Ok(())
    }
}

pub struct MemoryDestinationProvider {
    destination: Arc<MemoryDestination>,
}

impl DestinationProvider for MemoryDestinationProvider {
    fn destination(
        &self,
        _target: &TargetDescriptor,
    ) -> std::result::Result<Arc<dyn Destination>, EngineError> {
        Ok(self.destination.clone())
    }
}

// ==========================================================================
// Wiring
// ==========================================================================

pub struct TestEngine {
    pub ctx: EngineContext,
    pub store: Arc<MemoryJobStore>,
    pub mappings: Arc<MemoryMappings>,
    pub sources: Arc<MemorySourceProvider>,
    pub destination: Arc<MemoryDestination>,
    pub notifier: Arc<BroadcastNotifier>,
    pub mapping: MappingSet,
}

impl TestEngine {
    pub fn new(rows: Vec<TestRow>) -> Self {
        let store = Arc::new(MemoryJobStore::default());
        let mappings = Arc::new(MemoryMappings::default());
        let mapping = lead_mapping();
        mappings.add(mapping.clone());
        let sources = Arc::new(MemorySourceProvider::new(rows));
        let destination = Arc::new(MemoryDestination::new());
        let notifier = Arc::new(BroadcastNotifier::new(1024));

        let ctx = EngineContext {
            store: store.clone(),
            mappings: mappings.clone(),
            sources: sources.clone(),
            destinations: Arc::new(MemoryDestinationProvider {
                destination: destination.clone(),
            }),
            notifier: notifier.clone(),
            control: ControlRegistry::default(),
            settings: EngineSettings {
                heartbeat_interval: Duration::ZERO,
                status_poll_every: 1,
                max_consecutive_write_failures: 5,
                stale_after: Duration::from_secs(900),
            },
        };

        Self {
            ctx,
            store,
            mappings,
            sources,
            destination,
            notifier,
            mapping,
        }
    }

    /// Pending csv_import job pinned to the lead mapping, not yet stored
    pub fn new_job(&self, batch_size: u32, target: TargetDescriptor) -> Job {
        let mut job = sample_job(batch_size);
        job.target = target;
        job.mapping_set_id = self.mapping.id;
        job
    }

    pub async fn insert_job(&self, batch_size: u32, target: TargetDescriptor) -> Job {
        let job = self.new_job(batch_size, target);
        self.store.insert(&job).await.unwrap();
        job
    }
}

//! Job state store and mapping repository seams
//!
//! The controller and supervisor only see these traits; production wires
//! the Postgres implementations, tests use `services::testing`.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::queries;
use crate::types::{ControlRequest, Job, JobStatus, MappingSet};

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: &Job) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<Job>>;

    /// Newest first
    async fn list_recent(&self, limit: i64) -> Result<Vec<Job>>;

    /// Atomically move `pending`/`paused` to `processing`
    async fn claim(&self, id: Uuid) -> Result<Option<Job>>;

    /// Persist everything except `control_request`
    async fn save(&self, job: &Job) -> Result<()>;

    /// Ask a processing job to pause or cancel; false if it is not processing
    async fn request_control(&self, id: Uuid, request: ControlRequest) -> Result<bool>;

    async fn control_request(&self, id: Uuid) -> Result<Option<ControlRequest>>;

    async fn clear_control(&self, id: Uuid) -> Result<()>;

    /// Conditional status change; `None` when the job was not in `from`
    async fn transition(
        &self,
        id: Uuid,
        from: &[JobStatus],
        to: JobStatus,
        reason: Option<&str>,
    ) -> Result<Option<Job>>;

    /// Pause `processing` jobs with a heartbeat older than `older_than`
    async fn pause_stale(
        &self,
        older_than: DateTime<Utc>,
        reason: &str,
        exclude: &[Uuid],
    ) -> Result<Vec<Uuid>>;
}

#[async_trait]
pub trait MappingRepository: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<MappingSet>>;

    async fn latest(&self, name: &str) -> Result<Option<MappingSet>>;
}

pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, job: &Job) -> Result<()> {
        queries::job::insert_job(&self.pool, job).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>> {
        queries::job::get_job(&self.pool, id).await
    }

    async fn list_recent(&self, limit: i64) -> Result<Vec<Job>> {
        queries::job::list_recent_jobs(&self.pool, limit).await
    }

    async fn claim(&self, id: Uuid) -> Result<Option<Job>> {
        queries::job::claim_job(&self.pool, id).await
    }

    async fn save(&self, job: &Job) -> Result<()> {
        queries::job::save_job(&self.pool, job).await
    }

    async fn request_control(&self, id: Uuid, request: ControlRequest) -> Result<bool> {
        queries::job::set_control_request(&self.pool, id, request).await
    }

    async fn control_request(&self, id: Uuid) -> Result<Option<ControlRequest>> {
        queries::job::get_control_request(&self.pool, id).await
    }

    async fn clear_control(&self, id: Uuid) -> Result<()> {
        queries::job::clear_control_request(&self.pool, id).await
    }

    async fn transition(
        &self,
        id: Uuid,
        from: &[JobStatus],
        to: JobStatus,
        reason: Option<&str>,
    ) -> Result<Option<Job>> {
        queries::job::transition_job(&self.pool, id, from, to, reason).await
    }

    async fn pause_stale(
        &self,
        older_than: DateTime<Utc>,
        reason: &str,
        exclude: &[Uuid],
    ) -> Result<Vec<Uuid>> {
        queries::job::pause_stale_jobs(&self.pool, older_than, reason, exclude).await
    }
}

pub struct PgMappingRepository {
    pool: PgPool,
}

impl PgMappingRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MappingRepository for PgMappingRepository {
    async fn get(&self, id: Uuid) -> Result<Option<MappingSet>> {
        queries::mapping::get_mapping_set(&self.pool, id).await
    }

    async fn latest(&self, name: &str) -> Result<Option<MappingSet>> {
        queries::mapping::latest_mapping_set(&self.pool, name).await
    }
}

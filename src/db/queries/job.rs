//! Sync job queries
//!
//! Status changes that race with other actors (claim, stale sweep, direct
//! cancel) are single conditional `UPDATE ... RETURNING` statements, so the
//! row itself decides who wins.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::types::{
    ControlRequest, ErrorLog, Job, JobCursor, JobStatus, SourceLocator, TargetDescriptor,
};

const JOB_COLUMNS: &str = "id, kind, status, total_records, processed, succeeded, failed, skipped, \
     errors, error_message, source, target, mapping_set_id, batch_size, dry_run, cursor, \
     pause_reason, control_request, created_at, started_at, completed_at, heartbeat_at, updated_at";

#[derive(Debug, FromRow)]
struct JobRow {
    id: Uuid,
    kind: String,
    status: String,
    total_records: Option<i64>,
    processed: i64,
    succeeded: i64,
    failed: i64,
    skipped: i64,
    errors: Json<ErrorLog>,
    error_message: Option<String>,
    source: Json<SourceLocator>,
    target: Json<TargetDescriptor>,
    mapping_set_id: Uuid,
    batch_size: i32,
    dry_run: bool,
    cursor: Option<Json<JobCursor>>,
    pause_reason: Option<String>,
    control_request: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    heartbeat_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = anyhow::Error;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(Job {
            id: row.id,
            kind: row.kind.parse().map_err(|e: String| anyhow!(e))?,
            status: row.status.parse().map_err(|e: String| anyhow!(e))?,
            total_records: row.total_records.map(|t| t.max(0) as u64),
            processed: row.processed.max(0) as u64,
            succeeded: row.succeeded.max(0) as u64,
            failed: row.failed.max(0) as u64,
            skipped: row.skipped.max(0) as u64,
            errors: row.errors.0,
            error_message: row.error_message,
            source: row.source.0,
            target: row.target.0,
            mapping_set_id: row.mapping_set_id,
            batch_size: row.batch_size.max(1) as u32,
            dry_run: row.dry_run,
            cursor: row.cursor.map(|c| c.0),
            pause_reason: row.pause_reason,
            control_request: row
                .control_request
                .map(|r| r.parse().map_err(|e: String| anyhow!(e)))
                .transpose()?,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            heartbeat_at: row.heartbeat_at,
            updated_at: row.updated_at,
        })
    }
}

fn status_list(statuses: &[JobStatus]) -> Vec<&'static str> {
    statuses.iter().map(JobStatus::as_str).collect()
}

/// Insert a new job
pub async fn insert_job(pool: &PgPool, job: &Job) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO sync_jobs (
            id, kind, status, total_records, processed, succeeded, failed, skipped,
            errors, error_message, source, target, mapping_set_id, batch_size, dry_run,
            cursor, pause_reason, control_request, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
        "#,
    )
    .bind(job.id)
    .bind(job.kind.as_str())
    .bind(job.status.as_str())
    .bind(job.total_records.map(|t| t as i64))
    .bind(job.processed as i64)
    .bind(job.succeeded as i64)
    .bind(job.failed as i64)
    .bind(job.skipped as i64)
    .bind(Json(&job.errors))
    .bind(&job.error_message)
    .bind(Json(&job.source))
    .bind(Json(&job.target))
    .bind(job.mapping_set_id)
    .bind(job.batch_size as i32)
    .bind(job.dry_run)
    .bind(job.cursor.as_ref().map(Json))
    .bind(&job.pause_reason)
    .bind(job.control_request.map(|r| r.as_str()))
    .bind(job.created_at)
    .bind(job.updated_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get a job by id
pub async fn get_job(pool: &PgPool, id: Uuid) -> Result<Option<Job>> {
    let sql = format!("SELECT {} FROM sync_jobs WHERE id = $1", JOB_COLUMNS);
    let row: Option<JobRow> = sqlx::query_as(&sql).bind(id).fetch_optional(pool).await?;
    row.map(Job::try_from).transpose()
}

/// Most recent jobs first
pub async fn list_recent_jobs(pool: &PgPool, limit: i64) -> Result<Vec<Job>> {
    let sql = format!(
        "SELECT {} FROM sync_jobs ORDER BY created_at DESC LIMIT $1",
        JOB_COLUMNS
    );
    let rows: Vec<JobRow> = sqlx::query_as(&sql).bind(limit).fetch_all(pool).await?;
    rows.into_iter().map(Job::try_from).collect()
}

/// Move a pending or paused job to processing. `None` if it was in any other state.
pub async fn claim_job(pool: &PgPool, id: Uuid) -> Result<Option<Job>> {
    let sql = format!(
        r#"
        UPDATE sync_jobs
        SET status = 'processing',
            started_at = COALESCE(started_at, NOW()),
            heartbeat_at = NOW(),
            updated_at = NOW(),
            pause_reason = NULL,
            control_request = NULL
        WHERE id = $1 AND status IN ('pending', 'paused')
        RETURNING {}
        "#,
        JOB_COLUMNS
    );
    let row: Option<JobRow> = sqlx::query_as(&sql).bind(id).fetch_optional(pool).await?;
    row.map(Job::try_from).transpose()
}

/// Persist progress and status. `control_request` is owned by the control
/// surface and left untouched.
pub async fn save_job(pool: &PgPool, job: &Job) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE sync_jobs
        SET status = $2,
            total_records = $3,
            processed = $4,
            succeeded = $5,
            failed = $6,
            skipped = $7,
            errors = $8,
            error_message = $9,
            cursor = $10,
            pause_reason = $11,
            started_at = $12,
            completed_at = $13,
            heartbeat_at = $14,
            updated_at = $15
        WHERE id = $1
        "#,
    )
    .bind(job.id)
    .bind(job.status.as_str())
    .bind(job.total_records.map(|t| t as i64))
    .bind(job.processed as i64)
    .bind(job.succeeded as i64)
    .bind(job.failed as i64)
    .bind(job.skipped as i64)
    .bind(Json(&job.errors))
    .bind(&job.error_message)
    .bind(job.cursor.as_ref().map(Json))
    .bind(&job.pause_reason)
    .bind(job.started_at)
    .bind(job.completed_at)
    .bind(job.heartbeat_at)
    .bind(job.updated_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Record a pause/cancel request for a processing job.
/// A pending cancel is never downgraded to a pause.
pub async fn set_control_request(pool: &PgPool, id: Uuid, request: ControlRequest) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE sync_jobs
        SET control_request = CASE
                WHEN control_request = 'cancel' THEN control_request
                ELSE $2
            END,
            updated_at = NOW()
        WHERE id = $1 AND status = 'processing'
        "#,
    )
    .bind(id)
    .bind(request.as_str())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn get_control_request(pool: &PgPool, id: Uuid) -> Result<Option<ControlRequest>> {
    let request: Option<Option<String>> =
        sqlx::query_scalar("SELECT control_request FROM sync_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?;

    request
        .flatten()
        .map(|r| r.parse().map_err(|e: String| anyhow!(e)))
        .transpose()
}

pub async fn clear_control_request(pool: &PgPool, id: Uuid) -> Result<()> {
    sqlx::query("UPDATE sync_jobs SET control_request = NULL WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Conditional status change. `reason` lands in `pause_reason` for paused
/// targets and in `error_message` for failed ones.
pub async fn transition_job(
    pool: &PgPool,
    id: Uuid,
    from: &[JobStatus],
    to: JobStatus,
    reason: Option<&str>,
) -> Result<Option<Job>> {
    let pause_reason = if to == JobStatus::Paused { reason } else { None };
    let error_message = if to == JobStatus::Failed { reason } else { None };

    let sql = format!(
        r#"
        UPDATE sync_jobs
        SET status = $2,
            pause_reason = $3,
            error_message = COALESCE($4, error_message),
            completed_at = CASE WHEN $5 THEN NOW() ELSE completed_at END,
            control_request = NULL,
            updated_at = NOW()
        WHERE id = $1 AND status = ANY($6)
        RETURNING {}
        "#,
        JOB_COLUMNS
    );
    let row: Option<JobRow> = sqlx::query_as(&sql)
        .bind(id)
        .bind(to.as_str())
        .bind(pause_reason)
        .bind(error_message)
        .bind(to.is_terminal())
        .bind(status_list(from))
        .fetch_optional(pool)
        .await?;
    row.map(Job::try_from).transpose()
}

/// Pause processing jobs whose heartbeat is older than `older_than`, except
/// the ones listed in `exclude`. Returns the ids that were paused.
pub async fn pause_stale_jobs(
    pool: &PgPool,
    older_than: DateTime<Utc>,
    reason: &str,
    exclude: &[Uuid],
) -> Result<Vec<Uuid>> {
    let ids: Vec<Uuid> = sqlx::query_scalar(
        r#"
        UPDATE sync_jobs
        SET status = 'paused',
            pause_reason = $2,
            control_request = NULL,
            updated_at = NOW()
        WHERE status = 'processing'
          AND COALESCE(heartbeat_at, updated_at) < $1
          AND NOT (id = ANY($3))
        RETURNING id
        "#,
    )
    .bind(older_than)
    .bind(reason)
    .bind(exclude)
    .fetch_all(pool)
    .await?;

    Ok(ids)
}

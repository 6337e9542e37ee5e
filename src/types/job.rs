//! Job record and job control types
//!
//! Field names and `JobStatus` wire values are read by dashboards and
//! operational tooling; treat them as a compatibility surface.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::mapping::MappingSetRef;

/// Maximum number of entries kept in a job's error log
pub const MAX_JOB_ERRORS: usize = 100;

/// Upper bound for a caller-supplied batch size
pub const MAX_BATCH_SIZE: u32 = 500;

// ==========================================================================
// Enums
// ==========================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Uploaded CSV/ZIP file into a local table
    CsvImport,
    /// Remote CRM pages into a local table
    LeadResync,
    /// Local table pages into the remote CRM
    Export,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::CsvImport => "csv_import",
            JobKind::LeadResync => "lead_resync",
            JobKind::Export => "export",
        }
    }

    pub fn default_batch_size(&self) -> u32 {
        match self {
            JobKind::CsvImport => 100,
            JobKind::LeadResync | JobKind::Export => 50,
        }
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "csv_import" => Ok(JobKind::CsvImport),
            "lead_resync" => Ok(JobKind::LeadResync),
            "export" => Ok(JobKind::Export),
            other => Err(format!("unknown job kind '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Paused,
    Completed,
    CompletedWithErrors,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::CompletedWithErrors => "completed_with_errors",
            JobStatus::Failed => "failed",
        }
    }

    /// `pending` and `paused` are the only states processing may (re)start from
    pub fn can_start(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Paused)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::CompletedWithErrors | JobStatus::Failed
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "paused" => Ok(JobStatus::Paused),
            "completed" => Ok(JobStatus::Completed),
            "completed_with_errors" => Ok(JobStatus::CompletedWithErrors),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// Request written by a caller and observed by the controller at chunk boundaries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlRequest {
    Pause,
    Cancel,
}

impl ControlRequest {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlRequest::Pause => "pause",
            ControlRequest::Cancel => "cancel",
        }
    }
}

impl FromStr for ControlRequest {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pause" => Ok(ControlRequest::Pause),
            "cancel" => Ok(ControlRequest::Cancel),
            other => Err(format!("unknown control request '{}'", other)),
        }
    }
}

/// Message stored on a job that was cancelled by an operator
pub const CANCELLED_MESSAGE: &str = "cancelled";

// ==========================================================================
// Error log
// ==========================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobError {
    /// Where the error happened, e.g. "row 57" or "batch 3 (rows 201-300)"
    pub context: String,
    pub message: String,
}

/// Append-with-cap error list
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorLog(Vec<JobError>);

impl ErrorLog {
    /// Append unless the log is full. Returns whether the entry was kept.
    pub fn push(&mut self, context: impl Into<String>, message: impl Into<String>) -> bool {
        if self.0.len() >= MAX_JOB_ERRORS {
            return false;
        }
        self.0.push(JobError {
            context: context.into(),
            message: message.into(),
        });
        true
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn entries(&self) -> &[JobError] {
        &self.0
    }
}

impl From<Vec<JobError>> for ErrorLog {
    fn from(mut entries: Vec<JobError>) -> Self {
        entries.truncate(MAX_JOB_ERRORS);
        Self(entries)
    }
}

// ==========================================================================
// Source / target descriptors
// ==========================================================================

/// Filter for paginated CRM reads
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrmFilter {
    /// CRM entity, e.g. "crm.lead"
    pub entity: String,
    #[serde(default)]
    pub date_from: Option<NaiveDate>,
    #[serde(default)]
    pub date_to: Option<NaiveDate>,
    #[serde(default)]
    pub ids: Vec<String>,
    #[serde(default)]
    pub updated_since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SourceLocator {
    /// Uploaded file on local disk (CSV, or ZIP holding a CSV)
    #[serde(rename_all = "camelCase")]
    File {
        path: String,
        #[serde(default)]
        delimiter: Option<char>,
    },
    /// Remote CRM list endpoint
    Crm(CrmFilter),
    /// Local table read in key order
    #[serde(rename_all = "camelCase")]
    Table { table: String, key_column: String },
}

impl SourceLocator {
    pub fn type_name(&self) -> &'static str {
        match self {
            SourceLocator::File { .. } => "file",
            SourceLocator::Crm(_) => "crm",
            SourceLocator::Table { .. } => "table",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Table,
    Crm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    #[default]
    Insert,
    Upsert,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetDescriptor {
    pub kind: TargetKind,
    /// Table name or CRM entity
    pub name: String,
    #[serde(default)]
    pub mode: WriteMode,
    /// Field identifying the destination record; required for upserts
    #[serde(default)]
    pub conflict_key: Option<String>,
    /// Field compared for skip-by-timestamp
    #[serde(default)]
    pub compare_timestamp: Option<String>,
}

impl TargetDescriptor {
    pub fn table(name: impl Into<String>) -> Self {
        Self {
            kind: TargetKind::Table,
            name: name.into(),
            mode: WriteMode::Insert,
            conflict_key: None,
            compare_timestamp: None,
        }
    }

    pub fn upsert_on(mut self, key: impl Into<String>) -> Self {
        self.mode = WriteMode::Upsert;
        self.conflict_key = Some(key.into());
        self
    }

    pub fn skip_older_by(mut self, field: impl Into<String>) -> Self {
        self.compare_timestamp = Some(field.into());
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("target name is empty".to_string());
        }
        if self.mode == WriteMode::Upsert && self.conflict_key.is_none() {
            return Err("upsert target needs a conflictKey".to_string());
        }
        if self.compare_timestamp.is_some() && self.conflict_key.is_none() {
            return Err("compareTimestamp needs a conflictKey to find existing records".to_string());
        }
        Ok(())
    }
}

/// Position of the first record not yet processed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum JobCursor {
    /// Data rows already consumed from a file (header excluded)
    RowOffset { rows: u64 },
    /// Next CRM page start offset
    PageStart { start: u64 },
    /// Last key read from a table
    AfterKey { key: String },
}

// ==========================================================================
// Job
// ==========================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    pub kind: JobKind,
    pub status: JobStatus,
    pub total_records: Option<u64>,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub errors: ErrorLog,
    pub error_message: Option<String>,
    pub source: SourceLocator,
    pub target: TargetDescriptor,
    pub mapping_set_id: Uuid,
    pub batch_size: u32,
    pub dry_run: bool,
    pub cursor: Option<JobCursor>,
    pub pause_reason: Option<String>,
    pub control_request: Option<ControlRequest>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        kind: JobKind,
        source: SourceLocator,
        target: TargetDescriptor,
        mapping_set_id: Uuid,
        batch_size: u32,
        dry_run: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            kind,
            status: JobStatus::Pending,
            total_records: None,
            processed: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            errors: ErrorLog::default(),
            error_message: None,
            source,
            target,
            mapping_set_id,
            batch_size,
            dry_run,
            cursor: None,
            pause_reason: None,
            control_request: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            heartbeat_at: None,
            updated_at: now,
        }
    }

    /// Add a chunk outcome; `processed` always moves with the three outcome counters
    pub fn record_outcome(&mut self, succeeded: u64, failed: u64, skipped: u64) {
        self.succeeded += succeeded;
        self.failed += failed;
        self.skipped += skipped;
        self.processed += succeeded + failed + skipped;
        if let Some(total) = self.total_records {
            if self.processed > total {
                self.total_records = Some(self.processed);
            }
        }
    }

    pub fn record_error(&mut self, context: impl Into<String>, message: impl Into<String>) {
        self.errors.push(context, message);
    }

    pub fn counters_consistent(&self) -> bool {
        let sum_ok = self.processed == self.succeeded + self.failed + self.skipped;
        let total_ok = self.total_records.map_or(true, |t| self.processed <= t);
        sum_ok && total_ok
    }

    pub fn progress_percent(&self) -> Option<u8> {
        match self.total_records {
            Some(0) => Some(100),
            Some(total) => Some(((self.processed.min(total) * 100) / total) as u8),
            None => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == JobStatus::Failed
            && self.error_message.as_deref() == Some(CANCELLED_MESSAGE)
    }
}

// ==========================================================================
// Control surface payloads
// ==========================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobRequest {
    pub kind: JobKind,
    pub source: SourceLocator,
    pub target: TargetDescriptor,
    pub mapping_set: MappingSetRef,
    #[serde(default)]
    pub batch_size: Option<u32>,
    #[serde(default)]
    pub dry_run: bool,
}

impl CreateJobRequest {
    pub fn effective_batch_size(&self) -> u32 {
        self.batch_size
            .unwrap_or_else(|| self.kind.default_batch_size())
            .clamp(1, MAX_BATCH_SIZE)
    }

    pub fn validate(&self) -> Result<(), String> {
        self.target.validate()?;
        let source_ok = matches!(
            (self.kind, &self.source),
            (JobKind::CsvImport, SourceLocator::File { .. })
                | (JobKind::LeadResync, SourceLocator::Crm(_))
                | (JobKind::Export, SourceLocator::Table { .. })
        );
        if !source_ok {
            return Err(format!(
                "{} jobs cannot read from a {} source",
                self.kind.as_str(),
                self.source.type_name()
            ));
        }
        let target_ok = match self.kind {
            JobKind::Export => self.target.kind == TargetKind::Crm,
            JobKind::CsvImport | JobKind::LeadResync => self.target.kind == TargetKind::Table,
        };
        if !target_ok {
            return Err(format!(
                "{} jobs cannot write to a {:?} target",
                self.kind.as_str(),
                self.target.kind
            ));
        }
        if let SourceLocator::Crm(filter) = &self.source {
            if filter.entity.trim().is_empty() {
                return Err("crm source needs an entity".to_string());
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobIdRequest {
    pub job_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobControlResponse {
    pub job_id: Uuid,
    /// False when the request was a no-op (e.g. pausing a job that is not running)
    pub accepted: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobHistoryRequest {
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobHistoryResponse {
    pub jobs: Vec<Job>,
    pub total: usize,
}

/// Payload published on the per-job status subject
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusUpdate {
    pub job_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub job: Job,
}

impl JobStatusUpdate {
    pub fn new(job: Job) -> Self {
        Self {
            job_id: job.id,
            timestamp: Utc::now(),
            job,
        }
    }
}

// ==========================================================================
// Tests
// ==========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn csv_job() -> Job {
        Job::new(
            JobKind::CsvImport,
            SourceLocator::File { path: "/tmp/leads.csv".into(), delimiter: None },
            TargetDescriptor::table("leads"),
            Uuid::nil(),
            100,
            false,
        )
    }

    #[test]
    fn test_new_job_is_pending_with_zero_counters() {
        let job = csv_job();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.processed, 0);
        assert!(job.total_records.is_none());
        assert!(job.counters_consistent());
    }

    #[test]
    fn test_record_outcome_keeps_processed_equal_to_sum() {
        let mut job = csv_job();
        job.total_records = Some(250);
        job.record_outcome(90, 7, 3);
        job.record_outcome(48, 2, 0);
        assert_eq!(job.processed, 150);
        assert_eq!(job.succeeded, 138);
        assert_eq!(job.failed, 9);
        assert_eq!(job.skipped, 3);
        assert!(job.counters_consistent());
    }

    #[test]
    fn test_under_reported_total_is_raised() {
        let mut job = csv_job();
        job.total_records = Some(10);
        job.record_outcome(12, 0, 0);
        assert_eq!(job.total_records, Some(12));
        assert!(job.counters_consistent());
    }

    #[test]
    fn test_error_log_caps_at_one_hundred() {
        let mut job = csv_job();
        for i in 0..150 {
            job.record_error(format!("batch {}", i), "rejected");
            job.record_outcome(0, 1, 0);
        }
        assert_eq!(job.errors.len(), MAX_JOB_ERRORS);
        assert_eq!(job.failed, 150);
        assert_eq!(job.errors.entries()[99].context, "batch 99");
    }

    #[test]
    fn test_error_log_from_vec_truncates() {
        let entries: Vec<JobError> = (0..120)
            .map(|i| JobError { context: format!("row {}", i), message: "x".into() })
            .collect();
        assert_eq!(ErrorLog::from(entries).len(), MAX_JOB_ERRORS);
    }

    #[test]
    fn test_status_wire_values() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Paused,
            JobStatus::Completed,
            JobStatus::CompletedWithErrors,
            JobStatus::Failed,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_only_pending_and_paused_can_start() {
        assert!(JobStatus::Pending.can_start());
        assert!(JobStatus::Paused.can_start());
        assert!(!JobStatus::Processing.can_start());
        assert!(!JobStatus::Failed.can_start());
        assert!(!JobStatus::CompletedWithErrors.can_start());
    }

    #[test]
    fn test_progress_percent() {
        let mut job = csv_job();
        assert_eq!(job.progress_percent(), None);
        job.total_records = Some(250);
        job.record_outcome(125, 0, 0);
        assert_eq!(job.progress_percent(), Some(50));
    }

    #[test]
    fn test_job_serializes_camel_case() {
        let json = serde_json::to_string(&csv_job()).unwrap();
        assert!(json.contains("totalRecords"));
        assert!(json.contains("mappingSetId"));
        assert!(json.contains("\"status\":\"pending\""));
        assert!(json.contains("\"type\":\"file\""));
    }

    #[test]
    fn test_create_request_batch_size_defaults_and_clamps() {
        let json = r#"{
            "kind": "lead_resync",
            "source": {"type": "crm", "entity": "crm.lead", "ids": ["1", "2"]},
            "target": {"kind": "table", "name": "leads", "mode": "upsert", "conflictKey": "crm_id"},
            "mappingSet": {"name": "bitrix-leads"}
        }"#;
        let mut req: CreateJobRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.effective_batch_size(), 50);
        assert!(!req.dry_run);
        assert!(req.validate().is_ok());

        req.batch_size = Some(10_000);
        assert_eq!(req.effective_batch_size(), MAX_BATCH_SIZE);
        req.batch_size = Some(0);
        assert_eq!(req.effective_batch_size(), 1);
    }

    #[test]
    fn test_create_request_rejects_mismatched_source() {
        let req = CreateJobRequest {
            kind: JobKind::CsvImport,
            source: SourceLocator::Table { table: "leads".into(), key_column: "id".into() },
            target: TargetDescriptor::table("leads"),
            mapping_set: MappingSetRef::Id(Uuid::nil()),
            batch_size: None,
            dry_run: false,
        };
        assert!(req.validate().unwrap_err().contains("csv_import"));
    }

    #[test]
    fn test_upsert_target_requires_conflict_key() {
        let mut target = TargetDescriptor::table("leads");
        target.mode = WriteMode::Upsert;
        assert!(target.validate().is_err());
        assert!(TargetDescriptor::table("leads").upsert_on("crm_id").validate().is_ok());
        let mut target = TargetDescriptor::table("leads");
        target.compare_timestamp = Some("updated_at".into());
        assert!(target.validate().is_err());
    }

    #[test]
    fn test_cursor_round_trips_through_json() {
        let cursor = JobCursor::RowOffset { rows: 200 };
        let json = serde_json::to_string(&cursor).unwrap();
        assert_eq!(json, r#"{"type":"rowOffset","rows":200}"#);
    }

    #[test]
    fn test_cancelled_job_is_failed_with_reason() {
        let mut job = csv_job();
        job.status = JobStatus::Failed;
        job.error_message = Some(CANCELLED_MESSAGE.to_string());
        assert!(job.is_cancelled());
    }
}

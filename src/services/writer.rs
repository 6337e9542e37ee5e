//! Batch writer
//!
//! Writes one mapped sub-batch to a destination and reports per-record
//! outcomes. Nothing here aborts a job: a failed write counts the whole
//! sub-batch as failed and the controller decides what to do with repeated
//! unavailability.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use tracing::{debug, warn};

use crate::db::queries::target;
use crate::error::{DestinationError, EngineError};
use crate::services::crm::CrmClient;
use crate::services::mapping::as_timestamp;
use crate::types::{FieldValue, JobError, MappedRecord, TargetDescriptor, TargetKind, WriteMode};

#[async_trait]
pub trait Destination: Send + Sync {
    /// Verify the destination is reachable and the target exists
    async fn check(&self) -> Result<(), DestinationError>;

    /// Stored `timestamp_field` per key, for the keys that exist
    async fn existing_versions(
        &self,
        key_field: &str,
        timestamp_field: &str,
        keys: &[String],
    ) -> Result<HashMap<String, DateTime<Utc>>, DestinationError>;

    /// Write all records in one call; either all of them land or none
    async fn write(
        &self,
        records: &[MappedRecord],
        mode: WriteMode,
        conflict_key: Option<&str>,
    ) -> Result<(), DestinationError>;
}

pub trait DestinationProvider: Send + Sync {
    fn destination(&self, target: &TargetDescriptor) -> Result<Arc<dyn Destination>, EngineError>;
}

// ==========================================================================
// Postgres
// ==========================================================================

pub struct PgDestination {
    pool: PgPool,
    table: String,
}

impl PgDestination {
    pub fn new(pool: PgPool, table: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
        }
    }
}

/// Connection-level failures are worth retrying later; everything else is a
/// refusal of this batch
fn classify_db_error(err: anyhow::Error) -> DestinationError {
    let unavailable = match err.downcast_ref::<sqlx::Error>() {
        Some(sqlx::Error::Io(_))
        | Some(sqlx::Error::Tls(_))
        | Some(sqlx::Error::Protocol(_))
        | Some(sqlx::Error::PoolTimedOut)
        | Some(sqlx::Error::PoolClosed)
        | Some(sqlx::Error::WorkerCrashed) => true,
        Some(sqlx::Error::Database(db)) => db
            .code()
            .map_or(false, |code| code.starts_with("08") || code.starts_with("57P")),
        _ => false,
    };
    let message = format!("{:#}", err);
    if unavailable {
        DestinationError::Unavailable(message)
    } else {
        DestinationError::Rejected(message)
    }
}

#[async_trait]
impl Destination for PgDestination {
    async fn check(&self) -> Result<(), DestinationError> {
        let exists = target::table_exists(&self.pool, &self.table)
            .await
            .map_err(classify_db_error)?;
        if !exists {
            return Err(DestinationError::Rejected(format!(
                "table {} does not exist",
                self.table
            )));
        }
        Ok(())
    }

    async fn existing_versions(
        &self,
        key_field: &str,
        timestamp_field: &str,
        keys: &[String],
    ) -> Result<HashMap<String, DateTime<Utc>>, DestinationError> {
        let rows = target::existing_versions(&self.pool, &self.table, key_field, timestamp_field, keys)
            .await
            .map_err(classify_db_error)?;
        Ok(rows
            .into_iter()
            .filter_map(|(key, ts)| ts.map(|ts| (key, ts)))
            .collect())
    }

    async fn write(
        &self,
        records: &[MappedRecord],
        mode: WriteMode,
        conflict_key: Option<&str>,
    ) -> Result<(), DestinationError> {
        let columns: Vec<String> = records
            .iter()
            .flat_map(|r| r.keys().map(str::to_string))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if columns.is_empty() {
            return Ok(());
        }
        let rows = Value::Array(
            records
                .iter()
                .map(|r| Value::Object(r.to_json_object()))
                .collect(),
        );

        let affected = match (mode, conflict_key) {
            (WriteMode::Upsert, Some(key)) => {
                target::upsert_rows(&self.pool, &self.table, &columns, key, &rows).await
            }
            (WriteMode::Upsert, None) => {
                return Err(DestinationError::Rejected(
                    "upsert without a conflict key".to_string(),
                ))
            }
            (WriteMode::Insert, _) => {
                target::insert_rows(&self.pool, &self.table, &columns, &rows).await
            }
        }
        .map_err(classify_db_error)?;

        debug!("Wrote {} rows to {} ({} affected)", records.len(), self.table, affected);
        Ok(())
    }
}

// ==========================================================================
// CRM
// ==========================================================================

pub struct CrmDestination {
    client: Arc<CrmClient>,
    entity: String,
}

impl CrmDestination {
    pub fn new(client: Arc<CrmClient>, entity: impl Into<String>) -> Self {
        Self {
            client,
            entity: entity.into(),
        }
    }
}

#[async_trait]
impl Destination for CrmDestination {
    async fn check(&self) -> Result<(), DestinationError> {
        self.client.ping(&self.entity).await
    }

    async fn existing_versions(
        &self,
        key_field: &str,
        timestamp_field: &str,
        keys: &[String],
    ) -> Result<HashMap<String, DateTime<Utc>>, DestinationError> {
        let items = self
            .client
            .find_by_keys(&self.entity, key_field, &[key_field, timestamp_field], keys)
            .await?;

        let mut versions = HashMap::new();
        for mut item in items {
            let key = item
                .remove(key_field)
                .and_then(|v| FieldValue::from(v).key_text());
            let ts = item
                .remove(timestamp_field)
                .and_then(|v| as_timestamp(&FieldValue::from(v)));
            if let (Some(key), Some(ts)) = (key, ts) {
                versions.insert(key, ts);
            }
        }
        Ok(versions)
    }

    async fn write(
        &self,
        records: &[MappedRecord],
        mode: WriteMode,
        conflict_key: Option<&str>,
    ) -> Result<(), DestinationError> {
        let key = match mode {
            WriteMode::Upsert => conflict_key,
            WriteMode::Insert => None,
        };
        self.client.upsert(&self.entity, key, records).await
    }
}

/// Production destination provider
pub struct DefaultDestinationProvider {
    pool: PgPool,
    crm: Option<Arc<CrmClient>>,
}

impl DefaultDestinationProvider {
    pub fn new(pool: PgPool, crm: Option<Arc<CrmClient>>) -> Self {
        Self { pool, crm }
    }
}

impl DestinationProvider for DefaultDestinationProvider {
    fn destination(&self, target: &TargetDescriptor) -> Result<Arc<dyn Destination>, EngineError> {
        match target.kind {
            TargetKind::Table => {
                target::quote_ident(&target.name)
                    .map_err(|e| EngineError::Setup(e.to_string()))?;
                Ok(Arc::new(PgDestination::new(self.pool.clone(), target.name.clone())))
            }
            TargetKind::Crm => {
                let client = self.crm.clone().ok_or_else(|| {
                    EngineError::Setup("CRM_BASE_URL is not configured".to_string())
                })?;
                Ok(Arc::new(CrmDestination::new(client, target.name.clone())))
            }
        }
    }
}

// ==========================================================================
// Batch writer
// ==========================================================================

/// Outcome of one sub-batch; `succeeded + failed + skipped` equals its size
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteOutcome {
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub errors: Vec<JobError>,
    /// The write failed because the destination could not be reached
    pub unavailable: bool,
}

impl WriteOutcome {
    pub fn total(&self) -> u64 {
        self.succeeded + self.failed + self.skipped
    }

    fn fail_row(&mut self, row: u64, message: impl Into<String>) {
        self.failed += 1;
        self.errors.push(JobError {
            context: format!("row {}", row),
            message: message.into(),
        });
    }
}

pub struct BatchWriter {
    destination: Arc<dyn Destination>,
    target: TargetDescriptor,
}

impl BatchWriter {
    pub fn new(destination: Arc<dyn Destination>, target: TargetDescriptor) -> Self {
        Self {
            destination,
            target,
        }
    }

    pub async fn check(&self) -> Result<(), DestinationError> {
        self.destination.check().await
    }

    /// Write one sub-batch of `(row number, mapped record)` pairs
    pub async fn write_batch(&self, batch_no: u64, rows: Vec<(u64, MappedRecord)>) -> WriteOutcome {
        let mut outcome = WriteOutcome::default();
        let conflict_key = self.target.conflict_key.as_deref();
        let upsert = self.target.mode == WriteMode::Upsert;

        // Attach conflict keys, failing upsert rows that have none
        let mut keyed: Vec<(u64, Option<String>, MappedRecord)> = Vec::with_capacity(rows.len());
        for (row, record) in rows {
            let key = conflict_key.and_then(|k| record.get(k)).and_then(FieldValue::key_text);
            if upsert && key.is_none() {
                outcome.fail_row(
                    row,
                    format!("missing conflict key {}", conflict_key.unwrap_or_default()),
                );
                continue;
            }
            keyed.push((row, key, record));
        }

        // Duplicate keys in one upsert batch: last occurrence wins
        if upsert {
            let mut last_index: HashMap<&str, usize> = HashMap::new();
            for (i, (_, key, _)) in keyed.iter().enumerate() {
                if let Some(key) = key {
                    last_index.insert(key.as_str(), i);
                }
            }
            let keep: Vec<bool> = keyed
                .iter()
                .enumerate()
                .map(|(i, (_, key, _))| {
                    key.as_deref().map_or(true, |k| last_index.get(k) == Some(&i))
                })
                .collect();
            let before = keyed.len();
            let mut flags = keep.into_iter();
            keyed.retain(|_| flags.next().unwrap_or(true));
            outcome.skipped += (before - keyed.len()) as u64;
        }

        if let (Some(key_field), Some(ts_field)) = (conflict_key, self.target.compare_timestamp.as_deref()) {
            let keys: Vec<String> = keyed.iter().filter_map(|(_, key, _)| key.clone()).collect();
            if !keys.is_empty() {
                match self.destination.existing_versions(key_field, ts_field, &keys).await {
                    Ok(existing) => {
                        let before = keyed.len();
                        keyed.retain(|(_, key, record)| !is_stale(key.as_deref(), record, ts_field, &existing));
                        outcome.skipped += (before - keyed.len()) as u64;
                    }
                    Err(e) => {
                        self.fail_batch(&mut outcome, batch_no, &keyed, e);
                        return outcome;
                    }
                }
            }
        }

        if keyed.is_empty() {
            return outcome;
        }

        let records: Vec<MappedRecord> = keyed.iter().map(|(_, _, r)| r.clone()).collect();
        match self.destination.write(&records, self.target.mode, conflict_key).await {
            Ok(()) => outcome.succeeded += records.len() as u64,
            Err(e) => self.fail_batch(&mut outcome, batch_no, &keyed, e),
        }
        outcome
    }

    fn fail_batch(
        &self,
        outcome: &mut WriteOutcome,
        batch_no: u64,
        keyed: &[(u64, Option<String>, MappedRecord)],
        error: DestinationError,
    ) {
        let first = keyed.first().map(|(row, _, _)| *row).unwrap_or_default();
        let last = keyed.last().map(|(row, _, _)| *row).unwrap_or_default();
        warn!(
            "Batch {} (rows {}-{}) to {} failed: {}",
            batch_no, first, last, self.target.name, error
        );
        outcome.failed += keyed.len() as u64;
        outcome.unavailable = error.is_unavailable();
        outcome.errors.push(JobError {
            context: format!("batch {} (rows {}-{})", batch_no, first, last),
            message: error.to_string(),
        });
    }
}

/// Destination already holds a version at least as new as the incoming one
fn is_stale(
    key: Option<&str>,
    record: &MappedRecord,
    ts_field: &str,
    existing: &HashMap<String, DateTime<Utc>>,
) -> bool {
    let Some(stored) = key.and_then(|k| existing.get(k)) else {
        return false;
    };
    match record.get(ts_field).and_then(as_timestamp) {
        Some(incoming) => *stored >= incoming,
        None => false,
    }
}

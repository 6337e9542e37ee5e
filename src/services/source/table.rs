//! Local table source, read with keyset pagination on the key column

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use tracing::debug;

use super::{cursor_mismatch, Chunk, RecordSource, SourceRow};
use crate::db::queries::target;
use crate::error::EngineError;
use crate::types::{JobCursor, RawRecord};

pub struct TableSource {
    pool: PgPool,
    table: String,
    key_column: String,
    batch_size: usize,
    after: Option<String>,
    /// Records already consumed, used to number rows across resumes
    position: u64,
    total: u64,
    exhausted: bool,
}

impl TableSource {
    pub async fn open(
        pool: PgPool,
        table: &str,
        key_column: &str,
        batch_size: usize,
        cursor: Option<&JobCursor>,
        start_position: u64,
    ) -> Result<Self, EngineError> {
        let after = match cursor {
            None => None,
            Some(JobCursor::AfterKey { key }) => Some(key.clone()),
            Some(other) => return Err(cursor_mismatch("table", other)),
        };

        let exists = target::table_exists(&pool, table)
            .await
            .map_err(|e| EngineError::Setup(format!("cannot inspect table {}: {:#}", table, e)))?;
        if !exists {
            let message = format!("table {} does not exist", table);
            return Err(if after.is_some() {
                EngineError::ResumeInconsistency(message)
            } else {
                EngineError::Setup(message)
            });
        }

        let total = target::count_keyed_rows(&pool, table, key_column)
            .await
            .map_err(|e| EngineError::Setup(format!("cannot count {}: {:#}", table, e)))?;

        Ok(Self {
            pool,
            table: table.to_string(),
            key_column: key_column.to_string(),
            batch_size: batch_size.max(1),
            after,
            position: start_position,
            total: total.max(0) as u64,
            exhausted: false,
        })
    }
}

#[async_trait]
impl RecordSource for TableSource {
    fn total_hint(&self) -> Option<u64> {
        Some(self.total)
    }

    async fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        if self.exhausted {
            return Ok(None);
        }
        let page = target::read_page_after(
            &self.pool,
            &self.table,
            &self.key_column,
            self.after.as_deref(),
            self.batch_size as i64,
        )
        .await?;

        if page.len() < self.batch_size {
            self.exhausted = true;
        }
        let Some((last_key, _)) = page.last() else {
            return Ok(None);
        };
        let cursor = JobCursor::AfterKey { key: last_key.clone() };
        debug!("Read {} rows from {} after {:?}", page.len(), self.table, self.after);

        let rows = page
            .into_iter()
            .map(|(_, row)| {
                self.position += 1;
                let record = match row {
                    Value::Object(object) => Ok(RawRecord::from_json_object(object)),
                    other => Err(format!("row is not an object: {}", other)),
                };
                SourceRow { number: self.position, record }
            })
            .collect();
        if let JobCursor::AfterKey { key } = &cursor {
            self.after = Some(key.clone());
        }

        Ok(Some(Chunk { rows, cursor }))
    }

    async fn count(&mut self) -> Result<u64> {
        Ok(self.total)
    }
}

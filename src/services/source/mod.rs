//! Source readers
//!
//! Every variant yields a lazy, finite, non-restartable sequence of chunks.
//! A chunk carries the cursor pointing at the first record after it, so the
//! controller can persist a resumable position once the chunk is written.

pub mod crm;
pub mod file;
pub mod table;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::PgPool;

use crate::error::EngineError;
use crate::services::crm::CrmClient;
use crate::services::uploads::is_stored_upload;
use crate::types::{Job, JobCursor, RawRecord, SourceLocator};

pub use crm::{CrmPage, CrmSource, PageFetcher};
pub use file::FileSource;
pub use table::TableSource;

/// One record pulled from a source, or the reason it could not be decoded
#[derive(Debug, Clone)]
pub struct SourceRow {
    /// 1-based position of the record in the source
    pub number: u64,
    pub record: std::result::Result<RawRecord, String>,
}

#[derive(Debug, Clone)]
pub struct Chunk {
    pub rows: Vec<SourceRow>,
    /// Position of the first record after this chunk
    pub cursor: JobCursor,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// 1-based row range covered by this chunk
    #[cfg(test)]
    pub fn row_range(&self) -> Option<(u64, u64)> {
        Some((self.rows.first()?.number, self.rows.last()?.number))
    }
}

#[async_trait]
pub trait RecordSource: Send {
    /// Best-effort total number of records, known as early as possible
    fn total_hint(&self) -> Option<u64>;

    /// Next chunk, `None` once the source is exhausted
    async fn next_chunk(&mut self) -> Result<Option<Chunk>>;

    /// Number of records the job would process; used by dry runs, never writes
    async fn count(&mut self) -> Result<u64>;

    /// Called once the owning job finished successfully
    async fn release_consumed(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Opens the source a job points at, positioned at the job's cursor
#[async_trait]
pub trait SourceProvider: Send + Sync {
    async fn open(&self, job: &Job) -> std::result::Result<Box<dyn RecordSource>, EngineError>;
}

/// Production source provider.
///
/// Only files inside `upload_dir` are ever deleted after a successful job.
pub struct DefaultSourceProvider {
    pool: PgPool,
    crm: Option<Arc<CrmClient>>,
    upload_dir: PathBuf,
    max_upload_bytes: u64,
    keep_uploads: bool,
}

impl DefaultSourceProvider {
    pub fn new(
        pool: PgPool,
        crm: Option<Arc<CrmClient>>,
        upload_dir: PathBuf,
        max_upload_bytes: u64,
        keep_uploads: bool,
    ) -> Self {
        Self {
            pool,
            crm,
            upload_dir,
            max_upload_bytes,
            keep_uploads,
        }
    }
}

#[async_trait]
impl SourceProvider for DefaultSourceProvider {
    async fn open(&self, job: &Job) -> std::result::Result<Box<dyn RecordSource>, EngineError> {
        let batch_size = job.batch_size.max(1) as usize;
        match &job.source {
            SourceLocator::File { path, delimiter } => {
                let delete_on_release =
                    !self.keep_uploads && is_stored_upload(Path::new(path), &self.upload_dir);
                let source = FileSource::open(
                    PathBuf::from(path),
                    *delimiter,
                    batch_size,
                    job.cursor.as_ref(),
                    self.max_upload_bytes,
                    delete_on_release,
                )
                .await?;
                Ok(Box::new(source))
            }
            SourceLocator::Crm(filter) => {
                let client = self.crm.clone().ok_or_else(|| {
                    EngineError::Setup("CRM_BASE_URL is not configured".to_string())
                })?;
                let source =
                    CrmSource::open(client, filter.clone(), batch_size, job.cursor.as_ref()).await?;
                Ok(Box::new(source))
            }
            SourceLocator::Table { table, key_column } => {
                let source = TableSource::open(
                    self.pool.clone(),
                    table,
                    key_column,
                    batch_size,
                    job.cursor.as_ref(),
                    job.processed,
                )
                .await?;
                Ok(Box::new(source))
            }
        }
    }
}

/// Error for a cursor that belongs to a different source variant
pub(crate) fn cursor_mismatch(expected: &str, cursor: &JobCursor) -> EngineError {
    EngineError::ResumeInconsistency(format!(
        "{} source cannot resume from cursor {:?}",
        expected, cursor
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::sample_job;
    use sqlx::postgres::PgPoolOptions;

    async fn open_and_release(provider: &DefaultSourceProvider, path: &Path) {
        let mut job = sample_job(100);
        job.source = SourceLocator::File {
            path: path.to_string_lossy().into_owned(),
            delimiter: None,
        };
        let mut source = provider.open(&job).await.unwrap();
        while source.next_chunk().await.unwrap().is_some() {}
        source.release_consumed().await.unwrap();
    }

    #[tokio::test]
    async fn test_release_never_deletes_files_outside_upload_dir() {
        let root = tempfile::tempdir().unwrap();
        let uploads = root.path().join("uploads");
        std::fs::create_dir_all(&uploads).unwrap();
        let operator_file = root.path().join("crm_master_export.csv");
        let uploaded = uploads.join("leads.csv");
        std::fs::write(&operator_file, b"ID;NAME\n1;Ana\n").unwrap();
        std::fs::write(&uploaded, b"ID;NAME\n1;Ana\n").unwrap();

        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/leadflow")
            .unwrap();
        let provider = DefaultSourceProvider::new(pool, None, uploads.clone(), 1 << 30, false);

        open_and_release(&provider, &operator_file).await;
        assert!(operator_file.exists());

        open_and_release(&provider, &uploaded).await;
        assert!(!uploaded.exists());
    }
}

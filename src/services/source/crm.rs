//! Paginated remote CRM source
//!
//! The CRM hands out fixed-size pages addressed by an absolute record offset.
//! Pages are buffered and re-cut to the job's batch size; the persisted cursor
//! is the offset of the first record not yet emitted, so a resume may land in
//! the middle of a CRM page.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use super::{cursor_mismatch, Chunk, RecordSource, SourceRow};
use crate::error::EngineError;
use crate::types::{CrmFilter, JobCursor, RawRecord};

/// One page as returned by the CRM
#[derive(Debug, Clone, Default)]
pub struct CrmPage {
    pub items: Vec<RawRecord>,
    pub total: Option<u64>,
    /// Offset of the following page, `None` on the last page
    pub next: Option<u64>,
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(&self, filter: &CrmFilter, start: u64) -> Result<CrmPage>;
}

pub struct CrmSource {
    fetcher: Arc<dyn PageFetcher>,
    filter: CrmFilter,
    batch_size: usize,
    /// Buffered records with their 1-based position in the result set
    buffer: VecDeque<(u64, RawRecord)>,
    next_page: Option<u64>,
    total: Option<u64>,
}

impl CrmSource {
    pub async fn open(
        fetcher: Arc<dyn PageFetcher>,
        filter: CrmFilter,
        batch_size: usize,
        cursor: Option<&JobCursor>,
    ) -> Result<Self, EngineError> {
        let start = match cursor {
            None => 0,
            Some(JobCursor::PageStart { start }) => *start,
            Some(other) => return Err(cursor_mismatch("crm", other)),
        };

        let mut source = Self {
            fetcher,
            filter,
            batch_size: batch_size.max(1),
            buffer: VecDeque::new(),
            next_page: Some(start),
            total: None,
        };
        source.fetch_next().await.map_err(|e| {
            EngineError::Setup(format!("cannot read {} from CRM: {:#}", source.filter.entity, e))
        })?;
        Ok(source)
    }

    async fn fetch_next(&mut self) -> Result<()> {
        let Some(start) = self.next_page else {
            return Ok(());
        };
        let page = self.fetcher.fetch_page(&self.filter, start).await?;

        if self.total.is_none() {
            self.total = page.total;
        }
        self.next_page = match page.next {
            Some(next) if !page.items.is_empty() && next > start => Some(next),
            _ => None,
        };
        debug!(
            "Buffered {} {} records from offset {}",
            page.items.len(),
            self.filter.entity,
            start
        );
        self.buffer.extend(
            page.items
                .into_iter()
                .enumerate()
                .map(|(i, record)| (start + i as u64 + 1, record)),
        );
        Ok(())
    }
}

#[async_trait]
impl RecordSource for CrmSource {
    fn total_hint(&self) -> Option<u64> {
        self.total
    }

    async fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        while self.buffer.len() < self.batch_size && self.next_page.is_some() {
            self.fetch_next().await?;
        }

        let take = self.batch_size.min(self.buffer.len());
        if take == 0 {
            return Ok(None);
        }
        let rows: Vec<SourceRow> = self
            .buffer
            .drain(..take)
            .map(|(number, record)| SourceRow { number, record: Ok(record) })
            .collect();
        let start = rows.last().map(|row| row.number).unwrap_or_default();

        Ok(Some(Chunk {
            rows,
            cursor: JobCursor::PageStart { start },
        }))
    }

    async fn count(&mut self) -> Result<u64> {
        if let Some(total) = self.total {
            return Ok(total);
        }
        while self.next_page.is_some() {
            self.fetch_next().await?;
        }
        Ok(self.buffer.back().map(|(number, _)| *number).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// CRM double serving `size` records in pages of `page`
    struct FakeCrm {
        size: u64,
        page: u64,
        report_total: bool,
        starts: Mutex<Vec<u64>>,
    }

    impl FakeCrm {
        fn new(size: u64, page: u64) -> Arc<Self> {
            Arc::new(Self { size, page, report_total: true, starts: Mutex::new(Vec::new()) })
        }
    }

    #[async_trait]
    impl PageFetcher for FakeCrm {
        async fn fetch_page(&self, _filter: &CrmFilter, start: u64) -> Result<CrmPage> {
            self.starts.lock().push(start);
            let end = (start + self.page).min(self.size);
            let items = (start..end)
                .map(|i| {
                    let mut record = RawRecord::new();
                    record.insert("ID", (i + 1).to_string());
                    record
                })
                .collect();
            Ok(CrmPage {
                items,
                total: self.report_total.then_some(self.size),
                next: (end < self.size).then_some(end),
            })
        }
    }

    struct DownCrm;

    #[async_trait]
    impl PageFetcher for DownCrm {
        async fn fetch_page(&self, _filter: &CrmFilter, _start: u64) -> Result<CrmPage> {
            anyhow::bail!("connection refused")
        }
    }

    fn filter() -> CrmFilter {
        CrmFilter { entity: "crm.lead".into(), ..Default::default() }
    }

    fn ids(chunk: &Chunk) -> Vec<String> {
        chunk
            .rows
            .iter()
            .map(|row| row.record.as_ref().unwrap().get("ID").unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_pages_are_rechunked_to_batch_size() {
        let crm = FakeCrm::new(120, 50);
        let mut source = CrmSource::open(crm.clone(), filter(), 30, None).await.unwrap();
        assert_eq!(source.total_hint(), Some(120));

        let mut sizes = Vec::new();
        let mut last_cursor = None;
        while let Some(chunk) = source.next_chunk().await.unwrap() {
            sizes.push(chunk.len());
            last_cursor = Some(chunk.cursor);
        }
        assert_eq!(sizes, vec![30, 30, 30, 30]);
        assert_eq!(last_cursor, Some(JobCursor::PageStart { start: 120 }));
        assert_eq!(*crm.starts.lock(), vec![0, 50, 100]);
    }

    #[tokio::test]
    async fn test_resume_mid_page() {
        let crm = FakeCrm::new(120, 50);
        let cursor = JobCursor::PageStart { start: 75 };
        let mut source = CrmSource::open(crm.clone(), filter(), 20, Some(&cursor)).await.unwrap();

        let first = source.next_chunk().await.unwrap().unwrap();
        assert_eq!(first.rows[0].number, 76);
        assert_eq!(ids(&first)[0], "76");
        assert_eq!(first.cursor, JobCursor::PageStart { start: 95 });
        assert_eq!(crm.starts.lock()[0], 75);
    }

    #[tokio::test]
    async fn test_unreachable_crm_is_setup_error() {
        let result = CrmSource::open(Arc::new(DownCrm), filter(), 50, None).await;
        assert!(matches!(result, Err(EngineError::Setup(msg)) if msg.contains("connection refused")));
    }

    #[tokio::test]
    async fn test_count_pages_through_without_total() {
        let crm = Arc::new(FakeCrm {
            size: 130,
            page: 50,
            report_total: false,
            starts: Mutex::new(Vec::new()),
        });
        let mut source = CrmSource::open(crm, filter(), 50, None).await.unwrap();
        assert_eq!(source.total_hint(), None);
        assert_eq!(source.count().await.unwrap(), 130);
    }

    #[tokio::test]
    async fn test_empty_result_set() {
        let crm = FakeCrm::new(0, 50);
        let mut source = CrmSource::open(crm, filter(), 50, None).await.unwrap();
        assert_eq!(source.total_hint(), Some(0));
        assert!(source.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_cursor_is_rejected() {
        let cursor = JobCursor::RowOffset { rows: 10 };
        let result = CrmSource::open(FakeCrm::new(10, 5), filter(), 5, Some(&cursor)).await;
        assert!(matches!(result, Err(EngineError::ResumeInconsistency(_))));
    }
}

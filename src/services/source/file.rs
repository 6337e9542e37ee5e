//! Bulk-file source: an uploaded CSV (or a ZIP holding one)
//!
//! The upload is read into memory once, bounded by `max_upload_bytes`. Rows
//! are then pulled `batch_size` at a time from a `csv::Reader` over that
//! buffer, so parsed rows never exceed one chunk.

use std::io::{Cursor, Read};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{cursor_mismatch, Chunk, RecordSource, SourceRow};
use crate::error::EngineError;
use crate::types::{JobCursor, RawRecord};

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

pub struct FileSource {
    path: PathBuf,
    reader: csv::Reader<Cursor<Vec<u8>>>,
    headers: Vec<String>,
    batch_size: usize,
    position: u64,
    total: u64,
    delete_on_release: bool,
}

impl FileSource {
    pub async fn open(
        path: PathBuf,
        delimiter: Option<char>,
        batch_size: usize,
        cursor: Option<&JobCursor>,
        max_upload_bytes: u64,
        delete_on_release: bool,
    ) -> Result<Self, EngineError> {
        let skip = match cursor {
            None => 0,
            Some(JobCursor::RowOffset { rows }) => *rows,
            Some(other) => return Err(cursor_mismatch("file", other)),
        };

        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) if cursor.is_some() => {
                return Err(EngineError::ResumeInconsistency(format!(
                    "upload {} is no longer readable: {}",
                    path.display(),
                    e
                )))
            }
            Err(e) => {
                return Err(EngineError::Setup(format!(
                    "cannot read upload {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        if metadata.len() > max_upload_bytes {
            return Err(EngineError::Setup(format!(
                "upload {} is {} bytes, limit is {}",
                path.display(),
                metadata.len(),
                max_upload_bytes
            )));
        }

        let delimiter = match delimiter {
            Some(c) if c.is_ascii() => Some(c as u8),
            Some(c) => {
                return Err(EngineError::Setup(format!("delimiter '{}' is not ASCII", c)))
            }
            None => None,
        };

        let raw = tokio::fs::read(&path)
            .await
            .map_err(|e| EngineError::Setup(format!("cannot read upload {}: {}", path.display(), e)))?;

        let (decoded, delimiter, total) = tokio::task::spawn_blocking(move || -> Result<_> {
            let decoded = decode_upload(raw, max_upload_bytes)?;
            let delimiter = delimiter.unwrap_or_else(|| detect_delimiter(&decoded));
            let total = count_records(&decoded, delimiter);
            Ok((decoded, delimiter, total))
        })
        .await
        .map_err(|e| EngineError::Setup(format!("decoding task failed: {}", e)))?
        .map_err(|e| EngineError::Setup(format!("cannot decode {}: {:#}", path.display(), e)))?;

        if skip > total {
            return Err(EngineError::ResumeInconsistency(format!(
                "cursor points at row {} but {} holds {} rows",
                skip,
                path.display(),
                total
            )));
        }

        let mut reader = reader_builder(delimiter).from_reader(Cursor::new(decoded));
        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| EngineError::Setup(format!("cannot read header row: {}", e)))?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();
        if headers.iter().all(|h| h.is_empty()) {
            return Err(EngineError::Setup(format!("{} has no header row", path.display())));
        }

        let mut record = csv::StringRecord::new();
        for _ in 0..skip {
            match reader.read_record(&mut record) {
                Ok(true) | Err(_) => {}
                Ok(false) => break,
            }
        }

        info!(
            "Opened upload {} ({} rows, delimiter '{}', starting after row {})",
            path.display(),
            total,
            delimiter as char,
            skip
        );

        Ok(Self {
            path,
            reader,
            headers,
            batch_size: batch_size.max(1),
            position: skip,
            total,
            delete_on_release,
        })
    }

    fn to_raw(&self, record: &csv::StringRecord) -> RawRecord {
        let mut raw = RawRecord::new();
        for (header, value) in self.headers.iter().zip(record.iter()) {
            if !header.is_empty() {
                raw.insert(header.clone(), value);
            }
        }
        raw
    }
}

#[async_trait]
impl RecordSource for FileSource {
    fn total_hint(&self) -> Option<u64> {
        Some(self.total)
    }

    async fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        let mut rows = Vec::with_capacity(self.batch_size);
        let mut record = csv::StringRecord::new();

        while rows.len() < self.batch_size {
            match self.reader.read_record(&mut record) {
                Ok(true) => {
                    self.position += 1;
                    rows.push(SourceRow {
                        number: self.position,
                        record: Ok(self.to_raw(&record)),
                    });
                }
                Ok(false) => break,
                Err(e) => {
                    self.position += 1;
                    rows.push(SourceRow {
                        number: self.position,
                        record: Err(format!("cannot parse row: {}", e)),
                    });
                }
            }
        }

        if rows.is_empty() {
            return Ok(None);
        }
        debug!("Read {} rows from {}", rows.len(), self.path.display());
        Ok(Some(Chunk {
            rows,
            cursor: JobCursor::RowOffset { rows: self.position },
        }))
    }

    async fn count(&mut self) -> Result<u64> {
        Ok(self.total)
    }

    async fn release_consumed(&mut self) -> Result<()> {
        if !self.delete_on_release {
            return Ok(());
        }
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                info!("Deleted consumed upload {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Upload {} was already gone", self.path.display());
                Ok(())
            }
            Err(e) => Err(e).with_context(|| format!("cannot delete {}", self.path.display())),
        }
    }
}

fn reader_builder(delimiter: u8) -> csv::ReaderBuilder {
    let mut builder = csv::ReaderBuilder::new();
    builder.delimiter(delimiter).has_headers(true).flexible(true);
    builder
}

/// Unpack ZIP uploads, strip a UTF-8 BOM and repair invalid UTF-8
fn decode_upload(raw: Vec<u8>, max_bytes: u64) -> Result<Vec<u8>> {
    let mut bytes = if raw.starts_with(ZIP_MAGIC) {
        extract_first_csv(raw, max_bytes)?
    } else {
        raw
    };

    if bytes.starts_with(UTF8_BOM) {
        bytes.drain(..UTF8_BOM.len());
    }
    if std::str::from_utf8(&bytes).is_err() {
        warn!("Upload is not valid UTF-8, decoding lossily");
        bytes = String::from_utf8_lossy(&bytes).into_owned().into_bytes();
    }
    Ok(bytes)
}

/// The entry's declared size is not trusted; at most `max_bytes` are inflated
fn extract_first_csv(raw: Vec<u8>, max_bytes: u64) -> Result<Vec<u8>> {
    let mut archive = zip::ZipArchive::new(Cursor::new(raw)).context("invalid ZIP archive")?;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.is_file() && entry.name().to_lowercase().ends_with(".csv") {
            debug!("Using '{}' from ZIP upload", entry.name());
            let mut content = Vec::new();
            entry
                .by_ref()
                .take(max_bytes.saturating_add(1))
                .read_to_end(&mut content)?;
            if content.len() as u64 > max_bytes {
                bail!("unpacked CSV exceeds the {} byte limit", max_bytes);
            }
            return Ok(content);
        }
    }
    bail!("ZIP archive contains no .csv file")
}

/// Pick `;`, `,` or tab by counting occurrences in the header line
fn detect_delimiter(bytes: &[u8]) -> u8 {
    let header = bytes.split(|b| *b == b'\n').next().unwrap_or_default();
    let count = |d: u8| header.iter().filter(|b| **b == d).count();
    [b',', b';', b'\t']
        .into_iter()
        .max_by_key(|d| (count(*d), *d == b','))
        .unwrap_or(b',')
}

/// Number of data rows (header excluded)
fn count_records(bytes: &[u8], delimiter: u8) -> u64 {
    let mut reader = reader_builder(delimiter).from_reader(bytes);
    let mut record = csv::ByteRecord::new();
    let mut total = 0;
    loop {
        match reader.read_byte_record(&mut record) {
            Ok(true) | Err(_) => total += 1,
            Ok(false) => break,
        }
    }
    total
}

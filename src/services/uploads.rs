//! Upload storage for bulk-file sources

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use base64::Engine;
use tracing::info;
use uuid::Uuid;

use crate::types::UploadResponse;

/// Decode a base64 upload and store it under `dir` with a unique name
pub async fn store_upload(
    dir: &Path,
    filename: &str,
    content_base64: &str,
    max_bytes: u64,
) -> Result<UploadResponse> {
    // base64 expands by 4/3; refuse obviously oversized payloads before decoding
    if (content_base64.len() as u64) / 4 * 3 > max_bytes + 3 {
        bail!("upload exceeds the {} byte limit", max_bytes);
    }
    let content = base64::engine::general_purpose::STANDARD
        .decode(content_base64.trim())
        .context("upload is not valid base64")?;
    if content.is_empty() {
        bail!("upload is empty");
    }
    if content.len() as u64 > max_bytes {
        bail!("upload exceeds the {} byte limit", max_bytes);
    }

    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("cannot create upload directory {}", dir.display()))?;

    let path: PathBuf = dir.join(format!("{}-{}", Uuid::new_v4(), sanitize_filename(filename)));
    tokio::fs::write(&path, &content)
        .await
        .with_context(|| format!("cannot write {}", path.display()))?;

    info!("Stored upload {} ({} bytes)", path.display(), content.len());
    Ok(UploadResponse {
        path: path.to_string_lossy().into_owned(),
        size_bytes: content.len() as u64,
    })
}

/// Whether `path` resolves to a file inside `upload_dir`. Symlinks and `..`
/// are resolved first; anything that cannot be resolved is not an upload.
pub fn is_stored_upload(path: &Path, upload_dir: &Path) -> bool {
    match (std::fs::canonicalize(path), std::fs::canonicalize(upload_dir)) {
        (Ok(path), Ok(dir)) => path != dir && path.starts_with(&dir),
        _ => false,
    }
}

/// Keep the base name only, replacing anything outside `[A-Za-z0-9._-]`
fn sanitize_filename(filename: &str) -> String {
    let base = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "upload.csv".to_string()
    } else {
        cleaned.to_string()
    }
}

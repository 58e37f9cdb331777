use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::IngestionError;
use crate::models::{FileRef, UploadBlob};

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Longest file name common filesystems accept
const MAX_FILE_NAME_BYTES: usize = 255;

/// Storage names leave room for the `.{name}.part` staging file
const MAX_STORAGE_NAME_BYTES: usize = MAX_FILE_NAME_BYTES - ".".len() - ".part".len();

/// Trait for turning raw blobs into durable file references
#[async_trait]
pub trait BlobIntake: Send + Sync {
    /// Store every blob of the batch. A failure fails the whole batch; blobs
    /// written earlier in the same batch are left in place.
    async fn ingest(&self, blobs: Vec<UploadBlob>) -> Result<Vec<FileRef>, IngestionError>;
}

/// Upload intake backed by a local directory served under `/uploads`
#[derive(Debug, Clone)]
pub struct LocalUploadIntake {
    root: PathBuf,
    public_base_url: String,
}

impl LocalUploadIntake {
    pub fn new(root: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn location_for(&self, storage_name: &str) -> String {
        format!("{}/uploads/{}", self.public_base_url, storage_name)
    }

    async fn store_blob(&self, blob: UploadBlob) -> Result<FileRef, IngestionError> {
        let storage_name = storage_name(&blob.filename);
        let content_type = resolve_content_type(blob.content_type.as_deref(), &blob.bytes);
        let final_path = self.root.join(&storage_name);
        let part_path = self.root.join(format!(".{storage_name}.part"));

        write_atomically(&part_path, &final_path, &blob.bytes)
            .await
            .map_err(|source| IngestionError::WriteFailed {
                filename: blob.filename.clone(),
                source,
            })?;

        info!(
            storage_name = %storage_name,
            content_type = %content_type,
            size_bytes = blob.bytes.len(),
            "Stored upload"
        );

        Ok(FileRef {
            location: self.location_for(&storage_name),
            filename: storage_name,
            content_type,
            size_bytes: blob.bytes.len() as u64,
        })
    }
}

/// Write to `part_path`, then rename into place. The staging file never
/// survives a failure.
async fn write_atomically(
    part_path: &Path,
    final_path: &Path,
    bytes: &[u8],
) -> std::io::Result<()> {
    let result = match tokio::fs::write(part_path, bytes).await {
        Ok(()) => tokio::fs::rename(part_path, final_path).await,
        Err(e) => Err(e),
    };
    if result.is_err() {
        let _ = tokio::fs::remove_file(part_path).await;
    }
    result
}

#[async_trait]
impl BlobIntake for LocalUploadIntake {
    async fn ingest(&self, blobs: Vec<UploadBlob>) -> Result<Vec<FileRef>, IngestionError> {
        if blobs.is_empty() {
            return Ok(Vec::new());
        }

        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(IngestionError::StorageUnavailable)?;

        let mut stored = Vec::with_capacity(blobs.len());
        for blob in blobs {
            match self.store_blob(blob).await {
                Ok(file) => stored.push(file),
                Err(e) => {
                    warn!(
                        already_stored = stored.len(),
                        "Upload batch failed, earlier files are not rolled back: {}", e
                    );
                    return Err(e);
                }
            }
        }

        Ok(stored)
    }
}

/// Replace every character outside `[A-Za-z0-9._-]` with `_`
pub fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if sanitized.is_empty() {
        "file".to_string()
    } else {
        sanitized
    }
}

/// Collision-resistant storage name: millis, a random tag, then the sanitized
/// name, shortened so the whole name fits the filesystem limit
pub fn storage_name(original: &str) -> String {
    let tag = Uuid::new_v4().simple().to_string();
    let prefix = format!("{}_{}_", Utc::now().timestamp_millis(), &tag[..8]);
    let budget = MAX_STORAGE_NAME_BYTES.saturating_sub(prefix.len());

    format!(
        "{prefix}{}",
        truncate_keeping_extension(&sanitize_filename(original), budget)
    )
}

/// Cut an ASCII name down to `max_bytes`, preserving a short extension
fn truncate_keeping_extension(name: &str, max_bytes: usize) -> String {
    if name.len() <= max_bytes {
        return name.to_string();
    }

    let extension = name
        .rfind('.')
        .filter(|&dot| dot > 0)
        .map(|dot| &name[dot..])
        .filter(|extension| extension.len() < max_bytes / 2)
        .unwrap_or_default();

    format!("{}{}", &name[..max_bytes - extension.len()], extension)
}

fn resolve_content_type(declared: Option<&str>, bytes: &[u8]) -> String {
    match declared.map(str::trim) {
        Some(declared) if !declared.is_empty() && declared != DEFAULT_CONTENT_TYPE => {
            declared.to_string()
        }
        _ => infer::get(bytes)
            .map(|kind| kind.mime_type().to_string())
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
    }
}

/// Locations of the image files, in order
pub fn image_references(files: &[FileRef]) -> Vec<String> {
    files
        .iter()
        .filter(|file| file.is_image())
        .map(|file| file.location.clone())
        .collect()
}

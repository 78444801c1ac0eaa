//! Durable stores (catalog + record artifact) and HTTP plumbing for wafsync.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;
use wafsync_core::ErrorKind;

pub mod catalog;
pub mod http;
pub mod records;
pub mod retention;
pub mod snapshot;

pub use catalog::{CatalogStore, SqliteCatalogStore};
pub use http::{
    classify_reqwest_error, classify_status, retry_with_backoff, BackoffPolicy, FetchedResponse,
    HttpClientConfig, HttpFetcher, RetryDisposition,
};
pub use records::{RecordSet, RecordStore, StoreWrite};
pub use retention::{apply_retention, RetentionPolicy, RetentionReport, RetentionRule};
pub use snapshot::{export_catalog, import_catalog, CatalogSnapshot};

pub const CRATE_NAME: &str = "wafsync-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(#[source] sqlx::Error),
    #[error("store integrity violation: {0}")]
    Integrity(String),
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),
    #[error("arrow error: {0}")]
    Arrow(#[from] arrow_schema::ArrowError),
    #[error("snapshot encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn integrity(message: impl Into<String>) -> Self {
        Self::Integrity(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        ErrorKind::StoreIntegrity
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db)
                if db.is_unique_violation()
                    || db.is_foreign_key_violation()
                    || db.is_check_violation() =>
            {
                Self::Integrity(db.message().to_string())
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                Self::Integrity(err.to_string())
            }
            _ => Self::Unavailable(err),
        }
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Replace `path` with `bytes` via a temp file in the same directory and a rename.
///
/// Readers observe either the previous file or the new one, never a partial write.
pub async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .map_err(|e| StoreError::io(parent, e))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let write_result = async {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, path).await
    }
    .await;

    if let Err(err) = write_result {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StoreError::io(path, err));
    }
    Ok(())
}

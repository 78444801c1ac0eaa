//! Point-in-time catalog dumps as zstd-compressed JSON.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::info;
use wafsync_core::CatalogEntry;

use crate::catalog::CatalogStore;
use crate::{write_atomically, StoreError};

pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;
pub const SNAPSHOT_PREFIX: &str = "catalog_dump_";
pub const SNAPSHOT_SUFFIX: &str = ".json.zst";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    pub format_version: u32,
    pub exported_at: DateTime<Utc>,
    pub entries: Vec<CatalogEntry>,
}

pub fn snapshot_file_name(now: DateTime<Utc>) -> String {
    format!("{SNAPSHOT_PREFIX}{}{SNAPSHOT_SUFFIX}", now.format("%Y-%m-%d_%H-%M-%S"))
}

/// Dump every catalog entry into `dir`, returning the written path.
pub async fn export_catalog(
    store: &dyn CatalogStore,
    dir: &Path,
    now: DateTime<Utc>,
) -> Result<PathBuf, StoreError> {
    let snapshot = CatalogSnapshot {
        format_version: SNAPSHOT_FORMAT_VERSION,
        exported_at: now,
        entries: store.all_entries().await?,
    };
    let json = serde_json::to_vec(&snapshot)?;
    let path = dir.join(snapshot_file_name(now));
    let compressed = zstd::encode_all(Cursor::new(json), 3).map_err(|e| StoreError::io(&path, e))?;
    write_atomically(&path, &compressed).await?;
    info!(path = %path.display(), entries = snapshot.entries.len(), "catalog snapshot exported");
    Ok(path)
}

pub async fn read_snapshot(path: &Path) -> Result<CatalogSnapshot, StoreError> {
    let compressed = fs::read(path).await.map_err(|e| StoreError::io(path, e))?;
    let json = zstd::decode_all(Cursor::new(compressed)).map_err(|e| StoreError::io(path, e))?;
    let snapshot: CatalogSnapshot = serde_json::from_slice(&json)?;
    if snapshot.format_version != SNAPSHOT_FORMAT_VERSION {
        return Err(StoreError::integrity(format!(
            "unsupported snapshot format {} in {}",
            snapshot.format_version,
            path.display()
        )));
    }
    Ok(snapshot)
}

/// Replace the catalog with the content of a snapshot. Returns the entry count.
pub async fn import_catalog(store: &dyn CatalogStore, path: &Path) -> Result<usize, StoreError> {
    let snapshot = read_snapshot(path).await?;
    store.replace_all(&snapshot.entries).await?;
    info!(path = %path.display(), entries = snapshot.entries.len(), "catalog snapshot restored");
    Ok(snapshot.entries.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SqliteCatalogStore;
    use chrono::TimeZone;
    use tempfile::tempdir;

    #[tokio::test]
    async fn export_then_import_restores_tombstones_and_validators() {
        let dir = tempdir().expect("tempdir");
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 8, 30, 0).single().unwrap();

        let source = SqliteCatalogStore::open(dir.path().join("source.db")).await.unwrap();
        let mut active = CatalogEntry::discovered("https://waf.test/a.xml", now);
        active.advance_validator(Some("W/\"abc\"".into()), now);
        let mut gone = CatalogEntry::discovered("https://waf.test/b.xml", now);
        gone.tombstone(now);
        source.upsert_batch(&[active, gone]).await.unwrap();

        let path = export_catalog(&source, dir.path(), now).await.unwrap();
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("catalog_dump_2026-03-02_08-30-00"));

        let target = SqliteCatalogStore::open(dir.path().join("target.db")).await.unwrap();
        target
            .upsert_batch(&[CatalogEntry::discovered("https://waf.test/stale.xml", now)])
            .await
            .unwrap();
        let restored = import_catalog(&target, &path).await.unwrap();

        assert_eq!(restored, 2);
        assert_eq!(
            target.all_entries().await.unwrap(),
            source.all_entries().await.unwrap()
        );
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_rejected_without_touching_catalog() {
        let dir = tempdir().expect("tempdir");
        let bogus = dir.path().join("catalog_dump_bad.json.zst");
        std::fs::write(&bogus, b"not zstd").unwrap();

        let store = SqliteCatalogStore::open(dir.path().join("c.db")).await.unwrap();
        let now = Utc::now();
        store
            .upsert_batch(&[CatalogEntry::discovered("https://waf.test/keep.xml", now)])
            .await
            .unwrap();

        assert!(import_catalog(&store, &bogus).await.is_err());
        assert_eq!(store.all_entries().await.unwrap().len(), 1);
    }
}

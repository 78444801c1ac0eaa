//! Catalog dump/restore and retention cleanup around the run artifacts.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::info;
use wafsync_storage::snapshot::{SNAPSHOT_PREFIX, SNAPSHOT_SUFFIX};
use wafsync_storage::{
    apply_retention, export_catalog, import_catalog, RetentionPolicy, RetentionReport,
    RetentionRule, SqliteCatalogStore,
};

use crate::config::SyncConfig;

const SECS_PER_DAY: u64 = 86_400;

async fn open_catalog(config: &SyncConfig) -> Result<SqliteCatalogStore> {
    let path = config.catalog_path();
    SqliteCatalogStore::open(&path)
        .await
        .with_context(|| format!("opening catalog {}", path.display()))
}

pub async fn dump_catalog(config: &SyncConfig) -> Result<PathBuf> {
    let catalog = open_catalog(config).await?;
    let path = export_catalog(&catalog, &config.snapshots_dir(), Utc::now())
        .await
        .context("exporting catalog snapshot")?;
    catalog.close().await;
    Ok(path)
}

pub async fn restore_catalog(config: &SyncConfig, snapshot: &Path) -> Result<usize> {
    let catalog = open_catalog(config).await?;
    let restored = import_catalog(&catalog, snapshot)
        .await
        .with_context(|| format!("restoring catalog from {}", snapshot.display()))?;
    catalog.close().await;
    Ok(restored)
}

#[derive(Debug, Default)]
pub struct CleanupReport {
    pub reports: RetentionReport,
    pub snapshots: RetentionReport,
}

/// Prune old run report directories and catalog dumps.
pub fn cleanup_artifacts(config: &SyncConfig, now: SystemTime) -> Result<CleanupReport> {
    let max_age = config
        .max_artifact_age_days
        .map(|days| Duration::from_secs(days * SECS_PER_DAY));
    let reports = apply_retention(
        &config.reports_dir,
        &RetentionPolicy {
            rules: vec![RetentionRule::dirs(config.keep_reports)],
            max_age,
        },
        now,
    )
    .context("cleaning run reports")?;
    let snapshots = apply_retention(
        &config.snapshots_dir(),
        &RetentionPolicy {
            rules: vec![RetentionRule::files(
                SNAPSHOT_PREFIX,
                SNAPSHOT_SUFFIX,
                config.keep_snapshots,
            )],
            max_age,
        },
        now,
    )
    .context("cleaning catalog snapshots")?;
    info!(
        reports_deleted = reports.deleted.len(),
        snapshots_deleted = snapshots.deleted.len(),
        "cleanup finished"
    );
    Ok(CleanupReport { reports, snapshots })
}

//! Catalog Store: URL -> sync state, backed by SQLite through sqlx.

use std::collections::BTreeSet;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use tracing::debug;
use wafsync_core::{CatalogEntry, CatalogStatus};

use crate::StoreError;

#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn get(&self, url: &str) -> Result<Option<CatalogEntry>, StoreError>;

    async fn list_by_status(&self, status: CatalogStatus) -> Result<BTreeSet<String>, StoreError>;

    async fn entries_by_status(&self, status: CatalogStatus)
        -> Result<Vec<CatalogEntry>, StoreError>;

    /// Apply every entry or none of them.
    async fn upsert_batch(&self, entries: &[CatalogEntry]) -> Result<(), StoreError>;

    async fn all_entries(&self) -> Result<Vec<CatalogEntry>, StoreError>;

    /// Replace the whole catalog content in one transaction.
    async fn replace_all(&self, entries: &[CatalogEntry]) -> Result<(), StoreError>;
}

const SCHEMA: [&str; 2] = [
    r#"
    CREATE TABLE IF NOT EXISTS catalog_entries (
        url TEXT PRIMARY KEY NOT NULL,
        validator TEXT,
        status TEXT NOT NULL CHECK (status IN ('active', 'deleted')),
        discovered_at TEXT NOT NULL,
        last_seen_at TEXT,
        deleted_at TEXT,
        collection_id TEXT,
        CHECK ((status = 'deleted') = (deleted_at IS NOT NULL))
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_catalog_entries_status ON catalog_entries (status)",
];

const UPSERT_SQL: &str = r#"
    INSERT INTO catalog_entries
        (url, validator, status, discovered_at, last_seen_at, deleted_at, collection_id)
    VALUES (?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT (url) DO UPDATE SET
        validator = excluded.validator,
        status = excluded.status,
        discovered_at = excluded.discovered_at,
        last_seen_at = excluded.last_seen_at,
        deleted_at = excluded.deleted_at,
        collection_id = excluded.collection_id
"#;

const SELECT_COLUMNS: &str = "SELECT url, validator, status, discovered_at, last_seen_at, \
     deleted_at, collection_id FROM catalog_entries";

pub struct SqliteCatalogStore {
    pool: SqlitePool,
}

impl SqliteCatalogStore {
    /// Open (creating if missing) the catalog database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        // One writer per run; a single connection keeps SQLite from reporting locks.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(column: &str, value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::integrity(format!("bad timestamp in {column}: {value} ({e})")))
}

fn parse_opt_ts(column: &str, value: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    value.as_deref().map(|v| parse_ts(column, v)).transpose()
}

fn entry_from_row(row: &SqliteRow) -> Result<CatalogEntry, StoreError> {
    let status_text: String = row.try_get("status")?;
    let status = CatalogStatus::parse(&status_text)
        .ok_or_else(|| StoreError::integrity(format!("unknown catalog status {status_text}")))?;
    let discovered_at: String = row.try_get("discovered_at")?;
    Ok(CatalogEntry {
        url: row.try_get("url")?,
        validator: row.try_get("validator")?,
        status,
        discovered_at: parse_ts("discovered_at", &discovered_at)?,
        last_seen_at: parse_opt_ts("last_seen_at", row.try_get("last_seen_at")?)?,
        deleted_at: parse_opt_ts("deleted_at", row.try_get("deleted_at")?)?,
        collection_id: row.try_get("collection_id")?,
    })
}

async fn upsert_in<'c, E>(executor: E, entry: &CatalogEntry) -> Result<(), StoreError>
where
    E: sqlx::Executor<'c, Database = sqlx::Sqlite>,
{
    sqlx::query(UPSERT_SQL)
        .bind(&entry.url)
        .bind(entry.validator.as_deref())
        .bind(entry.status.as_str())
        .bind(format_ts(entry.discovered_at))
        .bind(entry.last_seen_at.map(format_ts))
        .bind(entry.deleted_at.map(format_ts))
        .bind(entry.collection_id.as_deref())
        .execute(executor)
        .await?;
    Ok(())
}

#[async_trait]
impl CatalogStore for SqliteCatalogStore {
    async fn get(&self, url: &str) -> Result<Option<CatalogEntry>, StoreError> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE url = ?"))
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(entry_from_row).transpose()
    }

    async fn list_by_status(&self, status: CatalogStatus) -> Result<BTreeSet<String>, StoreError> {
        let urls: Vec<String> =
            sqlx::query_scalar("SELECT url FROM catalog_entries WHERE status = ?")
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?;
        Ok(urls.into_iter().collect())
    }

    async fn entries_by_status(
        &self,
        status: CatalogStatus,
    ) -> Result<Vec<CatalogEntry>, StoreError> {
        let rows = sqlx::query(&format!("{SELECT_COLUMNS} WHERE status = ? ORDER BY url"))
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn upsert_batch(&self, entries: &[CatalogEntry]) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for entry in entries {
            upsert_in(&mut *tx, entry).await?;
        }
        tx.commit().await?;
        debug!(count = entries.len(), "catalog batch committed");
        Ok(())
    }

    async fn all_entries(&self) -> Result<Vec<CatalogEntry>, StoreError> {
        let rows = sqlx::query(&format!("{SELECT_COLUMNS} ORDER BY url"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn replace_all(&self, entries: &[CatalogEntry]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM catalog_entries")
            .execute(&mut *tx)
            .await?;
        for entry in entries {
            upsert_in(&mut *tx, entry).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

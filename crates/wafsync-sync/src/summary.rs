//! Run summary and operator reports.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;
use wafsync_core::ErrorKind;

use crate::config::EnrichmentScope;

/// One item that did not complete, with the taxonomy kind that stopped it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedItem {
    pub key: String,
    pub kind: ErrorKind,
    pub message: String,
    pub attempts: u32,
}

impl FailedItem {
    pub fn new(key: impl Into<String>, kind: ErrorKind, message: impl Into<String>, attempts: u32) -> Self {
        Self {
            key: key.into(),
            kind,
            message: message.into(),
            attempts,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlSummary {
    pub root_url: String,
    pub directories_listed: usize,
    pub discovered: usize,
    pub added: usize,
    pub reactivated: usize,
    pub deleted: usize,
    pub protected: usize,
    pub unchanged: usize,
    pub failed_subtrees: Vec<FailedItem>,
    /// False when the crawl was cancelled and the catalog left untouched.
    pub applied: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchSummary {
    pub candidates: usize,
    pub unchanged: usize,
    pub updated: usize,
    pub records_inserted: usize,
    pub records_changed: usize,
    pub self_healed: usize,
    pub tombstoned_not_found: usize,
    pub orphans_flagged: usize,
    pub batches_committed: usize,
    pub failed: Vec<FailedItem>,
    pub skipped_cancelled: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichSummary {
    pub scope: EnrichmentScope,
    pub considered: usize,
    pub found: usize,
    pub not_found: usize,
    pub url_derived: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: Vec<FailedItem>,
    pub skipped_cancelled: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogCounts {
    pub active: usize,
    pub deleted: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreDigest {
    pub path: String,
    pub rows: usize,
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    CompletedWithFailures,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub stages: Vec<String>,
    pub crawl: Option<CrawlSummary>,
    pub fetch: Option<FetchSummary>,
    pub enrich: Option<EnrichSummary>,
    pub catalog: CatalogCounts,
    pub record_store: Option<StoreDigest>,
    pub error: Option<String>,
    pub reports_dir: String,
}

impl RunSummary {
    pub fn failure_count(&self) -> usize {
        self.crawl.as_ref().map_or(0, |c| c.failed_subtrees.len())
            + self.fetch.as_ref().map_or(0, |f| f.failed.len())
            + self.enrich.as_ref().map_or(0, |e| e.failed.len())
    }

    pub fn derive_status(&self, cancelled: bool) -> RunStatus {
        if self.error.is_some() {
            RunStatus::Failed
        } else if cancelled {
            RunStatus::Cancelled
        } else if self.failure_count() > 0 {
            RunStatus::CompletedWithFailures
        } else {
            RunStatus::Completed
        }
    }
}

pub fn run_reports_dir(reports_root: &Path, run_id: Uuid) -> PathBuf {
    reports_root.join(run_id.to_string())
}

fn failure_lines(title: &str, items: &[FailedItem]) -> String {
    if items.is_empty() {
        return String::new();
    }
    let mut out = format!("\n## {title} ({})\n", items.len());
    for item in items {
        out.push_str(&format!(
            "- `{}` {} after {} attempt(s): {}\n",
            item.key, item.kind, item.attempts, item.message
        ));
    }
    out
}

pub fn render_brief(summary: &RunSummary) -> String {
    let mut out = format!(
        "# WAF Sync Run Brief\n\n- Run ID: `{}`\n- Status: {:?}\n- Started: {}\n- Finished: {}\n- Stages: {}\n- Catalog: {} active / {} deleted\n",
        summary.run_id,
        summary.status,
        summary.started_at,
        summary.finished_at,
        summary.stages.join(" -> "),
        summary.catalog.active,
        summary.catalog.deleted,
    );
    if let Some(store) = &summary.record_store {
        out.push_str(&format!(
            "- Record store: {} rows, sha256 `{}`\n",
            store.rows,
            store.sha256.as_deref().unwrap_or("-")
        ));
    }
    if let Some(error) = &summary.error {
        out.push_str(&format!("- Error: {error}\n"));
    }
    if let Some(c) = &summary.crawl {
        out.push_str(&format!(
            "\n## Crawl\n- Directories listed: {}\n- Discovered: {}\n- Added: {}\n- Reactivated: {}\n- Deleted: {}\n- Protected: {}\n- Unchanged: {}\n",
            c.directories_listed, c.discovered, c.added, c.reactivated, c.deleted, c.protected, c.unchanged
        ));
    }
    if let Some(f) = &summary.fetch {
        out.push_str(&format!(
            "\n## Fetch\n- Candidates: {}\n- Unchanged: {}\n- Updated: {}\n- Records inserted/changed: {}/{}\n- Self-healed: {}\n- Tombstoned (not found): {}\n- Orphans flagged: {}\n- Skipped (cancelled): {}\n",
            f.candidates,
            f.unchanged,
            f.updated,
            f.records_inserted,
            f.records_changed,
            f.self_healed,
            f.tombstoned_not_found,
            f.orphans_flagged,
            f.skipped_cancelled
        ));
    }
    if let Some(e) = &summary.enrich {
        out.push_str(&format!(
            "\n## Enrich\n- Scope: {:?}\n- Considered: {}\n- Found / not found: {} / {}\n- Updated / unchanged: {} / {}\n- Skipped (cancelled): {}\n",
            e.scope, e.considered, e.found, e.not_found, e.updated, e.unchanged, e.skipped_cancelled
        ));
    }
    if let Some(c) = &summary.crawl {
        out.push_str(&failure_lines("Failed subtrees", &c.failed_subtrees));
    }
    if let Some(f) = &summary.fetch {
        out.push_str(&failure_lines("Fetch failures", &f.failed));
    }
    if let Some(e) = &summary.enrich {
        out.push_str(&failure_lines("Enrichment failures", &e.failed));
    }
    out
}

/// Write `run_summary.json` and `run_brief.md` into the run's report directory.
pub async fn write_run_reports(summary: &RunSummary) -> Result<PathBuf> {
    let dir = PathBuf::from(&summary.reports_dir);
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;
    fs::write(dir.join("run_brief.md"), render_brief(summary))
        .await
        .context("writing run_brief.md")?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn summary(reports_dir: &Path) -> RunSummary {
        let now = Utc::now();
        RunSummary {
            run_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            status: RunStatus::Completed,
            stages: vec!["crawl".into(), "fetch".into()],
            crawl: Some(CrawlSummary::default()),
            fetch: Some(FetchSummary {
                failed: vec![FailedItem::new(
                    "https://waf.test/x.xml",
                    ErrorKind::PermanentRequest,
                    "HTTP 403",
                    1,
                )],
                ..Default::default()
            }),
            enrich: None,
            catalog: CatalogCounts { active: 2, deleted: 1 },
            record_store: None,
            error: None,
            reports_dir: reports_dir.display().to_string(),
        }
    }

    #[test]
    fn status_reflects_failures_and_cancellation() {
        let s = summary(Path::new("/tmp"));
        assert_eq!(s.failure_count(), 1);
        assert_eq!(s.derive_status(false), RunStatus::CompletedWithFailures);
        assert_eq!(s.derive_status(true), RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn reports_are_written_and_list_failures() {
        let dir = tempdir().expect("tempdir");
        let s = summary(&dir.path().join("run"));
        let out = write_run_reports(&s).await.unwrap();

        let json: RunSummary =
            serde_json::from_slice(&std::fs::read(out.join("run_summary.json")).unwrap()).unwrap();
        assert_eq!(json, s);
        let brief = std::fs::read_to_string(out.join("run_brief.md")).unwrap();
        assert!(brief.contains("## Fetch failures (1)"));
        assert!(brief.contains("https://waf.test/x.xml"));
    }
}

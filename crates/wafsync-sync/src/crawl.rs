//! Crawl stage: traverse the remote hierarchy and sync the catalog.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::task::JoinSet;
use tracing::{error, info, info_span, warn, Instrument};
use wafsync_adapters::{Listing, RemoteDirectory, RemoteError};
use wafsync_core::CatalogEntry;
use wafsync_storage::CatalogStore;

use crate::attempt::{call_remote, AttemptPolicy};
use crate::config::SyncConfig;
use crate::context::{CancelSignal, RunContext};
use crate::summary::{CrawlSummary, FailedItem};

/// Result of walking the hierarchy once.
#[derive(Debug, Clone, Default)]
pub struct Traversal {
    pub discovered: BTreeSet<String>,
    pub directories_listed: usize,
    /// Directory URL whose listing ultimately failed, with the failure.
    pub failed_subtrees: Vec<FailedItem>,
    pub cancelled: bool,
}

/// Classification of catalog URLs against one traversal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogDiff {
    pub added: Vec<String>,
    pub reactivated: Vec<String>,
    pub deleted: Vec<String>,
    /// Active URLs missing from the traversal but under a failed subtree.
    pub protected: Vec<String>,
    pub unchanged: usize,
}

async fn list_directory(
    directory: Arc<dyn RemoteDirectory>,
    url: String,
    policy: AttemptPolicy,
    cancel: CancelSignal,
) -> (String, Result<Listing, RemoteError>, u32) {
    let (result, attempts) = call_remote(policy, &cancel, &url, || directory.list(&url)).await;
    (url, result, attempts)
}

/// Walk the hierarchy from the directory root with at most `concurrency`
/// listings in flight. A failed subtree is recorded and skipped.
pub async fn traverse(
    directory: Arc<dyn RemoteDirectory>,
    concurrency: usize,
    policy: AttemptPolicy,
    cancel: &CancelSignal,
) -> Traversal {
    let mut traversal = Traversal::default();
    let mut pending: VecDeque<String> = VecDeque::from([directory.root_url().to_string()]);
    let mut seen: HashSet<String> = pending.iter().cloned().collect();
    let mut in_flight = JoinSet::new();

    loop {
        while in_flight.len() < concurrency.max(1) && !cancel.is_cancelled() {
            let Some(url) = pending.pop_front() else {
                break;
            };
            in_flight.spawn(list_directory(
                Arc::clone(&directory),
                url,
                policy,
                cancel.clone(),
            ));
        }

        let Some(joined) = in_flight.join_next().await else {
            break;
        };
        let (url, result, attempts) = match joined {
            Ok(done) => done,
            Err(err) => {
                error!(error = %err, "listing task failed");
                continue;
            }
        };

        match result {
            Ok(listing) => {
                traversal.directories_listed += 1;
                traversal.discovered.extend(listing.documents);
                for child in listing.directories {
                    if seen.insert(child.clone()) {
                        pending.push_back(child);
                    }
                }
            }
            Err(err) => {
                warn!(url = %url, attempts, error = %err, "subtree listing failed; skipping");
                traversal
                    .failed_subtrees
                    .push(FailedItem::new(url, err.kind(), err.to_string(), attempts));
            }
        }
    }

    traversal.cancelled = cancel.is_cancelled() && !pending.is_empty();
    traversal.failed_subtrees.sort_by(|a, b| a.key.cmp(&b.key));
    traversal
}

/// Diff a traversal against every catalog entry.
pub fn compute_diff(
    discovered: &BTreeSet<String>,
    existing: &[CatalogEntry],
    failed_subtrees: &[FailedItem],
) -> CatalogDiff {
    let mut diff = CatalogDiff::default();
    let known: BTreeMap<&str, &CatalogEntry> =
        existing.iter().map(|e| (e.url.as_str(), e)).collect();

    for url in discovered {
        match known.get(url.as_str()) {
            None => diff.added.push(url.clone()),
            Some(entry) if entry.is_active() => diff.unchanged += 1,
            Some(_) => diff.reactivated.push(url.clone()),
        }
    }

    for entry in existing.iter().filter(|e| e.is_active()) {
        if discovered.contains(&entry.url) {
            continue;
        }
        let under_failed = failed_subtrees
            .iter()
            .any(|failed| entry.url.starts_with(failed.key.as_str()));
        if under_failed {
            diff.protected.push(entry.url.clone());
        } else {
            diff.deleted.push(entry.url.clone());
        }
    }
    diff
}

/// Catalog mutations implementing `diff`.
pub fn diff_entries(
    diff: &CatalogDiff,
    existing: &[CatalogEntry],
    now: DateTime<Utc>,
) -> Vec<CatalogEntry> {
    let by_url: BTreeMap<&str, &CatalogEntry> =
        existing.iter().map(|e| (e.url.as_str(), e)).collect();
    let mut out = Vec::with_capacity(diff.added.len() + diff.reactivated.len() + diff.deleted.len());

    out.extend(diff.added.iter().map(|url| CatalogEntry::discovered(url.clone(), now)));
    for url in &diff.reactivated {
        if let Some(entry) = by_url.get(url.as_str()) {
            let mut entry = (*entry).clone();
            entry.reactivate();
            out.push(entry);
        }
    }
    for url in &diff.deleted {
        if let Some(entry) = by_url.get(url.as_str()) {
            let mut entry = (*entry).clone();
            entry.tombstone(now);
            out.push(entry);
        }
    }
    out
}

async fn write_crawl_audit(
    dir: &Path,
    discovered: &BTreeSet<String>,
    diff: &CatalogDiff,
    now: DateTime<Utc>,
) -> Result<()> {
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let urls: Vec<&String> = discovered.iter().collect();
    let json = serde_json::to_vec_pretty(&urls).context("serializing discovered urls")?;
    fs::write(dir.join("discovered_urls.json"), json)
        .await
        .context("writing discovered_urls.json")?;

    let section = |title: &str, marker: char, urls: &[String]| {
        let mut s = format!("\n## {title} ({})\n", urls.len());
        for url in urls {
            s.push_str(&format!("{marker} {url}\n"));
        }
        s
    };
    let mut md = format!("# Catalog Changes\n\nLogged at {}\n", now.to_rfc3339());
    md.push_str(&section("Added", '+', &diff.added));
    md.push_str(&section("Reactivated", '*', &diff.reactivated));
    md.push_str(&section("Deleted", '-', &diff.deleted));
    md.push_str(&section("Protected (failed subtree)", '~', &diff.protected));
    fs::write(dir.join("catalog_changes.md"), md)
        .await
        .context("writing catalog_changes.md")?;
    Ok(())
}

/// Crawl the hierarchy and apply the diff to the catalog in one batch.
pub async fn run_crawl(
    ctx: &RunContext,
    config: &SyncConfig,
    directory: Arc<dyn RemoteDirectory>,
    catalog: &dyn CatalogStore,
    audit_dir: &Path,
) -> Result<CrawlSummary> {
    let span = info_span!("crawl", run_id = %ctx.run_id, root = directory.root_url());
    async {
        let policy = AttemptPolicy {
            backoff: config.backoff(),
            timeout: config.attempt_timeout(),
        };
        let root_url = directory.root_url().to_string();
        let traversal = traverse(directory, config.crawl_concurrency, policy, &ctx.cancel).await;

        let mut summary = CrawlSummary {
            root_url,
            directories_listed: traversal.directories_listed,
            discovered: traversal.discovered.len(),
            failed_subtrees: traversal.failed_subtrees.clone(),
            ..Default::default()
        };

        if traversal.cancelled {
            warn!(
                listed = traversal.directories_listed,
                "crawl cancelled before completion; catalog left untouched"
            );
            return Ok(summary);
        }

        let existing = catalog
            .all_entries()
            .await
            .context("reading catalog for diff")?;
        let diff = compute_diff(&traversal.discovered, &existing, &traversal.failed_subtrees);
        let now = Utc::now();
        let changes = diff_entries(&diff, &existing, now);
        catalog
            .upsert_batch(&changes)
            .await
            .context("applying crawl diff to catalog")?;

        summary.added = diff.added.len();
        summary.reactivated = diff.reactivated.len();
        summary.deleted = diff.deleted.len();
        summary.protected = diff.protected.len();
        summary.unchanged = diff.unchanged;
        summary.applied = true;

        write_crawl_audit(audit_dir, &traversal.discovered, &diff, now).await?;
        info!(
            discovered = summary.discovered,
            added = summary.added,
            reactivated = summary.reactivated,
            deleted = summary.deleted,
            protected = summary.protected,
            failed_subtrees = summary.failed_subtrees.len(),
            "catalog synced"
        );
        Ok(summary)
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use wafsync_core::{CatalogStatus, ErrorKind};

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).single().unwrap()
    }

    fn set(urls: &[&str]) -> BTreeSet<String> {
        urls.iter().map(|u| u.to_string()).collect()
    }

    #[test]
    fn diff_classifies_new_gone_unchanged_and_reactivated() {
        let a = CatalogEntry::discovered("https://w/a.xml", ts(1));
        let b = CatalogEntry::discovered("https://w/b.xml", ts(1));
        let mut d = CatalogEntry::discovered("https://w/d.xml", ts(1));
        d.tombstone(ts(2));

        let diff = compute_diff(
            &set(&["https://w/a.xml", "https://w/c.xml", "https://w/d.xml"]),
            &[a, b, d],
            &[],
        );
        assert_eq!(diff.added, vec!["https://w/c.xml".to_string()]);
        assert_eq!(diff.reactivated, vec!["https://w/d.xml".to_string()]);
        assert_eq!(diff.deleted, vec!["https://w/b.xml".to_string()]);
        assert_eq!(diff.unchanged, 1);
        assert!(diff.protected.is_empty());
    }

    #[test]
    fn urls_under_failed_subtree_are_protected() {
        let kept = CatalogEntry::discovered("https://w/NOS/iso/xml/k.xml", ts(1));
        let gone = CatalogEntry::discovered("https://w/NESDIS/g.xml", ts(1));
        let failed = vec![FailedItem::new(
            "https://w/NOS/iso/xml/",
            ErrorKind::TransientNetwork,
            "HTTP 503",
            4,
        )];

        let diff = compute_diff(&BTreeSet::new(), &[kept, gone], &failed);
        assert_eq!(diff.protected, vec!["https://w/NOS/iso/xml/k.xml".to_string()]);
        assert_eq!(diff.deleted, vec!["https://w/NESDIS/g.xml".to_string()]);
    }

    #[test]
    fn diff_entries_tombstone_and_reactivate_without_losing_validators() {
        let mut b = CatalogEntry::discovered("https://w/b.xml", ts(1));
        b.advance_validator(Some("\"v2\"".into()), ts(1));
        let mut d = CatalogEntry::discovered("https://w/d.xml", ts(1));
        d.advance_validator(Some("\"v9\"".into()), ts(1));
        d.tombstone(ts(2));
        let existing = vec![b, d];

        let diff = CatalogDiff {
            added: vec!["https://w/c.xml".into()],
            reactivated: vec!["https://w/d.xml".into()],
            deleted: vec!["https://w/b.xml".into()],
            ..Default::default()
        };
        let changes = diff_entries(&diff, &existing, ts(5));
        let by_url: BTreeMap<_, _> = changes.iter().map(|e| (e.url.as_str(), e)).collect();

        let c = by_url["https://w/c.xml"];
        assert_eq!((c.status, c.validator.as_deref()), (CatalogStatus::Active, None));

        let d = by_url["https://w/d.xml"];
        assert_eq!(d.status, CatalogStatus::Active);
        assert_eq!(d.deleted_at, None);
        assert_eq!(d.validator.as_deref(), Some("\"v9\""));
        assert_eq!(d.discovered_at, ts(1));

        let b = by_url["https://w/b.xml"];
        assert_eq!(b.status, CatalogStatus::Deleted);
        assert_eq!(b.deleted_at, Some(ts(5)));
        assert_eq!(b.validator.as_deref(), Some("\"v2\""));
    }
}

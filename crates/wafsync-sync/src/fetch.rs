//! Fetch stage: conditional retrieval, extraction and transactional merge.
//!
//! Workers fetch and extract. The coordinator merges results into the
//! in-memory record set and commits in batches: the record artifact is
//! replaced first, and only then are the matching catalog validators
//! advanced. A failed artifact write leaves those validators untouched so
//! the documents are fetched again on the next run.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info, info_span, warn, Instrument};
use wafsync_adapters::{extract_iso_metadata, ConditionalFetch, DocumentSource, RemoteError};
use wafsync_core::{
    derive_collection_id, CatalogEntry, CatalogStatus, ErrorKind, ExtractedFields, FetchOutcome,
    FetchOutcomeKind, MetadataRecord,
};
use wafsync_storage::{CatalogStore, RecordSet, RecordStore};

use crate::attempt::{call_remote, AttemptPolicy};
use crate::config::SyncConfig;
use crate::context::{CancelSignal, RunContext};
use crate::pool::spawn_pool;
use crate::summary::{FailedItem, FetchSummary};

#[derive(Debug, Clone)]
pub struct FetchTask {
    pub entry: CatalogEntry,
    /// Validator sent with the request; `None` forces a full fetch.
    pub precondition: Option<String>,
}

/// What a worker hands back to the coordinator.
#[derive(Debug)]
pub enum FetchReport {
    Unchanged {
        entry: CatalogEntry,
    },
    Extracted {
        entry: CatalogEntry,
        validator: Option<String>,
        fields: ExtractedFields,
    },
    Failed {
        entry: CatalogEntry,
        failure: FailedItem,
    },
}

/// Map a remote result onto the outcome variants.
pub fn classify_fetch(url: &str, result: Result<ConditionalFetch, RemoteError>) -> FetchOutcome {
    match result {
        Ok(ConditionalFetch::NotModified) => FetchOutcome::unchanged(url),
        Ok(ConditionalFetch::Modified { body, validator }) => {
            FetchOutcome::updated(url, body, validator)
        }
        Err(err) => FetchOutcome::failed(url, err.kind()),
    }
}

async fn fetch_and_extract(
    source: &dyn DocumentSource,
    task: FetchTask,
    policy: AttemptPolicy,
    cancel: &CancelSignal,
) -> FetchReport {
    let url = task.entry.url.clone();
    let precondition = task.precondition.as_deref();
    let (result, attempts) = call_remote(policy, cancel, &url, || {
        source.fetch_conditional(&url, precondition)
    })
    .await;
    let message = result.as_ref().err().map(ToString::to_string);

    match classify_fetch(&url, result).kind {
        FetchOutcomeKind::Unchanged => FetchReport::Unchanged { entry: task.entry },
        FetchOutcomeKind::Updated { content, validator } => match extract_iso_metadata(&content) {
            Ok(fields) => FetchReport::Extracted {
                entry: task.entry,
                validator,
                fields,
            },
            Err(err) => {
                warn!(url = %url, error = %err, "extraction failed; validator kept");
                FetchReport::Failed {
                    entry: task.entry,
                    failure: FailedItem::new(url, err.kind(), err.to_string(), attempts),
                }
            }
        },
        FetchOutcomeKind::Failed(kind) => FetchReport::Failed {
            entry: task.entry,
            failure: FailedItem::new(
                url,
                kind,
                message.unwrap_or_else(|| kind.to_string()),
                attempts,
            ),
        },
    }
}

/// Active entries to fetch. An entry with a validator whose extracted record
/// is missing is fetched unconditionally so a lost artifact heals itself.
pub fn plan_tasks(active: Vec<CatalogEntry>, records: &RecordSet) -> (Vec<FetchTask>, usize) {
    let mut healed = 0;
    let tasks = active
        .into_iter()
        .map(|entry| {
            let has_record = entry
                .collection_id
                .as_deref()
                .is_some_and(|id| records.contains_key(id));
            let precondition = match &entry.validator {
                Some(v) if has_record => Some(v.clone()),
                Some(_) => {
                    healed += 1;
                    None
                }
                None => None,
            };
            FetchTask {
                entry,
                precondition,
            }
        })
        .collect();
    (tasks, healed)
}

#[derive(Debug, PartialEq, Eq)]
pub enum MergeEffect {
    Inserted,
    Changed,
    Identical,
}

/// Merge extracted fields; enrichment-owned fields of an existing record are kept.
///
/// Several URLs may carry the same document id. Identical content from
/// another URL only moves ownership to the smallest URL, so repeated runs
/// settle on one source.
pub fn merge_extraction(
    records: &mut RecordSet,
    url: &str,
    fields: ExtractedFields,
    now: chrono::DateTime<Utc>,
) -> (String, MergeEffect) {
    let collection_id = derive_collection_id(&fields, url);
    let effect = match records.get_mut(&collection_id) {
        None => {
            records.insert(
                collection_id.clone(),
                MetadataRecord::from_extraction(collection_id.clone(), url, fields, now),
            );
            MergeEffect::Inserted
        }
        Some(record) if record.fields == fields => {
            if record.orphaned || url < record.source_url.as_str() {
                debug!(collection_id = %collection_id, previous = %record.source_url, url, "record source moved");
                record.source_url = url.to_string();
                record.orphaned = false;
                MergeEffect::Changed
            } else {
                MergeEffect::Identical
            }
        }
        Some(record) => {
            if record.source_url != url {
                warn!(
                    collection_id = %collection_id,
                    previous = %record.source_url,
                    url,
                    "collection id now sourced from a different url"
                );
            }
            record.apply_extraction(url, fields, now);
            MergeEffect::Changed
        }
    };
    (collection_id, effect)
}

/// Flag records whose source URL is tombstoned. A record another active URL
/// still extracts to moves to the smallest such URL instead. Returns how many
/// records changed.
pub fn flag_orphans(
    records: &mut RecordSet,
    active: &[CatalogEntry],
    deleted: &BTreeSet<String>,
) -> usize {
    let mut adopters: BTreeMap<&str, &str> = BTreeMap::new();
    for entry in active {
        if let Some(id) = entry.collection_id.as_deref() {
            adopters
                .entry(id)
                .and_modify(|url| *url = (*url).min(entry.url.as_str()))
                .or_insert(entry.url.as_str());
        }
    }

    let mut changed = 0;
    for record in records.values_mut() {
        if !deleted.contains(&record.source_url) {
            if record.orphaned {
                record.orphaned = false;
                changed += 1;
            }
            continue;
        }
        match adopters.get(record.collection_id.as_str()) {
            Some(url) => {
                record.source_url = (*url).to_string();
                record.orphaned = false;
                changed += 1;
            }
            None if !record.orphaned => {
                record.orphaned = true;
                changed += 1;
            }
            None => {}
        }
    }
    changed
}

struct Coordinator<'a> {
    catalog: &'a dyn CatalogStore,
    store: &'a RecordStore,
    records: RecordSet,
    records_dirty: bool,
    /// Catalog writes that do not depend on the artifact (seen, tombstones).
    touched: Vec<CatalogEntry>,
    /// Validator advances waiting for the artifact write.
    advances: Vec<CatalogEntry>,
    summary: FetchSummary,
}

impl Coordinator<'_> {
    fn pending(&self) -> usize {
        self.touched.len() + self.advances.len()
    }

    async fn commit(&mut self) -> Result<()> {
        if self.pending() == 0 && !self.records_dirty {
            return Ok(());
        }
        let mut artifact_ok = true;
        if self.records_dirty {
            match self.store.replace_all(&self.records).await {
                Ok(write) => {
                    self.records_dirty = false;
                    debug!(rows = write.rows, sha256 = %write.sha256, "record batch written");
                }
                Err(err) => {
                    artifact_ok = false;
                    warn!(error = %err, held = self.advances.len(), "record store write failed; validators held back");
                    for entry in self.advances.drain(..) {
                        self.summary.failed.push(FailedItem::new(
                            entry.url,
                            ErrorKind::StoreIntegrity,
                            err.to_string(),
                            1,
                        ));
                    }
                }
            }
        }

        let mut batch: Vec<CatalogEntry> = self.touched.drain(..).collect();
        if artifact_ok {
            batch.append(&mut self.advances);
        }
        self.catalog
            .upsert_batch(&batch)
            .await
            .context("committing fetch batch to catalog")?;
        self.summary.batches_committed += 1;
        Ok(())
    }

    fn accept(&mut self, report: FetchReport, ctx: &mut RunContext) {
        let now = Utc::now();
        match report {
            FetchReport::Unchanged { mut entry } => {
                self.summary.unchanged += 1;
                entry.mark_seen(now);
                self.touched.push(entry);
            }
            FetchReport::Extracted {
                mut entry,
                validator,
                fields,
            } => {
                self.summary.updated += 1;
                let (collection_id, effect) =
                    merge_extraction(&mut self.records, &entry.url, fields, now);
                match effect {
                    MergeEffect::Inserted => self.summary.records_inserted += 1,
                    MergeEffect::Changed => self.summary.records_changed += 1,
                    MergeEffect::Identical => {}
                }
                if effect != MergeEffect::Identical {
                    self.records_dirty = true;
                }
                entry.record_extraction(collection_id.clone(), validator, now);
                ctx.merged_ids.insert(collection_id);
                self.advances.push(entry);
            }
            FetchReport::Failed { mut entry, failure } => {
                if failure.kind == ErrorKind::NotFound {
                    info!(url = %entry.url, "document gone; tombstoning");
                    entry.tombstone(now);
                    self.touched.push(entry);
                    self.summary.tombstoned_not_found += 1;
                } else {
                    warn!(url = %failure.key, kind = %failure.kind, error = %failure.message, "fetch failed");
                }
                self.summary.failed.push(failure);
            }
        }
    }
}

/// Fetch every active catalog URL and merge changed documents.
pub async fn run_fetch(
    ctx: &mut RunContext,
    config: &SyncConfig,
    source: Arc<dyn DocumentSource>,
    catalog: &dyn CatalogStore,
    store: &RecordStore,
) -> Result<FetchSummary> {
    let span = info_span!("fetch", run_id = %ctx.run_id);
    async {
        let active = catalog
            .entries_by_status(CatalogStatus::Active)
            .await
            .context("listing active catalog entries")?;
        let records = store.load().await.context("loading record store")?;
        let (tasks, healed) = plan_tasks(active, &records);
        info!(candidates = tasks.len(), self_healed = healed, "fetch stage starting");

        let mut coordinator = Coordinator {
            catalog,
            store,
            records,
            records_dirty: false,
            touched: Vec::new(),
            advances: Vec::new(),
            summary: FetchSummary {
                candidates: tasks.len(),
                self_healed: healed,
                ..Default::default()
            },
        };

        let policy = AttemptPolicy {
            backoff: config.backoff(),
            timeout: config.attempt_timeout(),
        };
        let cancel = ctx.cancel.clone();
        let mut pool = spawn_pool(tasks, config.fetch_concurrency, ctx.cancel.clone(), {
            move |task: FetchTask| {
                let source = Arc::clone(&source);
                let cancel = cancel.clone();
                async move { fetch_and_extract(source.as_ref(), task, policy, &cancel).await }
            }
        });

        while let Some(report) = pool.next().await {
            coordinator.accept(report, ctx);
            if coordinator.pending() >= config.commit_batch_size {
                coordinator.commit().await?;
            }
        }
        let unstarted = pool.finish().await;
        coordinator.summary.skipped_cancelled = unstarted.len();
        coordinator.commit().await?;

        let deleted: BTreeSet<String> = catalog
            .list_by_status(CatalogStatus::Deleted)
            .await
            .context("listing tombstoned urls")?;
        let active = catalog
            .entries_by_status(CatalogStatus::Active)
            .await
            .context("listing active catalog entries")?;
        let flagged = flag_orphans(&mut coordinator.records, &active, &deleted);
        if flagged > 0 {
            coordinator.summary.orphans_flagged = flagged;
            store
                .replace_all(&coordinator.records)
                .await
                .context("writing orphan flags")?;
        }

        let summary = coordinator.summary;
        info!(
            unchanged = summary.unchanged,
            updated = summary.updated,
            inserted = summary.records_inserted,
            changed = summary.records_changed,
            failed = summary.failed.len(),
            skipped = summary.skipped_cancelled,
            "fetch stage finished"
        );
        Ok(summary)
    }
    .instrument(span)
    .await
}

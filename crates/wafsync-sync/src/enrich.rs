//! Enrichment stage: per-collection status lookup with batched record writes.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, info_span, warn, Instrument};
use wafsync_adapters::{CollectionStatus, RemoteError, StatusLookup};
use wafsync_core::{EnrichmentResult, EnrichmentState, ErrorKind, LookupResult};
use wafsync_storage::{RecordSet, RecordStore};

use crate::attempt::{call_remote, AttemptPolicy};
use crate::config::{EnrichmentScope, SyncConfig};
use crate::context::{CancelSignal, RunContext};
use crate::pool::spawn_pool;
use crate::summary::{EnrichSummary, FailedItem};

#[derive(Debug, Clone)]
pub struct EnrichTask {
    pub collection_id: String,
    /// `None` when the id was derived from the URL; no request is made.
    pub lookup_key: Option<String>,
}

#[derive(Debug)]
pub struct EnrichReport {
    pub result: EnrichmentResult,
    pub attempts: u32,
}

pub fn lookup_result(result: Result<CollectionStatus, RemoteError>) -> LookupResult {
    match result {
        Ok(status) => LookupResult::Found {
            granule_count: status.granule_count,
        },
        Err(RemoteError::NotFound { .. }) => LookupResult::NotFound,
        Err(err) if err.is_retryable() => LookupResult::TransientFailure {
            message: err.to_string(),
        },
        Err(err) => LookupResult::PermanentFailure {
            message: err.to_string(),
        },
    }
}

/// Records to query under `scope`. Orphaned records are skipped.
pub fn select_tasks(records: &RecordSet, scope: EnrichmentScope, ctx: &RunContext) -> Vec<EnrichTask> {
    records
        .values()
        .filter(|r| !r.orphaned)
        .filter(|r| match scope {
            EnrichmentScope::All => true,
            EnrichmentScope::Changed => ctx.merged_ids.contains(&r.collection_id),
        })
        .map(|r| EnrichTask {
            collection_id: r.collection_id.clone(),
            lookup_key: r.lookup_key().map(str::to_string),
        })
        .collect()
}

async fn query(
    lookup: &dyn StatusLookup,
    task: EnrichTask,
    policy: AttemptPolicy,
    cancel: &CancelSignal,
) -> EnrichReport {
    let Some(key) = task.lookup_key.as_deref() else {
        return EnrichReport {
            result: EnrichmentResult {
                collection_id: task.collection_id,
                result: LookupResult::NotFound,
            },
            attempts: 0,
        };
    };
    let (result, attempts) = call_remote(policy, cancel, key, || lookup.lookup(key)).await;
    EnrichReport {
        result: EnrichmentResult {
            collection_id: task.collection_id,
            result: lookup_result(result),
        },
        attempts,
    }
}

/// Query the status service for the selected records and apply the results.
pub async fn run_enrich(
    ctx: &RunContext,
    config: &SyncConfig,
    lookup: Arc<dyn StatusLookup>,
    store: &RecordStore,
) -> Result<EnrichSummary> {
    let span = info_span!("enrich", run_id = %ctx.run_id, scope = ?config.enrichment_scope);
    async {
        let mut records = store.load().await.context("loading record store")?;
        let tasks = select_tasks(&records, config.enrichment_scope, ctx);
        let mut states: BTreeMap<String, EnrichmentState> = tasks
            .iter()
            .map(|t| (t.collection_id.clone(), EnrichmentState::Pending))
            .collect();
        let mut summary = EnrichSummary {
            scope: config.enrichment_scope,
            considered: tasks.len(),
            url_derived: tasks.iter().filter(|t| t.lookup_key.is_none()).count(),
            ..Default::default()
        };
        info!(considered = summary.considered, "enrichment stage starting");

        let policy = AttemptPolicy {
            backoff: config.backoff(),
            timeout: config.attempt_timeout(),
        };
        let cancel = ctx.cancel.clone();
        let mut pool = spawn_pool(tasks, config.enrich_concurrency, ctx.cancel.clone(), {
            move |task: EnrichTask| {
                let lookup = Arc::clone(&lookup);
                let cancel = cancel.clone();
                async move { query(lookup.as_ref(), task, policy, &cancel).await }
            }
        });

        let mut uncommitted = 0usize;
        while let Some(report) = pool.next().await {
            let id = report.result.collection_id.clone();
            let Some(state) = states.get_mut(&id) else {
                continue;
            };
            *state = EnrichmentState::Queried;

            let changed = match (report.result.status_update(), records.get_mut(&id)) {
                (Some((in_osim, granules)), Some(record)) => record.apply_enrichment(in_osim, granules),
                _ => false,
            };
            *state = state.resolve(&report.result.result, changed);

            match &report.result.result {
                LookupResult::Found { .. } => summary.found += 1,
                LookupResult::NotFound => summary.not_found += 1,
                LookupResult::TransientFailure { message } => {
                    warn!(collection_id = %id, error = %message, "lookup retries exhausted; previous status kept");
                    summary.failed.push(FailedItem::new(
                        id.clone(),
                        ErrorKind::TransientNetwork,
                        message.clone(),
                        report.attempts,
                    ));
                }
                LookupResult::PermanentFailure { message } => {
                    warn!(collection_id = %id, error = %message, "lookup rejected; previous status kept");
                    summary.failed.push(FailedItem::new(
                        id.clone(),
                        ErrorKind::PermanentRequest,
                        message.clone(),
                        report.attempts,
                    ));
                }
            }

            if changed {
                uncommitted += 1;
                if uncommitted >= config.commit_batch_size {
                    store
                        .replace_all(&records)
                        .await
                        .context("writing enrichment batch")?;
                    uncommitted = 0;
                }
            }
        }
        pool.finish().await;
        if uncommitted > 0 {
            store
                .replace_all(&records)
                .await
                .context("writing enrichment batch")?;
        }

        for state in states.values() {
            match state {
                EnrichmentState::Updated => summary.updated += 1,
                EnrichmentState::Unchanged => summary.unchanged += 1,
                EnrichmentState::Pending | EnrichmentState::Queried => summary.skipped_cancelled += 1,
                EnrichmentState::Failed => {}
            }
        }
        info!(
            updated = summary.updated,
            unchanged = summary.unchanged,
            failed = summary.failed.len(),
            skipped = summary.skipped_cancelled,
            "enrichment stage finished"
        );
        Ok(summary)
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use wafsync_core::{ExtractedFields, MetadataRecord};

    fn record(id: &str, uuid: Option<&str>, orphaned: bool) -> MetadataRecord {
        let mut r = MetadataRecord::from_extraction(
            id,
            format!("https://w/{id}.xml"),
            ExtractedFields {
                uuid: uuid.map(str::to_string),
                ..Default::default()
            },
            Utc::now(),
        );
        r.orphaned = orphaned;
        r
    }

    #[test]
    fn lookup_results_map_onto_variants() {
        assert_eq!(
            lookup_result(Ok(CollectionStatus { granule_count: Some(3) })),
            LookupResult::Found { granule_count: Some(3) }
        );
        assert_eq!(
            lookup_result(Err(RemoteError::NotFound { url: "u".into() })),
            LookupResult::NotFound
        );
        assert!(matches!(
            lookup_result(Err(RemoteError::transient("u", "HTTP 503"))),
            LookupResult::TransientFailure { .. }
        ));
        assert!(matches!(
            lookup_result(Err(RemoteError::Permanent { url: "u".into(), status: 400 })),
            LookupResult::PermanentFailure { .. }
        ));
    }

    #[test]
    fn scope_selects_all_or_changed_and_skips_orphans() {
        let mut records = RecordSet::new();
        for r in [
            record("u-a", Some("u-a"), false),
            record("u-b", Some("u-b"), false),
            record("u-c", Some("u-c"), true),
            record("derived", None, false),
        ] {
            records.insert(r.collection_id.clone(), r);
        }
        let mut ctx = RunContext::new(CancelSignal::new());
        ctx.merged_ids.insert("u-b".into());

        let all = select_tasks(&records, EnrichmentScope::All, &ctx);
        let ids: Vec<_> = all.iter().map(|t| t.collection_id.as_str()).collect();
        assert_eq!(ids, vec!["derived", "u-a", "u-b"]);
        assert_eq!(all[0].lookup_key, None);
        assert_eq!(all[1].lookup_key.as_deref(), Some("u-a"));

        let changed = select_tasks(&records, EnrichmentScope::Changed, &ctx);
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].collection_id, "u-b");
    }
}

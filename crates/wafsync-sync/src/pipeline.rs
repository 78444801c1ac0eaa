//! Stage sequencing for one run.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{error, info, warn};
use wafsync_adapters::{DocumentSource, OsimClient, RemoteDirectory, StatusLookup, WafClient};
use wafsync_core::CatalogStatus;
use wafsync_storage::{CatalogStore, HttpFetcher, RecordStore, SqliteCatalogStore};

use crate::config::SyncConfig;
use crate::context::{CancelSignal, RunContext};
use crate::crawl::run_crawl;
use crate::enrich::run_enrich;
use crate::fetch::run_fetch;
use crate::summary::{
    run_reports_dir, write_run_reports, CatalogCounts, RunStatus, RunSummary, StoreDigest,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Crawl,
    Fetch,
    Enrich,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Crawl, Stage::Fetch, Stage::Enrich];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Crawl => "crawl",
            Self::Fetch => "fetch",
            Self::Enrich => "enrich",
        }
    }
}

pub struct SyncPipeline {
    config: Arc<SyncConfig>,
    catalog: Arc<dyn CatalogStore>,
    records: RecordStore,
    directory: Arc<dyn RemoteDirectory>,
    documents: Arc<dyn DocumentSource>,
    lookup: Arc<dyn StatusLookup>,
}

impl SyncPipeline {
    /// Build the pipeline with the HTTP clients and on-disk stores from `config`.
    pub async fn open(config: SyncConfig) -> Result<Self> {
        config.validate()?;
        let http = HttpFetcher::new(config.http_client_config())?;
        let waf = Arc::new(WafClient::new(
            http.clone(),
            config.waf_base_url.clone(),
            config.listing.clone(),
        ));
        let lookup = Arc::new(OsimClient::new(http, config.lookup_url_template.clone())?);
        let catalog_path = config.catalog_path();
        let catalog = SqliteCatalogStore::open(&catalog_path)
            .await
            .with_context(|| format!("opening catalog {}", catalog_path.display()))?;
        let records = RecordStore::new(config.record_store_path());
        Ok(Self::with_components(
            config,
            Arc::new(catalog),
            records,
            waf.clone(),
            waf,
            lookup,
        ))
    }

    pub fn with_components(
        config: SyncConfig,
        catalog: Arc<dyn CatalogStore>,
        records: RecordStore,
        directory: Arc<dyn RemoteDirectory>,
        documents: Arc<dyn DocumentSource>,
        lookup: Arc<dyn StatusLookup>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            catalog,
            records,
            directory,
            documents,
            lookup,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn run_once(&self, cancel: CancelSignal) -> Result<RunSummary> {
        self.run_stages(&Stage::ALL, cancel).await
    }

    /// Run `stages` in order. Reports are written even when a stage fails.
    pub async fn run_stages(&self, stages: &[Stage], cancel: CancelSignal) -> Result<RunSummary> {
        let mut ctx = RunContext::new(cancel);
        let timeout_guard = self
            .config
            .run_timeout()
            .map(|timeout| ctx.cancel.cancel_after(timeout));
        let reports_dir = run_reports_dir(&self.config.reports_dir, ctx.run_id);
        info!(run_id = %ctx.run_id, stages = ?stages, "sync run starting");

        let mut summary = RunSummary {
            run_id: ctx.run_id,
            started_at: ctx.started_at,
            finished_at: ctx.started_at,
            status: RunStatus::Completed,
            stages: Vec::new(),
            crawl: None,
            fetch: None,
            enrich: None,
            catalog: CatalogCounts::default(),
            record_store: None,
            error: None,
            reports_dir: reports_dir.display().to_string(),
        };

        let outcome = self
            .execute(stages, &mut ctx, &mut summary, &reports_dir)
            .await;
        if let Some(guard) = timeout_guard {
            guard.abort();
        }
        if let Err(err) = &outcome {
            error!(run_id = %ctx.run_id, error = %format!("{err:#}"), "sync run aborted");
            summary.error = Some(format!("{err:#}"));
        }

        match self.catalog_counts().await {
            Ok(counts) => summary.catalog = counts,
            Err(err) => warn!(error = %err, "could not count catalog entries"),
        }
        match self.records.digest().await {
            Ok(sha256) => {
                let rows = self.records.load().await.map(|r| r.len()).unwrap_or_default();
                summary.record_store = Some(StoreDigest {
                    path: self.records.path().display().to_string(),
                    rows,
                    sha256,
                });
            }
            Err(err) => warn!(error = %err, "could not hash record store"),
        }
        summary.finished_at = Utc::now();
        summary.status = summary.derive_status(ctx.is_cancelled());

        write_run_reports(&summary)
            .await
            .context("writing run reports")?;
        info!(
            run_id = %summary.run_id,
            status = ?summary.status,
            failures = summary.failure_count(),
            "sync run finished"
        );
        outcome.map(|()| summary)
    }

    async fn execute(
        &self,
        stages: &[Stage],
        ctx: &mut RunContext,
        summary: &mut RunSummary,
        reports_dir: &Path,
    ) -> Result<()> {
        for stage in stages {
            if ctx.is_cancelled() {
                warn!(stage = stage.as_str(), "run cancelled; remaining stages skipped");
                break;
            }
            summary.stages.push(stage.as_str().to_string());
            match stage {
                Stage::Crawl => {
                    let crawl = run_crawl(
                        ctx,
                        &self.config,
                        Arc::clone(&self.directory),
                        self.catalog.as_ref(),
                        reports_dir,
                    )
                    .await?;
                    summary.crawl = Some(crawl);
                }
                Stage::Fetch => {
                    let fetch = run_fetch(
                        ctx,
                        &self.config,
                        Arc::clone(&self.documents),
                        self.catalog.as_ref(),
                        &self.records,
                    )
                    .await?;
                    summary.fetch = Some(fetch);
                }
                Stage::Enrich => {
                    let enrich =
                        run_enrich(ctx, &self.config, Arc::clone(&self.lookup), &self.records)
                            .await?;
                    summary.enrich = Some(enrich);
                }
            }
        }
        Ok(())
    }

    async fn catalog_counts(&self) -> Result<CatalogCounts> {
        Ok(CatalogCounts {
            active: self.catalog.list_by_status(CatalogStatus::Active).await?.len(),
            deleted: self.catalog.list_by_status(CatalogStatus::Deleted).await?.len(),
        })
    }
}

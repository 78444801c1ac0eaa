//! Change-tracking sync engine: crawl, conditional fetch, enrichment.

pub mod attempt;
pub mod config;
pub mod context;
pub mod crawl;
pub mod enrich;
pub mod fetch;
pub mod maintenance;
pub mod pipeline;
pub mod pool;
pub mod summary;

pub use config::{EnrichmentScope, SyncConfig};
pub use context::{CancelSignal, RunContext};
pub use crawl::{compute_diff, run_crawl, CatalogDiff};
pub use enrich::run_enrich;
pub use fetch::{merge_extraction, run_fetch, MergeEffect};
pub use maintenance::{cleanup_artifacts, dump_catalog, restore_catalog, CleanupReport};
pub use pipeline::{Stage, SyncPipeline};
pub use summary::{
    CrawlSummary, EnrichSummary, FailedItem, FetchSummary, RunStatus, RunSummary,
};

pub const CRATE_NAME: &str = "wafsync-sync";

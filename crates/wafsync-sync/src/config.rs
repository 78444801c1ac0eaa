//! Immutable run configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use wafsync_adapters::ListingRules;
use wafsync_storage::{BackoffPolicy, HttpClientConfig};

pub const CATALOG_DB_FILE: &str = "etag_store.db";
pub const RECORD_STORE_FILE: &str = "metadata_extracted.parquet";
pub const SNAPSHOTS_DIR: &str = "snapshots";

/// Which records the enrichment stage queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentScope {
    #[default]
    All,
    /// Only records merged by the fetch stage of the same run.
    Changed,
}

impl EnrichmentScope {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "all" => Some(Self::All),
            "changed" | "changed_this_run" => Some(Self::Changed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub waf_base_url: String,
    pub lookup_url_template: String,
    pub data_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub crawl_concurrency: usize,
    pub fetch_concurrency: usize,
    pub enrich_concurrency: usize,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub commit_batch_size: usize,
    pub enrichment_scope: EnrichmentScope,
    pub run_timeout_secs: Option<u64>,
    pub listing: ListingRules,
    pub keep_reports: usize,
    pub keep_snapshots: usize,
    pub max_artifact_age_days: Option<u64>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            waf_base_url: "https://data.noaa.gov/waf/".to_string(),
            lookup_url_template: "https://data.noaa.gov/onestop/api/search/collection/{uuid}"
                .to_string(),
            data_dir: PathBuf::from("./data"),
            reports_dir: PathBuf::from("./reports"),
            user_agent: "TMF-Collection-Tool/2.0".to_string(),
            http_timeout_secs: 30,
            crawl_concurrency: 15,
            fetch_concurrency: 10,
            enrich_concurrency: 100,
            max_attempts: 4,
            backoff_base_ms: 2_000,
            backoff_max_ms: 30_000,
            commit_batch_size: 500,
            enrichment_scope: EnrichmentScope::All,
            run_timeout_secs: None,
            listing: ListingRules::default(),
            keep_reports: 14,
            keep_snapshots: 7,
            max_artifact_age_days: None,
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match env_string(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow::anyhow!("{key}={raw} is not a valid value")),
    }
}

impl SyncConfig {
    /// Defaults, overlaid by the YAML file (`path`, else `WAFSYNC_CONFIG`),
    /// overlaid by `WAFSYNC_*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = path
            .map(Path::to_path_buf)
            .or_else(|| env_string("WAFSYNC_CONFIG").map(PathBuf::from));
        let mut config = match file {
            Some(path) => Self::from_yaml_file(&path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML overlay; absent keys keep their defaults.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(v) = env_string("WAFSYNC_WAF_BASE_URL") {
            self.waf_base_url = v;
        }
        if let Some(v) = env_string("WAFSYNC_LOOKUP_URL") {
            self.lookup_url_template = v;
        }
        if let Some(v) = env_string("WAFSYNC_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = env_string("WAFSYNC_REPORTS_DIR") {
            self.reports_dir = PathBuf::from(v);
        }
        if let Some(v) = env_string("WAFSYNC_USER_AGENT") {
            self.user_agent = v;
        }
        if let Some(v) = env_parse("WAFSYNC_HTTP_TIMEOUT_SECS")? {
            self.http_timeout_secs = v;
        }
        if let Some(v) = env_parse("WAFSYNC_CRAWL_CONCURRENCY")? {
            self.crawl_concurrency = v;
        }
        if let Some(v) = env_parse("WAFSYNC_FETCH_CONCURRENCY")? {
            self.fetch_concurrency = v;
        }
        if let Some(v) = env_parse("WAFSYNC_ENRICH_CONCURRENCY")? {
            self.enrich_concurrency = v;
        }
        if let Some(v) = env_parse("WAFSYNC_MAX_ATTEMPTS")? {
            self.max_attempts = v;
        }
        if let Some(v) = env_parse("WAFSYNC_BACKOFF_BASE_MS")? {
            self.backoff_base_ms = v;
        }
        if let Some(v) = env_parse("WAFSYNC_BACKOFF_MAX_MS")? {
            self.backoff_max_ms = v;
        }
        if let Some(v) = env_parse("WAFSYNC_COMMIT_BATCH")? {
            self.commit_batch_size = v;
        }
        if let Some(raw) = env_string("WAFSYNC_ENRICH_SCOPE") {
            self.enrichment_scope = EnrichmentScope::parse(&raw)
                .with_context(|| format!("WAFSYNC_ENRICH_SCOPE={raw} (expected all|changed)"))?;
        }
        if let Some(v) = env_parse("WAFSYNC_RUN_TIMEOUT_SECS")? {
            self.run_timeout_secs = Some(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.crawl_concurrency == 0 || self.fetch_concurrency == 0 || self.enrich_concurrency == 0
        {
            bail!("worker concurrency must be at least 1");
        }
        if self.max_attempts == 0 {
            bail!("max_attempts must be at least 1");
        }
        if self.commit_batch_size == 0 {
            bail!("commit_batch_size must be at least 1");
        }
        if !self.lookup_url_template.contains("{uuid}") {
            bail!("lookup_url_template must contain {{uuid}}");
        }
        Ok(())
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.data_dir.join(CATALOG_DB_FILE)
    }

    pub fn record_store_path(&self) -> PathBuf {
        self.data_dir.join(RECORD_STORE_FILE)
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.data_dir.join(SNAPSHOTS_DIR)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_millis(self.backoff_max_ms),
        }
    }

    /// Per-attempt network timeout.
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_secs.map(Duration::from_secs)
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.attempt_timeout(),
            user_agent: Some(self.user_agent.clone()),
            max_idle_per_host: self
                .fetch_concurrency
                .max(self.crawl_concurrency)
                .max(self.enrich_concurrency),
        }
    }
}

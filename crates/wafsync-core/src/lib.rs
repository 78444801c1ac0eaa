//! Core domain model for the WAF collection sync engine.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "wafsync-core";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatalogStatus {
    Active,
    Deleted,
}

impl CatalogStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Deleted => "deleted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }
}

/// Sync state of one remote document URL.
///
/// Entries are never removed. A URL that disappears from the remote listing is
/// tombstoned and keeps its validator so a later reappearance resumes from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub url: String,
    pub validator: Option<String>,
    pub status: CatalogStatus,
    pub discovered_at: DateTime<Utc>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    /// Record id produced by the last successful extraction of this URL.
    #[serde(default)]
    pub collection_id: Option<String>,
}

impl CatalogEntry {
    pub fn discovered(url: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            url: url.into(),
            validator: None,
            status: CatalogStatus::Active,
            discovered_at: now,
            last_seen_at: None,
            deleted_at: None,
            collection_id: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == CatalogStatus::Active
    }

    pub fn tombstone(&mut self, now: DateTime<Utc>) {
        self.status = CatalogStatus::Deleted;
        self.deleted_at = Some(now);
    }

    pub fn reactivate(&mut self) {
        self.status = CatalogStatus::Active;
        self.deleted_at = None;
    }

    pub fn mark_seen(&mut self, now: DateTime<Utc>) {
        self.last_seen_at = Some(now);
    }

    pub fn advance_validator(&mut self, validator: Option<String>, now: DateTime<Utc>) {
        self.validator = validator;
        self.last_seen_at = Some(now);
    }

    pub fn record_extraction(
        &mut self,
        collection_id: impl Into<String>,
        validator: Option<String>,
        now: DateTime<Utc>,
    ) {
        self.collection_id = Some(collection_id.into());
        self.advance_validator(validator, now);
    }
}

/// Registration of a collection in the downstream search catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OsimStatus {
    #[default]
    Unknown,
    Present,
    Absent,
}

impl OsimStatus {
    pub fn from_flag(flag: Option<bool>) -> Self {
        match flag {
            None => Self::Unknown,
            Some(true) => Self::Present,
            Some(false) => Self::Absent,
        }
    }

    pub fn as_flag(self) -> Option<bool> {
        match self {
            Self::Unknown => None,
            Self::Present => Some(true),
            Self::Absent => Some(false),
        }
    }
}

/// Fields owned by the extraction stage.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExtractedFields {
    pub uuid: Option<String>,
    pub file_identifier: Option<String>,
    pub title: Option<String>,
    pub edition: Option<String>,
    pub doi: Option<String>,
    pub date_stamp: Option<String>,
    #[serde(rename = "abstract")]
    pub abstract_text: Option<String>,
    pub west_bound: Option<f64>,
    pub east_bound: Option<f64>,
    pub south_bound: Option<f64>,
    pub north_bound: Option<f64>,
    pub temporal_begin: Option<String>,
    pub temporal_end: Option<String>,
}

impl ExtractedFields {
    /// Identifier carried by the document itself, if any.
    pub fn document_id(&self) -> Option<&str> {
        [self.uuid.as_deref(), self.file_identifier.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|id| !id.is_empty() && !id.eq_ignore_ascii_case("none"))
    }
}

/// Stable record key: the document's own identifier, falling back to a
/// name-based UUID of the source URL.
pub fn derive_collection_id(fields: &ExtractedFields, source_url: &str) -> String {
    match fields.document_id() {
        Some(id) => id.to_string(),
        None => Uuid::new_v5(&Uuid::NAMESPACE_URL, source_url.as_bytes()).to_string(),
    }
}

/// One row of the record store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub collection_id: String,
    pub source_url: String,
    pub fields: ExtractedFields,
    pub in_osim: OsimStatus,
    pub granule_count: Option<i64>,
    pub orphaned: bool,
    pub last_updated: DateTime<Utc>,
}

impl MetadataRecord {
    pub fn from_extraction(
        collection_id: impl Into<String>,
        source_url: impl Into<String>,
        fields: ExtractedFields,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            collection_id: collection_id.into(),
            source_url: source_url.into(),
            fields,
            in_osim: OsimStatus::Unknown,
            granule_count: None,
            orphaned: false,
            last_updated: now,
        }
    }

    /// Overwrites extraction-owned fields only; enrichment fields are kept.
    pub fn apply_extraction(
        &mut self,
        source_url: impl Into<String>,
        fields: ExtractedFields,
        now: DateTime<Utc>,
    ) {
        self.source_url = source_url.into();
        self.fields = fields;
        self.orphaned = false;
        self.last_updated = now;
    }

    /// Overwrites enrichment-owned fields only. Returns whether anything changed.
    pub fn apply_enrichment(&mut self, in_osim: OsimStatus, granule_count: Option<i64>) -> bool {
        if self.in_osim == in_osim && self.granule_count == granule_count {
            return false;
        }
        self.in_osim = in_osim;
        self.granule_count = granule_count;
        true
    }

    /// Key for the status lookup; `None` when the id was derived from the URL.
    pub fn lookup_key(&self) -> Option<&str> {
        self.fields
            .document_id()
            .filter(|id| *id == self.collection_id)
    }
}

/// Failure taxonomy shared by every stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientNetwork,
    PermanentRequest,
    NotFound,
    Parse,
    StoreIntegrity,
    Cancelled,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::TransientNetwork)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::TransientNetwork => "transient_network",
            Self::PermanentRequest => "permanent_request",
            Self::NotFound => "not_found",
            Self::Parse => "parse",
            Self::StoreIntegrity => "store_integrity",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of one conditional retrieval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcomeKind {
    Unchanged,
    Updated {
        content: Vec<u8>,
        validator: Option<String>,
    },
    Failed(ErrorKind),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    pub url: String,
    pub kind: FetchOutcomeKind,
}

impl FetchOutcome {
    pub fn unchanged(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            kind: FetchOutcomeKind::Unchanged,
        }
    }

    pub fn updated(url: impl Into<String>, content: Vec<u8>, validator: Option<String>) -> Self {
        Self {
            url: url.into(),
            kind: FetchOutcomeKind::Updated { content, validator },
        }
    }

    pub fn failed(url: impl Into<String>, kind: ErrorKind) -> Self {
        Self {
            url: url.into(),
            kind: FetchOutcomeKind::Failed(kind),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum LookupResult {
    Found { granule_count: Option<i64> },
    NotFound,
    TransientFailure { message: String },
    PermanentFailure { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentResult {
    pub collection_id: String,
    pub result: LookupResult,
}

impl EnrichmentResult {
    /// Status values to write, or `None` when the previous value must be kept.
    pub fn status_update(&self) -> Option<(OsimStatus, Option<i64>)> {
        match &self.result {
            LookupResult::Found { granule_count } => Some((OsimStatus::Present, *granule_count)),
            LookupResult::NotFound => Some((OsimStatus::Absent, None)),
            LookupResult::TransientFailure { .. } | LookupResult::PermanentFailure { .. } => None,
        }
    }
}

/// Per-collection progress through the enrichment stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentState {
    Pending,
    Queried,
    Updated,
    Unchanged,
    Failed,
}

impl EnrichmentState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Updated | Self::Unchanged | Self::Failed)
    }

    /// `Queried` resolves to a terminal state once the result has been applied.
    pub fn resolve(self, result: &LookupResult, changed: bool) -> Self {
        debug_assert_eq!(self, Self::Queried);
        match result {
            LookupResult::Found { .. } | LookupResult::NotFound if changed => Self::Updated,
            LookupResult::Found { .. } | LookupResult::NotFound => Self::Unchanged,
            LookupResult::TransientFailure { .. } | LookupResult::PermanentFailure { .. } => {
                Self::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).single().unwrap()
    }

    fn fields(uuid: Option<&str>, title: &str) -> ExtractedFields {
        ExtractedFields {
            uuid: uuid.map(str::to_string),
            title: Some(title.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn tombstone_keeps_validator_and_reactivation_clears_deleted_at() {
        let mut entry = CatalogEntry::discovered("https://example.test/a.xml", ts(1));
        entry.record_extraction("u-1", Some("\"v1\"".into()), ts(2));
        entry.tombstone(ts(3));
        assert_eq!(entry.status, CatalogStatus::Deleted);
        assert_eq!(entry.deleted_at, Some(ts(3)));
        assert_eq!(entry.validator.as_deref(), Some("\"v1\""));
        assert_eq!(entry.collection_id.as_deref(), Some("u-1"));

        entry.reactivate();
        assert!(entry.is_active());
        assert_eq!(entry.deleted_at, None);
        assert_eq!(entry.discovered_at, ts(1));
    }

    #[test]
    fn collection_id_prefers_document_identifier() {
        let with_uuid = fields(Some(" 8f1c-uuid "), "A");
        assert_eq!(derive_collection_id(&with_uuid, "https://x/a.xml"), "8f1c-uuid");

        let with_file_id = ExtractedFields {
            file_identifier: Some("gov.noaa:ABC".into()),
            uuid: Some("None".into()),
            ..Default::default()
        };
        assert_eq!(derive_collection_id(&with_file_id, "https://x/a.xml"), "gov.noaa:ABC");

        let anonymous = fields(None, "B");
        let first = derive_collection_id(&anonymous, "https://x/b.xml");
        let second = derive_collection_id(&anonymous, "https://x/b.xml");
        assert_eq!(first, second);
        assert_ne!(first, derive_collection_id(&anonymous, "https://x/c.xml"));
    }

    #[test]
    fn url_derived_ids_have_no_lookup_key() {
        let anonymous = fields(None, "B");
        let id = derive_collection_id(&anonymous, "https://x/b.xml");
        let record = MetadataRecord::from_extraction(id, "https://x/b.xml", anonymous, ts(1));
        assert_eq!(record.lookup_key(), None);

        let named = fields(Some("abc"), "C");
        let record = MetadataRecord::from_extraction("abc", "https://x/c.xml", named, ts(1));
        assert_eq!(record.lookup_key(), Some("abc"));
    }

    #[test]
    fn extraction_and_enrichment_do_not_overwrite_each_other() {
        let mut record =
            MetadataRecord::from_extraction("abc", "https://x/c.xml", fields(Some("abc"), "Old"), ts(1));
        assert_eq!(record.in_osim, OsimStatus::Unknown);

        assert!(record.apply_enrichment(OsimStatus::Present, Some(42)));
        record.apply_extraction("https://x/c.xml", fields(Some("abc"), "New"), ts(2));
        assert_eq!(record.in_osim, OsimStatus::Present);
        assert_eq!(record.granule_count, Some(42));
        assert_eq!(record.fields.title.as_deref(), Some("New"));

        assert!(!record.apply_enrichment(OsimStatus::Present, Some(42)));
        assert_eq!(record.fields.title.as_deref(), Some("New"));
        assert_eq!(record.last_updated, ts(2));
    }

    #[test]
    fn enrichment_state_resolution() {
        let found = LookupResult::Found { granule_count: Some(3) };
        let transient = LookupResult::TransientFailure { message: "timeout".into() };
        assert_eq!(EnrichmentState::Queried.resolve(&found, true), EnrichmentState::Updated);
        assert_eq!(EnrichmentState::Queried.resolve(&found, false), EnrichmentState::Unchanged);
        assert_eq!(
            EnrichmentState::Queried.resolve(&LookupResult::NotFound, true),
            EnrichmentState::Updated
        );
        assert_eq!(EnrichmentState::Queried.resolve(&transient, false), EnrichmentState::Failed);
        assert!(!EnrichmentState::Pending.is_terminal());
    }

    #[test]
    fn failed_lookups_keep_previous_status() {
        let result = EnrichmentResult {
            collection_id: "abc".into(),
            result: LookupResult::PermanentFailure { message: "400".into() },
        };
        assert_eq!(result.status_update(), None);

        let not_found = EnrichmentResult {
            collection_id: "abc".into(),
            result: LookupResult::NotFound,
        };
        assert_eq!(not_found.status_update(), Some((OsimStatus::Absent, None)));
    }

    #[test]
    fn status_and_error_kinds_serialize_as_snake_case() {
        assert_eq!(serde_json::to_string(&CatalogStatus::Deleted).unwrap(), "\"deleted\"");
        assert_eq!(
            serde_json::to_string(&ErrorKind::TransientNetwork).unwrap(),
            "\"transient_network\""
        );
        assert_eq!(CatalogStatus::parse("active"), Some(CatalogStatus::Active));
        assert!(ErrorKind::TransientNetwork.is_retryable());
        assert!(!ErrorKind::Parse.is_retryable());
    }
}

//! Remote collaborator contracts + reqwest-backed implementations.

use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use wafsync_core::ErrorKind;
use wafsync_storage::{classify_reqwest_error, classify_status, RetryDisposition};

pub mod iso;
pub mod listing;
pub mod osim;
pub mod waf;

pub use iso::{extract_iso_metadata, ExtractError};
pub use listing::{parse_listing, ListingRules};
pub use osim::OsimClient;
pub use waf::WafClient;

pub const CRATE_NAME: &str = "wafsync-adapters";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("transient failure for {url}: {message}")]
    Transient { url: String, message: String },
    #[error("HTTP {status} for {url}")]
    Permanent { url: String, status: u16 },
    #[error("not found: {url}")]
    NotFound { url: String },
    #[error("malformed response from {url}: {message}")]
    Malformed { url: String, message: String },
}

impl RemoteError {
    pub fn transient(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Map a non-success status onto the failure taxonomy.
    pub fn from_status(url: &str, status: StatusCode) -> Self {
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Self::NotFound {
                url: url.to_string(),
            };
        }
        match classify_status(status) {
            RetryDisposition::Retryable => Self::transient(url, format!("HTTP {status}")),
            RetryDisposition::NonRetryable => Self::Permanent {
                url: url.to_string(),
                status: status.as_u16(),
            },
        }
    }

    pub fn from_transport(url: &str, err: &reqwest::Error) -> Self {
        match classify_reqwest_error(err) {
            RetryDisposition::Retryable => Self::transient(url, err.to_string()),
            RetryDisposition::NonRetryable => Self::Permanent {
                url: url.to_string(),
                status: err.status().map(|s| s.as_u16()).unwrap_or(0),
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient { .. } => ErrorKind::TransientNetwork,
            Self::Permanent { .. } => ErrorKind::PermanentRequest,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Malformed { .. } => ErrorKind::Parse,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

/// Children of one directory node, already filtered by the listing rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Listing {
    pub directories: Vec<String>,
    pub documents: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionalFetch {
    NotModified,
    Modified {
        body: Vec<u8>,
        validator: Option<String>,
    },
}

/// Granule information for a collection known to the lookup service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CollectionStatus {
    pub granule_count: Option<i64>,
}

#[async_trait]
pub trait RemoteDirectory: Send + Sync {
    fn root_url(&self) -> &str;

    async fn list(&self, url: &str) -> Result<Listing, RemoteError>;
}

#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Retrieve `url`, sending `validator` as the cache precondition when present.
    async fn fetch_conditional(
        &self,
        url: &str,
        validator: Option<&str>,
    ) -> Result<ConditionalFetch, RemoteError>;
}

#[async_trait]
pub trait StatusLookup: Send + Sync {
    /// `Err(RemoteError::NotFound)` when the service does not know the collection.
    async fn lookup(&self, collection_id: &str) -> Result<CollectionStatus, RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_follows_taxonomy() {
        let url = "https://waf.test/a.xml";
        assert_eq!(
            RemoteError::from_status(url, StatusCode::NOT_FOUND).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            RemoteError::from_status(url, StatusCode::GONE).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            RemoteError::from_status(url, StatusCode::SERVICE_UNAVAILABLE).kind(),
            ErrorKind::TransientNetwork
        );
        assert_eq!(
            RemoteError::from_status(url, StatusCode::TOO_MANY_REQUESTS).kind(),
            ErrorKind::TransientNetwork
        );
        let forbidden = RemoteError::from_status(url, StatusCode::FORBIDDEN);
        assert_eq!(forbidden.kind(), ErrorKind::PermanentRequest);
        assert!(!forbidden.is_retryable());
        assert_eq!(forbidden.to_string(), "HTTP 403 for https://waf.test/a.xml");
    }
}

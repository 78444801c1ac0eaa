//! Collection status lookup against the OneStop search API.

use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use wafsync_storage::HttpFetcher;

use crate::{CollectionStatus, RemoteError, StatusLookup};

pub const ID_PLACEHOLDER: &str = "{uuid}";

#[derive(Debug, Deserialize)]
struct LookupBody {
    #[serde(default)]
    meta: LookupMeta,
}

#[derive(Debug, Default, Deserialize)]
struct LookupMeta {
    #[serde(rename = "totalGranules")]
    total_granules: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct OsimClient {
    http: HttpFetcher,
    url_template: String,
}

impl OsimClient {
    /// `url_template` must contain `{uuid}`.
    pub fn new(http: HttpFetcher, url_template: impl Into<String>) -> anyhow::Result<Self> {
        let url_template = url_template.into();
        if !url_template.contains(ID_PLACEHOLDER) {
            anyhow::bail!("lookup url template {url_template} has no {ID_PLACEHOLDER} placeholder");
        }
        Ok(Self { http, url_template })
    }

    pub fn url_for(&self, collection_id: &str) -> Result<String, RemoteError> {
        let raw = self.url_template.replace(ID_PLACEHOLDER, collection_id.trim());
        Url::parse(&raw)
            .map(|u| u.to_string())
            .map_err(|e| RemoteError::Permanent {
                url: format!("{raw} ({e})"),
                status: 0,
            })
    }
}

pub fn parse_lookup_body(url: &str, body: &[u8]) -> Result<CollectionStatus, RemoteError> {
    let parsed: LookupBody = serde_json::from_slice(body).map_err(|e| RemoteError::Malformed {
        url: url.to_string(),
        message: e.to_string(),
    })?;
    Ok(CollectionStatus {
        granule_count: parsed.meta.total_granules,
    })
}

#[async_trait]
impl StatusLookup for OsimClient {
    async fn lookup(&self, collection_id: &str) -> Result<CollectionStatus, RemoteError> {
        let url = self.url_for(collection_id)?;
        let resp = self
            .http
            .get(&url, None)
            .await
            .map_err(|e| RemoteError::from_transport(&url, &e))?;
        if !resp.status.is_success() {
            return Err(RemoteError::from_status(&url, resp.status));
        }
        parse_lookup_body(&url, &resp.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_granule_count_and_tolerates_missing_meta() {
        let url = "https://lookup.test/c/1";
        assert_eq!(
            parse_lookup_body(url, br#"{"meta":{"totalGranules":42},"data":[]}"#).unwrap(),
            CollectionStatus {
                granule_count: Some(42)
            }
        );
        assert_eq!(
            parse_lookup_body(url, br#"{"data":[]}"#).unwrap(),
            CollectionStatus::default()
        );
        let err = parse_lookup_body(url, b"<html>").unwrap_err();
        assert_eq!(err.kind(), wafsync_core::ErrorKind::Parse);
    }

    #[test]
    fn template_requires_placeholder() {
        let http = HttpFetcher::new(Default::default()).unwrap();
        assert!(OsimClient::new(http.clone(), "https://lookup.test/c/").is_err());
        let client = OsimClient::new(http, "https://lookup.test/c/{uuid}").unwrap();
        assert_eq!(
            client.url_for(" 8f1c-uuid ").unwrap(),
            "https://lookup.test/c/8f1c-uuid"
        );
    }
}

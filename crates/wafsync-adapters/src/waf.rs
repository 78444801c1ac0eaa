//! Web Accessible Folder client: directory listings and conditional document GETs.

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;
use wafsync_storage::HttpFetcher;

use crate::listing::{parse_listing, ListingRules};
use crate::{ConditionalFetch, DocumentSource, Listing, RemoteDirectory, RemoteError};

#[derive(Debug, Clone)]
pub struct WafClient {
    http: HttpFetcher,
    root_url: String,
    rules: ListingRules,
}

impl WafClient {
    pub fn new(http: HttpFetcher, root_url: impl Into<String>, rules: ListingRules) -> Self {
        let mut root_url = root_url.into();
        if !root_url.ends_with('/') {
            root_url.push('/');
        }
        Self {
            http,
            root_url,
            rules,
        }
    }
}

#[async_trait]
impl RemoteDirectory for WafClient {
    fn root_url(&self) -> &str {
        &self.root_url
    }

    async fn list(&self, url: &str) -> Result<Listing, RemoteError> {
        let resp = self
            .http
            .get(url, None)
            .await
            .map_err(|e| RemoteError::from_transport(url, &e))?;
        if !resp.status.is_success() {
            return Err(RemoteError::from_status(url, resp.status));
        }
        let html = String::from_utf8_lossy(&resp.body);
        let listing = parse_listing(url, &html, &self.rules);
        debug!(
            url,
            directories = listing.directories.len(),
            documents = listing.documents.len(),
            "listing parsed"
        );
        Ok(listing)
    }
}

#[async_trait]
impl DocumentSource for WafClient {
    async fn fetch_conditional(
        &self,
        url: &str,
        validator: Option<&str>,
    ) -> Result<ConditionalFetch, RemoteError> {
        let resp = self
            .http
            .get(url, validator)
            .await
            .map_err(|e| RemoteError::from_transport(url, &e))?;

        if resp.status == StatusCode::NOT_MODIFIED {
            return Ok(ConditionalFetch::NotModified);
        }
        if !resp.status.is_success() {
            return Err(RemoteError::from_status(url, resp.status));
        }

        let fresh = resp.etag();
        // Servers that ignore If-None-Match still echo the unchanged tag.
        if validator.is_some() && fresh.as_deref() == validator {
            return Ok(ConditionalFetch::NotModified);
        }
        Ok(ConditionalFetch::Modified {
            body: resp.body,
            validator: fresh,
        })
    }
}

//! Directory listing (auto-index HTML) parsing.

use std::collections::BTreeSet;

use reqwest::Url;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};

use crate::Listing;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListingRules {
    /// Links containing any of these fragments are skipped.
    pub exclude_fragments: Vec<String>,
    /// Case-insensitive suffix identifying leaf documents.
    pub leaf_suffix: String,
    /// Directories named `iso/` are entered through their `xml/` child.
    pub rewrite_iso_dirs: bool,
}

impl Default for ListingRules {
    fn default() -> Self {
        Self {
            exclude_fragments: vec![
                "/iso_u/".to_string(),
                "/templates/".to_string(),
                "/DART/fgdc/xml".to_string(),
            ],
            leaf_suffix: ".xml".to_string(),
            rewrite_iso_dirs: true,
        }
    }
}

impl ListingRules {
    pub fn is_excluded(&self, url: &str) -> bool {
        self.exclude_fragments.iter().any(|f| url.contains(f.as_str()))
    }

    pub fn is_document(&self, url: &str) -> bool {
        url.to_ascii_lowercase()
            .ends_with(&self.leaf_suffix.to_ascii_lowercase())
    }

    /// Directory URL actually requested for `url`.
    pub fn directory_target(&self, url: &str) -> String {
        if self.rewrite_iso_dirs && url.ends_with("/iso/") {
            format!("{url}xml/")
        } else {
            url.to_string()
        }
    }
}

/// Extract the children of `base_url` from an auto-index page.
///
/// Sort links (`?C=N;O=D`), fragments, parent links and anything outside
/// `base_url` are ignored. Output lists are sorted and deduplicated.
pub fn parse_listing(base_url: &str, html: &str, rules: &ListingRules) -> Listing {
    let Ok(base) = Url::parse(base_url) else {
        return Listing::default();
    };
    let Ok(anchors) = Selector::parse("a[href]") else {
        return Listing::default();
    };

    let document = Html::parse_document(html);
    let mut directories = BTreeSet::new();
    let mut documents = BTreeSet::new();

    for anchor in document.select(&anchors) {
        let Some(href) = anchor.value().attr("href").map(str::trim) else {
            continue;
        };
        if href.is_empty() || href.starts_with('?') || href.starts_with('#') {
            continue;
        }
        let Ok(mut joined) = base.join(href) else {
            continue;
        };
        joined.set_query(None);
        joined.set_fragment(None);
        let child = joined.to_string();

        if child.len() <= base_url.len() || !child.starts_with(base_url) {
            continue;
        }
        if rules.is_excluded(&child) {
            continue;
        }
        if rules.is_document(&child) {
            documents.insert(child);
        } else if child.ends_with('/') {
            directories.insert(rules.directory_target(&child));
        }
    }

    Listing {
        directories: directories.into_iter().collect(),
        documents: documents.into_iter().collect(),
    }
}

//! ISO 19115/19139 metadata extraction.

use std::borrow::Cow;

use encoding_rs::{Encoding, UTF_8};
use roxmltree::{Document, Node};
use thiserror::Error;
use wafsync_core::{ErrorKind, ExtractedFields};

const GMD: &str = "http://www.isotc211.org/2005/gmd";
const GCO: &str = "http://www.isotc211.org/2005/gco";
const GMX: &str = "http://www.isotc211.org/2005/gmx";
const XLINK: &str = "http://www.w3.org/1999/xlink";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("document is not valid {0}")]
    Encoding(&'static str),
    #[error("malformed XML: {0}")]
    Xml(#[from] roxmltree::Error),
    #[error("root element <{0}> is not ISO metadata")]
    NotIsoMetadata(String),
}

impl ExtractError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Parse
    }
}

fn is_element(node: Node<'_, '_>, ns: &str, name: &str) -> bool {
    node.is_element() && node.tag_name().name() == name && node.tag_name().namespace() == Some(ns)
}

fn descendant<'a, 'i>(node: Node<'a, 'i>, ns: &str, name: &str) -> Option<Node<'a, 'i>> {
    node.descendants().find(|n| is_element(*n, ns, name))
}

fn child<'a, 'i>(node: Node<'a, 'i>, ns: &str, name: &str) -> Option<Node<'a, 'i>> {
    node.children().find(|n| is_element(*n, ns, name))
}

fn text_of(node: Node<'_, '_>) -> Option<String> {
    let text: String = node
        .descendants()
        .filter(|n| n.is_text())
        .filter_map(|n| n.text())
        .collect();
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// Text of the first `gco:CharacterString` or `gmx:Anchor` directly under `node`.
fn string_value(node: Node<'_, '_>) -> Option<String> {
    child(node, GCO, "CharacterString")
        .or_else(|| child(node, GMX, "Anchor"))
        .and_then(text_of)
}

fn decimal(scope: Node<'_, '_>, name: &str) -> Option<f64> {
    descendant(scope, GMD, name)
        .and_then(|n| child(n, GCO, "Decimal"))
        .and_then(text_of)
        .and_then(|v| v.parse().ok())
}

fn gml_position(scope: Node<'_, '_>, name: &str) -> Option<String> {
    // gml namespace varies between 3.1 and 3.2 documents.
    scope
        .descendants()
        .find(|n| n.is_element() && n.tag_name().name() == name)
        .and_then(text_of)
}

/// Encoding named by the `<?xml ... encoding="..."?>` declaration, if any.
fn declared_encoding(body: &[u8]) -> Option<&'static Encoding> {
    let head = &body[..body.len().min(256)];
    let head = head.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(head);
    if !head.starts_with(b"<?xml") {
        return None;
    }
    let end = head.windows(2).position(|w| w == b"?>")?;
    let decl = std::str::from_utf8(&head[..end]).ok()?;
    let rest = &decl[decl.find("encoding")? + "encoding".len()..];
    let rest = rest.trim_start().strip_prefix('=')?.trim_start();
    let quote = rest.chars().next().filter(|c| matches!(*c, '"' | '\''))?;
    let label = rest[1..].split(quote).next()?;
    Encoding::for_label(label.trim().as_bytes())
}

/// Decode `body` to text. A byte order mark wins over the declaration;
/// UTF-8 is assumed when neither is present.
fn decode_document(body: &[u8]) -> Result<Cow<'_, str>, ExtractError> {
    let declared = declared_encoding(body).unwrap_or(UTF_8);
    let (text, used, had_errors) = declared.decode(body);
    if had_errors {
        return Err(ExtractError::Encoding(used.name()));
    }
    Ok(text)
}

/// Parse a metadata document into the extraction-owned fields.
pub fn extract_iso_metadata(body: &[u8]) -> Result<ExtractedFields, ExtractError> {
    let text = decode_document(body)?;
    let doc = Document::parse(&text)?;
    let root = doc.root_element();
    let root_name = root.tag_name().name();
    if !matches!(root_name, "MD_Metadata" | "MI_Metadata") {
        return Err(ExtractError::NotIsoMetadata(root_name.to_string()));
    }

    let mut fields = ExtractedFields {
        uuid: root
            .attribute("uuid")
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string),
        file_identifier: child(root, GMD, "fileIdentifier").and_then(string_value),
        date_stamp: child(root, GMD, "dateStamp").and_then(|n| {
            child(n, GCO, "DateTime")
                .or_else(|| child(n, GCO, "Date"))
                .and_then(text_of)
        }),
        ..Default::default()
    };

    fields.doi = root
        .descendants()
        .filter(|n| is_element(*n, GMD, "identifier"))
        .flat_map(|n| n.descendants())
        .find(|n| {
            is_element(*n, GMX, "Anchor")
                && n.attribute((XLINK, "href"))
                    .is_some_and(|href| href.contains("doi.org"))
        })
        .and_then(text_of);

    if let Some(ident) = descendant(root, GMD, "identificationInfo") {
        if let Some(citation) = descendant(ident, GMD, "citation") {
            fields.title = descendant(citation, GMD, "title").and_then(|t| {
                t.children().find(|n| n.is_element()).and_then(text_of)
            });
            fields.edition = descendant(citation, GMD, "edition").and_then(string_value);
        }
        fields.abstract_text = descendant(ident, GMD, "abstract").and_then(string_value);

        if let Some(bbox) = descendant(ident, GMD, "EX_GeographicBoundingBox") {
            fields.west_bound = decimal(bbox, "westBoundLongitude");
            fields.east_bound = decimal(bbox, "eastBoundLongitude");
            fields.south_bound = decimal(bbox, "southBoundLatitude");
            fields.north_bound = decimal(bbox, "northBoundLatitude");
        }
        if let Some(temporal) = descendant(ident, GMD, "EX_TemporalExtent") {
            fields.temporal_begin = gml_position(temporal, "beginPosition");
            fields.temporal_end = gml_position(temporal, "endPosition");
        }
    }

    Ok(fields)
}

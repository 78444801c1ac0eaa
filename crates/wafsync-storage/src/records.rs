//! Record Store: one Parquet artifact keyed by collection id, replaced atomically.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow_array::{Array, ArrayRef, BooleanArray, Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema, SchemaRef};
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use tokio::fs;
use tracing::info;
use wafsync_core::{ExtractedFields, MetadataRecord, OsimStatus};

use crate::{sha256_hex, write_atomically, StoreError};

/// In-memory view of the full record set, ordered by collection id.
pub type RecordSet = BTreeMap<String, MetadataRecord>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreWrite {
    pub rows: usize,
    pub bytes: u64,
    pub sha256: String,
}

#[derive(Debug, Clone)]
pub struct RecordStore {
    path: PathBuf,
}

impl RecordStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load every record; a missing artifact is an empty store.
    pub async fn load(&self) -> Result<RecordSet, StoreError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(RecordSet::new()),
            Err(err) => return Err(StoreError::io(&self.path, err)),
        };
        let mut set = RecordSet::new();
        for record in decode_records(Bytes::from(bytes))? {
            if set.insert(record.collection_id.clone(), record).is_some() {
                return Err(StoreError::integrity(format!(
                    "duplicate collection id in {}",
                    self.path.display()
                )));
            }
        }
        Ok(set)
    }

    /// Write the full record set to a new artifact and swap it in.
    pub async fn replace_all(&self, records: &RecordSet) -> Result<StoreWrite, StoreError> {
        let bytes = encode_records(records.values())?;
        write_atomically(&self.path, &bytes).await?;
        let write = StoreWrite {
            rows: records.len(),
            bytes: bytes.len() as u64,
            sha256: sha256_hex(&bytes),
        };
        info!(path = %self.path.display(), rows = write.rows, "record store replaced");
        Ok(write)
    }

    pub async fn digest(&self) -> Result<Option<String>, StoreError> {
        match fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(sha256_hex(&bytes))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StoreError::io(&self.path, err)),
        }
    }
}

fn records_schema() -> SchemaRef {
    let text = |name: &str, nullable: bool| ArrowField::new(name, DataType::Utf8, nullable);
    let float = |name: &str| ArrowField::new(name, DataType::Float64, true);
    Arc::new(Schema::new(vec![
        text("collection_id", false),
        text("source_url", false),
        text("uuid", true),
        text("file_identifier", true),
        text("title", true),
        text("edition", true),
        text("doi", true),
        text("date_stamp", true),
        text("abstract", true),
        float("west_bound"),
        float("east_bound"),
        float("south_bound"),
        float("north_bound"),
        text("temporal_begin", true),
        text("temporal_end", true),
        ArrowField::new("in_osim", DataType::Boolean, true),
        ArrowField::new("granule_count", DataType::Int64, true),
        ArrowField::new("orphaned", DataType::Boolean, false),
        text("last_updated", false),
    ]))
}

fn string_column<'a>(
    records: &[&'a MetadataRecord],
    get: impl Fn(&'a MetadataRecord) -> Option<&'a str>,
) -> ArrayRef {
    Arc::new(StringArray::from(records.iter().map(|r| get(*r)).collect::<Vec<_>>()))
}

fn float_column(records: &[&MetadataRecord], get: impl Fn(&ExtractedFields) -> Option<f64>) -> ArrayRef {
    Arc::new(Float64Array::from(
        records.iter().map(|r| get(&r.fields)).collect::<Vec<_>>(),
    ))
}

/// Encode records as a Parquet file image, rows in collection-id order.
pub fn encode_records<'a>(
    records: impl IntoIterator<Item = &'a MetadataRecord>,
) -> Result<Vec<u8>, StoreError> {
    let mut rows: Vec<&MetadataRecord> = records.into_iter().collect();
    rows.sort_by(|a, b| a.collection_id.cmp(&b.collection_id));

    let last_updated = rows
        .iter()
        .map(|r| Some(r.last_updated.to_rfc3339_opts(SecondsFormat::Micros, true)))
        .collect::<Vec<_>>();

    let columns: Vec<ArrayRef> = vec![
        string_column(&rows, |r| Some(r.collection_id.as_str())),
        string_column(&rows, |r| Some(r.source_url.as_str())),
        string_column(&rows, |r| r.fields.uuid.as_deref()),
        string_column(&rows, |r| r.fields.file_identifier.as_deref()),
        string_column(&rows, |r| r.fields.title.as_deref()),
        string_column(&rows, |r| r.fields.edition.as_deref()),
        string_column(&rows, |r| r.fields.doi.as_deref()),
        string_column(&rows, |r| r.fields.date_stamp.as_deref()),
        string_column(&rows, |r| r.fields.abstract_text.as_deref()),
        float_column(&rows, |f| f.west_bound),
        float_column(&rows, |f| f.east_bound),
        float_column(&rows, |f| f.south_bound),
        float_column(&rows, |f| f.north_bound),
        string_column(&rows, |r| r.fields.temporal_begin.as_deref()),
        string_column(&rows, |r| r.fields.temporal_end.as_deref()),
        Arc::new(BooleanArray::from(
            rows.iter().map(|r| r.in_osim.as_flag()).collect::<Vec<_>>(),
        )),
        Arc::new(Int64Array::from(
            rows.iter().map(|r| r.granule_count).collect::<Vec<_>>(),
        )),
        Arc::new(BooleanArray::from(
            rows.iter().map(|r| r.orphaned).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(last_updated)),
    ];

    let batch = RecordBatch::try_new(records_schema(), columns)?;
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), Some(props))?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(buffer)
}

struct Columns<'a> {
    batch: &'a RecordBatch,
}

impl<'a> Columns<'a> {
    fn typed<T: Array + 'static>(&self, name: &str) -> Result<&'a T, StoreError> {
        self.batch
            .column_by_name(name)
            .ok_or_else(|| StoreError::integrity(format!("record store missing column {name}")))?
            .as_any()
            .downcast_ref::<T>()
            .ok_or_else(|| StoreError::integrity(format!("record store column {name} has wrong type")))
    }

    fn text(&self, name: &str, row: usize) -> Result<Option<String>, StoreError> {
        let col = self.typed::<StringArray>(name)?;
        Ok((!col.is_null(row)).then(|| col.value(row).to_string()))
    }

    fn required_text(&self, name: &str, row: usize) -> Result<String, StoreError> {
        self.text(name, row)?
            .ok_or_else(|| StoreError::integrity(format!("null {name} at row {row}")))
    }

    fn float(&self, name: &str, row: usize) -> Result<Option<f64>, StoreError> {
        let col = self.typed::<Float64Array>(name)?;
        Ok((!col.is_null(row)).then(|| col.value(row)))
    }

    fn flag(&self, name: &str, row: usize) -> Result<Option<bool>, StoreError> {
        let col = self.typed::<BooleanArray>(name)?;
        Ok((!col.is_null(row)).then(|| col.value(row)))
    }

    fn int(&self, name: &str, row: usize) -> Result<Option<i64>, StoreError> {
        let col = self.typed::<Int64Array>(name)?;
        Ok((!col.is_null(row)).then(|| col.value(row)))
    }
}

pub fn decode_records(bytes: Bytes) -> Result<Vec<MetadataRecord>, StoreError> {
    let reader = ParquetRecordBatchReaderBuilder::try_new(bytes)?.build()?;
    let mut out = Vec::new();
    for batch in reader {
        let batch = batch?;
        let cols = Columns { batch: &batch };
        for row in 0..batch.num_rows() {
            let last_updated = cols.required_text("last_updated", row)?;
            let last_updated = DateTime::parse_from_rfc3339(&last_updated)
                .map_err(|e| StoreError::integrity(format!("bad last_updated {last_updated}: {e}")))?
                .with_timezone(&Utc);
            out.push(MetadataRecord {
                collection_id: cols.required_text("collection_id", row)?,
                source_url: cols.required_text("source_url", row)?,
                fields: ExtractedFields {
                    uuid: cols.text("uuid", row)?,
                    file_identifier: cols.text("file_identifier", row)?,
                    title: cols.text("title", row)?,
                    edition: cols.text("edition", row)?,
                    doi: cols.text("doi", row)?,
                    date_stamp: cols.text("date_stamp", row)?,
                    abstract_text: cols.text("abstract", row)?,
                    west_bound: cols.float("west_bound", row)?,
                    east_bound: cols.float("east_bound", row)?,
                    south_bound: cols.float("south_bound", row)?,
                    north_bound: cols.float("north_bound", row)?,
                    temporal_begin: cols.text("temporal_begin", row)?,
                    temporal_end: cols.text("temporal_end", row)?,
                },
                in_osim: OsimStatus::from_flag(cols.flag("in_osim", row)?),
                granule_count: cols.int("granule_count", row)?,
                orphaned: cols.flag("orphaned", row)?.unwrap_or(false),
                last_updated,
            });
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn record(id: &str, title: &str) -> MetadataRecord {
        MetadataRecord::from_extraction(
            id,
            format!("https://waf.test/{id}.xml"),
            ExtractedFields {
                uuid: Some(id.to_string()),
                title: Some(title.to_string()),
                west_bound: Some(-120.5),
                north_bound: Some(48.25),
                temporal_begin: Some("2001-01-01".into()),
                ..Default::default()
            },
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap(),
        )
    }

    #[tokio::test]
    async fn missing_artifact_loads_as_empty() {
        let dir = tempdir().expect("tempdir");
        let store = RecordStore::new(dir.path().join("records.parquet"));
        assert!(store.load().await.unwrap().is_empty());
        assert_eq!(store.digest().await.unwrap(), None);
    }

    #[tokio::test]
    async fn replace_all_persists_every_column() {
        let dir = tempdir().expect("tempdir");
        let store = RecordStore::new(dir.path().join("records.parquet"));

        let mut enriched = record("b-uuid", "Buoy data");
        enriched.apply_enrichment(OsimStatus::Present, Some(1234));
        let mut absent = record("a-uuid", "Archive");
        absent.apply_enrichment(OsimStatus::Absent, None);
        absent.orphaned = true;

        let mut set = RecordSet::new();
        set.insert(enriched.collection_id.clone(), enriched.clone());
        set.insert(absent.collection_id.clone(), absent.clone());
        set.insert("c-uuid".into(), record("c-uuid", "Unenriched"));

        let write = store.replace_all(&set).await.unwrap();
        assert_eq!(write.rows, 3);
        assert_eq!(store.digest().await.unwrap(), Some(write.sha256.clone()));

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, set);
        assert_eq!(loaded["c-uuid"].in_osim, OsimStatus::Unknown);
    }

    #[test]
    fn encoding_is_deterministic_regardless_of_input_order() {
        let a = record("a", "A");
        let b = record("b", "B");
        let first = encode_records([&a, &b]).unwrap();
        let second = encode_records([&b, &a]).unwrap();
        assert_eq!(first, second);
    }
}

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, bail};
use log::info;
use serde_json::Value as JsonValue;

use crate::config::RawValue;
use crate::error::{Error, Result};

use super::basin::BasinDefinition;
use super::model::{FeatureColumn, FeatureKind, FeatureValue};
use super::parquet_store::ParquetStore;
use super::provider::{FeatureProvider, MemoryStore};

/// Metadata keys that belong to the container, not to the configuration.
pub const RESERVED_KEYS: &[&str] = &["ARROW:schema", "pandas", BASINS_KEY];
/// Metadata key holding the JSON list of basin definitions.
pub const BASINS_KEY: &str = "basins";

/// An opened backing store plus what it says about itself.
pub struct OpenedStore {
    pub provider: Box<dyn FeatureProvider>,
    /// Flat `"section:parameter"` entries.
    pub metadata: Vec<(String, RawValue)>,
    pub basins: Vec<BasinDefinition>,
}

// ---------------------------------------------------------------------------
// Public entry-point
// ---------------------------------------------------------------------------

/// Open a measurement store.  Dispatch by extension.
///
/// Supported formats:
/// * `.parquet` – columns are features (list columns are array features),
///   key/value metadata holds configuration and basins (recommended)
/// * `.json`    – `[{ "area_um": 1.0, "image": [...] }, ...]` or
///   `{ "config": {...}, "basins": [...], "events": [...] }`
/// * `.csv` / `.tsv` – header row of feature names, array cells are
///   semicolon-separated floats
pub fn open_store(path: &Path) -> Result<OpenedStore> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let opened = match ext.as_str() {
        "parquet" | "pq" => ParquetStore::open(path)?.into_opened()?,
        "json" => load_json(path)?,
        "csv" => load_tabular(path, b',')?,
        "tsv" => load_tabular(path, b'\t')?,
        other => return Err(Error::UnsupportedFormat(other.to_string())),
    };
    info!(
        "Opened {} ({} features, {} basins)",
        path.display(),
        opened.provider.features().len(),
        opened.basins.len()
    );
    Ok(opened)
}

/// Parse the JSON list stored under [`BASINS_KEY`].
pub fn parse_basins(text: &str) -> anyhow::Result<Vec<BasinDefinition>> {
    serde_json::from_str(text).context("parsing basin definitions")
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

// ---------------------------------------------------------------------------
// Column assembly shared by the record-oriented loaders
// ---------------------------------------------------------------------------

/// Collects per-event values into columns, enforcing one kind per feature.
#[derive(Default)]
struct ColumnSet {
    columns: BTreeMap<String, FeatureColumn>,
}

impl ColumnSet {
    fn push(&mut self, row: usize, feature: &str, value: FeatureValue) -> anyhow::Result<()> {
        let column = self
            .columns
            .entry(feature.to_string())
            .or_insert_with(|| FeatureColumn::empty(value.kind()));
        if column.len() != row {
            bail!("Row {row}: feature '{feature}' is missing in an earlier row");
        }
        let expected = column.kind();
        column.push(value).map_err(|v| {
            anyhow::anyhow!(
                "Row {row}: feature '{feature}' is {expected} but got a {} value",
                v.kind()
            )
        })
    }

    fn finish(self, rows: usize) -> anyhow::Result<BTreeMap<String, FeatureColumn>> {
        for (feature, column) in &self.columns {
            if column.len() != rows {
                bail!("Feature '{feature}' has {} of {rows} rows", column.len());
            }
        }
        Ok(self.columns)
    }
}

// ---------------------------------------------------------------------------
// JSON loader
// ---------------------------------------------------------------------------

/// Expected JSON schema (records-oriented):
///
/// ```json
/// {
///   "config": { "experiment:sample": "blood", "imaging:pixel size": 0.34 },
///   "basins": [ { "type": "file", "format": "parquet", "paths": ["raw.parquet"] } ],
///   "events": [ { "area_um": 41.5, "deform": 0.02, "trace": [0.1, 0.2] }, ... ]
/// }
/// ```
///
/// A bare top-level array is accepted as `events` without metadata.
fn load_json(path: &Path) -> Result<OpenedStore> {
    let text = std::fs::read_to_string(path).context("reading JSON file")?;
    let root: JsonValue = serde_json::from_str(&text).context("parsing JSON")?;

    let (records, config, basins) = match &root {
        JsonValue::Array(records) => (records.as_slice(), None, Vec::new()),
        JsonValue::Object(obj) => {
            let records = obj
                .get("events")
                .and_then(|v| v.as_array())
                .context("Expected an 'events' array")?;
            let basins = match obj.get("basins") {
                Some(b) => serde_json::from_value(b.clone()).context("parsing basins")?,
                None => Vec::new(),
            };
            (records.as_slice(), obj.get("config"), basins)
        }
        _ => return Err(anyhow::anyhow!("Expected top-level JSON array or object").into()),
    };

    let mut columns = ColumnSet::default();
    for (i, rec) in records.iter().enumerate() {
        let obj = rec
            .as_object()
            .with_context(|| format!("Row {i} is not a JSON object"))?;
        for (key, val) in obj {
            columns.push(i, key, json_to_feature(val, i, key)?)?;
        }
    }
    let columns = columns.finish(records.len())?;

    let mut metadata = Vec::new();
    if let Some(config) = config {
        let obj = config.as_object().context("'config' is not a JSON object")?;
        for (key, val) in obj {
            metadata.push((key.clone(), json_to_raw(val)));
        }
    }

    Ok(OpenedStore {
        provider: Box::new(MemoryStore::new(display_name(path), columns)?),
        metadata,
        basins,
    })
}

fn json_to_feature(val: &JsonValue, row: usize, col: &str) -> anyhow::Result<FeatureValue> {
    match val {
        JsonValue::Number(n) => n
            .as_f64()
            .map(FeatureValue::Scalar)
            .with_context(|| format!("Row {row}, {col}: not a number")),
        JsonValue::Bool(b) => Ok(FeatureValue::Scalar(if *b { 1.0 } else { 0.0 })),
        JsonValue::Null => Ok(FeatureValue::Scalar(f64::NAN)),
        JsonValue::Array(arr) => arr
            .iter()
            .enumerate()
            .map(|(j, v)| {
                v.as_f64()
                    .with_context(|| format!("Row {row}, {col}[{j}]: not a number"))
            })
            .collect::<anyhow::Result<Vec<f64>>>()
            .map(FeatureValue::Array),
        other => bail!("Row {row}, {col}: unsupported value {other}"),
    }
}

fn json_to_raw(val: &JsonValue) -> RawValue {
    match val {
        JsonValue::String(s) => RawValue::Text(s.clone()),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                RawValue::Int(i)
            } else if let Some(f) = n.as_f64() {
                RawValue::Float(f)
            } else {
                RawValue::Text(n.to_string())
            }
        }
        JsonValue::Bool(b) => RawValue::Bool(*b),
        JsonValue::Array(items) => {
            let ints: Option<Vec<i64>> = items.iter().map(JsonValue::as_i64).collect();
            match ints {
                Some(ints) => RawValue::List(ints),
                None => RawValue::Text(val.to_string()),
            }
        }
        other => RawValue::Text(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// CSV / TSV loader
// ---------------------------------------------------------------------------

/// Tabular layout:  header row with feature names, one event per row.
/// Array cells contain semicolon-separated floats:
///   `"0.12;0.14;0.11"`
/// Lines starting with `#` are comments. Empty scalar cells read as NaN.
fn load_tabular(path: &Path, delimiter: u8) -> Result<OpenedStore> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .comment(Some(b'#'))
        .from_path(path)
        .context("opening tabular file")?;
    let headers: Vec<String> = reader
        .headers()
        .context("reading headers")?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let mut kinds: Vec<Option<FeatureKind>> = vec![None; headers.len()];
    let mut columns = ColumnSet::default();
    let mut rows = 0;

    for (row_no, result) in reader.records().enumerate() {
        let record = result.with_context(|| format!("row {row_no}"))?;
        for (col_idx, name) in headers.iter().enumerate() {
            let cell = record.get(col_idx).unwrap_or("").trim();
            let kind = *kinds[col_idx].get_or_insert_with(|| guess_kind(cell));
            let value = match kind {
                FeatureKind::Scalar if cell.is_empty() => FeatureValue::Scalar(f64::NAN),
                FeatureKind::Scalar => FeatureValue::Scalar(
                    cell.parse::<f64>()
                        .with_context(|| format!("Row {row_no}, {name}: '{cell}' is not a number"))?,
                ),
                FeatureKind::Array => {
                    FeatureValue::Array(parse_semicolon_floats(cell, row_no, name)?)
                }
            };
            columns.push(row_no, name, value)?;
        }
        rows += 1;
    }

    let columns = columns.finish(rows)?;
    Ok(OpenedStore {
        provider: Box::new(MemoryStore::new(display_name(path), columns)?),
        metadata: Vec::new(),
        basins: Vec::new(),
    })
}

fn guess_kind(cell: &str) -> FeatureKind {
    if cell.contains(';') {
        FeatureKind::Array
    } else {
        FeatureKind::Scalar
    }
}

fn parse_semicolon_floats(s: &str, row: usize, col: &str) -> anyhow::Result<Vec<f64>> {
    if s.is_empty() {
        return Ok(Vec::new());
    }
    s.split(';')
        .filter(|tok| !tok.trim().is_empty())
        .enumerate()
        .map(|(j, tok)| {
            tok.trim()
                .parse::<f64>()
                .with_context(|| format!("Row {row}, {col}[{j}]: '{tok}' is not a number"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_object_with_config_and_basins() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("m1.json");
        std::fs::write(
            &path,
            r#"{
                "config": {"experiment:sample": "blood", "experiment:event count": 2},
                "basins": [{"type": "file", "format": "parquet", "paths": ["raw.parquet"]}],
                "events": [
                    {"area_um": 10.0, "trace": [1, 2, 3]},
                    {"area_um": 12.5, "trace": [4, 5, 6]}
                ]
            }"#,
        )
        .unwrap();

        let opened = open_store(&path).unwrap();
        assert_eq!(opened.provider.length().unwrap(), 2);
        assert_eq!(opened.provider.kind("trace"), Some(FeatureKind::Array));
        assert_eq!(
            opened.provider.get("area_um", 1).unwrap(),
            FeatureValue::Scalar(12.5)
        );
        assert_eq!(opened.metadata.len(), 2);
        assert_eq!(opened.basins.len(), 1);
    }

    #[test]
    fn json_rows_must_agree() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"[{"a": 1.0, "b": 2.0}, {"a": 1.0}]"#).unwrap();
        assert!(matches!(open_store(&path), Err(Error::Store(_))));
    }

    #[test]
    fn tsv_with_comments_and_arrays() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("m1.tsv");
        std::fs::write(&path, "# comment\narea_um\tcontour\n1.5\t1;2;3\n\t4;5\n").unwrap();

        let opened = open_store(&path).unwrap();
        let provider = opened.provider;
        assert_eq!(provider.length().unwrap(), 2);
        assert_eq!(provider.kind("contour"), Some(FeatureKind::Array));
        assert!(provider.get("area_um", 1).unwrap().as_f64().unwrap().is_nan());
        assert_eq!(
            provider.get("contour", 1).unwrap(),
            FeatureValue::Array(vec![4.0, 5.0])
        );
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let err = open_store(Path::new("movie.avi")).err().unwrap();
        assert!(matches!(err, Error::UnsupportedFormat(ext) if ext == "avi"));
    }
}

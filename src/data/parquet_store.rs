use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use arrow::array::{Array, ArrayRef, Float32Array, Float64Array, LargeListArray, ListArray};
use arrow::compute;
use arrow::datatypes::{DataType, SchemaRef};
use bytes::Bytes;
use log::debug;
use parquet::arrow::ProjectionMask;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::file::reader::ChunkReader;

use crate::config::RawValue;
use crate::error::{Error, Result};
use crate::hash::IdentitySource;

use super::basin::BasinDefinition;
use super::loader::{BASINS_KEY, OpenedStore, RESERVED_KEYS, parse_basins};
use super::model::{FeatureKind, FeatureValue};
use super::provider::{FeatureProvider, out_of_range};

// ---------------------------------------------------------------------------
// Source – where the Parquet bytes live
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Source {
    File(PathBuf),
    /// Fully fetched payload (remote basins).
    Memory(Bytes),
}

/// What a file says about itself, read once at open time.
struct Inspection {
    schema: SchemaRef,
    num_rows: usize,
    key_values: Vec<(String, String)>,
}

fn inspect<T: ChunkReader + 'static>(reader: T) -> anyhow::Result<Inspection> {
    let builder =
        ParquetRecordBatchReaderBuilder::try_new(reader).context("reading parquet metadata")?;
    let file_metadata = builder.metadata().file_metadata();
    let num_rows = usize::try_from(file_metadata.num_rows()).context("negative row count")?;
    let key_values = file_metadata
        .key_value_metadata()
        .map(|kvs| {
            kvs.iter()
                .filter_map(|kv| kv.value.as_ref().map(|v| (kv.key.clone(), v.clone())))
                .collect()
        })
        .unwrap_or_default();
    Ok(Inspection {
        schema: builder.schema().clone(),
        num_rows,
        key_values,
    })
}

/// Read one top-level column into a single Arrow array.
fn read_column<T: ChunkReader + 'static>(reader: T, root: usize) -> anyhow::Result<ArrayRef> {
    let builder =
        ParquetRecordBatchReaderBuilder::try_new(reader).context("reading parquet metadata")?;
    let mask = ProjectionMask::roots(builder.parquet_schema(), [root]);
    let batches = builder
        .with_projection(mask)
        .build()
        .context("building parquet reader")?
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("reading parquet record batch")?;

    let parts: Vec<&dyn Array> = batches.iter().map(|b| b.column(0).as_ref()).collect();
    match parts.len() {
        0 => bail!("column {root} has no record batches"),
        1 => Ok(batches[0].column(0).clone()),
        _ => compute::concat(&parts).context("concatenating record batches"),
    }
}

fn kind_of(data_type: &DataType) -> Option<FeatureKind> {
    match data_type {
        DataType::List(_) | DataType::LargeList(_) => Some(FeatureKind::Array),
        dt if dt.is_numeric() || *dt == DataType::Boolean => Some(FeatureKind::Scalar),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// ParquetStore
// ---------------------------------------------------------------------------

/// A Parquet file (or fetched Parquet payload) serving its columns as
/// features. Columns are read on first use and kept as Arrow arrays until
/// the store is closed.
pub struct ParquetStore {
    location: String,
    source: Source,
    features: BTreeMap<String, (usize, FeatureKind)>,
    num_rows: usize,
    key_values: Vec<(String, String)>,
    columns: RefCell<HashMap<String, ArrayRef>>,
}

impl ParquetStore {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let inspection = inspect(file).with_context(|| format!("opening {}", path.display()))?;
        Ok(Self::from_inspection(
            path.display().to_string(),
            Source::File(path.to_path_buf()),
            inspection,
        ))
    }

    /// Serve a Parquet payload that was fetched into memory.
    pub fn from_bytes(location: impl Into<String>, payload: Vec<u8>) -> Result<Self> {
        let location = location.into();
        let payload = Bytes::from(payload);
        let inspection =
            inspect(payload.clone()).with_context(|| format!("opening {location}"))?;
        Ok(Self::from_inspection(location, Source::Memory(payload), inspection))
    }

    fn from_inspection(location: String, source: Source, inspection: Inspection) -> Self {
        let mut features = BTreeMap::new();
        for (root, field) in inspection.schema.fields().iter().enumerate() {
            match kind_of(field.data_type()) {
                Some(kind) => {
                    features.insert(field.name().clone(), (root, kind));
                }
                None => debug!(
                    "{location}: ignoring non-numeric column '{}' ({:?})",
                    field.name(),
                    field.data_type()
                ),
            }
        }
        ParquetStore {
            location,
            source,
            features,
            num_rows: inspection.num_rows,
            key_values: inspection.key_values,
            columns: RefCell::new(HashMap::new()),
        }
    }

    /// Configuration entries (reserved container keys removed).
    pub fn metadata(&self) -> Vec<(String, RawValue)> {
        self.key_values
            .iter()
            .filter(|(k, _)| !RESERVED_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), RawValue::Text(v.clone())))
            .collect()
    }

    pub fn basins(&self) -> anyhow::Result<Vec<BasinDefinition>> {
        match self.key_values.iter().find(|(k, _)| k == BASINS_KEY) {
            Some((_, text)) => parse_basins(text),
            None => Ok(Vec::new()),
        }
    }

    /// Number of columns currently held in memory.
    pub fn cached_columns(&self) -> usize {
        self.columns.borrow().len()
    }

    pub fn into_opened(self) -> Result<OpenedStore> {
        let metadata = self.metadata();
        let basins = self.basins()?;
        Ok(OpenedStore {
            provider: Box::new(self),
            metadata,
            basins,
        })
    }

    fn column(&self, name: &str) -> Result<ArrayRef> {
        if let Some(array) = self.columns.borrow().get(name) {
            return Ok(array.clone());
        }
        let (root, _) = *self
            .features
            .get(name)
            .ok_or_else(|| Error::FeatureNotFound(name.to_string()))?;
        debug!("{}: loading column '{name}'", self.location);
        let array = match &self.source {
            Source::File(path) => read_column(File::open(path)?, root),
            Source::Memory(payload) => read_column(payload.clone(), root),
        }
        .with_context(|| format!("{}: reading feature '{name}'", self.location))?;
        if array.len() != self.num_rows {
            return Err(Error::DataIntegrity(format!(
                "{}: feature '{name}' has {} rows, file declares {}",
                self.location,
                array.len(),
                self.num_rows
            )));
        }
        self.columns
            .borrow_mut()
            .insert(name.to_string(), array.clone());
        Ok(array)
    }
}

/// Extract a `Vec<f64>` from a List or LargeList column at the given row.
fn extract_f64_list(col: &ArrayRef, row: usize) -> anyhow::Result<Vec<f64>> {
    if col.is_null(row) {
        return Ok(Vec::new());
    }

    let values_array = match col.data_type() {
        DataType::List(_) => {
            let list_arr = col
                .as_any()
                .downcast_ref::<ListArray>()
                .context("expected ListArray")?;
            list_arr.value(row)
        }
        DataType::LargeList(_) => {
            let list_arr = col
                .as_any()
                .downcast_ref::<LargeListArray>()
                .context("expected LargeListArray")?;
            list_arr.value(row)
        }
        other => bail!("Expected List or LargeList column, got {other:?}"),
    };

    // The inner array can be Float64 or Float32; anything else is cast.
    if let Some(f64_arr) = values_array.as_any().downcast_ref::<Float64Array>() {
        Ok(f64_arr.iter().map(|v| v.unwrap_or(f64::NAN)).collect())
    } else if let Some(f32_arr) = values_array.as_any().downcast_ref::<Float32Array>() {
        Ok(f32_arr.iter().map(|v| v.unwrap_or(f32::NAN) as f64).collect())
    } else {
        let cast = compute::cast(&values_array, &DataType::Float64)
            .with_context(|| format!("casting {:?} to Float64", values_array.data_type()))?;
        Ok(float_values(&cast))
    }
}

/// Cast a numeric column to `f64`, nulls become NaN.
fn scalar_values(col: &ArrayRef) -> anyhow::Result<Vec<f64>> {
    let cast = match col.data_type() {
        DataType::Float64 => col.clone(),
        other => compute::cast(col, &DataType::Float64)
            .with_context(|| format!("casting {other:?} to Float64"))?,
    };
    Ok(float_values(&cast))
}

fn float_values(array: &ArrayRef) -> Vec<f64> {
    array
        .as_any()
        .downcast_ref::<Float64Array>()
        .map(|arr| arr.iter().map(|v| v.unwrap_or(f64::NAN)).collect())
        .unwrap_or_default()
}

impl FeatureProvider for ParquetStore {
    fn location(&self) -> &str {
        &self.location
    }

    fn features(&self) -> Vec<(String, FeatureKind)> {
        self.features
            .iter()
            .map(|(name, (_, kind))| (name.clone(), *kind))
            .collect()
    }

    fn kind(&self, name: &str) -> Option<FeatureKind> {
        self.features.get(name).map(|(_, kind)| *kind)
    }

    fn length(&self) -> Result<usize> {
        Ok(self.num_rows)
    }

    fn get(&self, name: &str, index: usize) -> Result<FeatureValue> {
        if index >= self.num_rows {
            return Err(out_of_range(name, index, self.num_rows));
        }
        let column = self.column(name)?;
        match self.kind(name) {
            Some(FeatureKind::Array) => Ok(FeatureValue::Array(
                extract_f64_list(&column, index)
                    .with_context(|| format!("{name}[{index}]"))?,
            )),
            _ => {
                let single = column.slice(index, 1);
                let value = scalar_values(&single)?.first().copied().unwrap_or(f64::NAN);
                Ok(FeatureValue::Scalar(value))
            }
        }
    }

    fn scalars(&self, name: &str) -> Result<Vec<f64>> {
        if self.kind(name) == Some(FeatureKind::Array) {
            return Err(Error::DataIntegrity(format!(
                "feature '{name}' is an array feature, not a scalar one"
            )));
        }
        let column = self.column(name)?;
        Ok(scalar_values(&column).with_context(|| format!("reading feature '{name}'"))?)
    }

    fn identity(&self) -> Result<IdentitySource> {
        match &self.source {
            Source::File(path) => Ok(IdentitySource::File(path.clone())),
            Source::Memory(payload) => Ok(IdentitySource::Content {
                name: self.location.clone(),
                content: payload.slice(..payload.len().min(crate::hash::SAMPLE_BYTES)).to_vec(),
            }),
        }
    }

    fn close(&self) {
        self.columns.borrow_mut().clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::{Float64Builder, Int32Array, ListBuilder, StringArray};
    use arrow::datatypes::{Field, Schema};
    use arrow::record_batch::RecordBatch;
    use parquet::arrow::ArrowWriter;
    use parquet::file::metadata::KeyValue;
    use parquet::file::properties::WriterProperties;

    use super::*;

    fn payload() -> Vec<u8> {
        let mut trace = ListBuilder::new(Float64Builder::new());
        for i in 0..3 {
            trace.values().append_slice(&[i as f64, i as f64 + 0.5]);
            trace.append(true);
        }
        let schema = Arc::new(Schema::new(vec![
            Field::new("frame", DataType::Int32, false),
            Field::new(
                "trace",
                DataType::List(Arc::new(Field::new("item", DataType::Float64, true))),
                false,
            ),
            Field::new("label", DataType::Utf8, false),
        ]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Int32Array::from(vec![7, 8, 9])),
                Arc::new(trace.finish()),
                Arc::new(StringArray::from(vec!["a", "b", "c"])),
            ],
        )
        .unwrap();
        let props = WriterProperties::builder()
            .set_key_value_metadata(Some(vec![
                KeyValue::new("experiment:sample".to_string(), "beads".to_string()),
                KeyValue::new(
                    BASINS_KEY.to_string(),
                    r#"[{"type": "file", "format": "parquet", "paths": ["raw.parquet"]}]"#.to_string(),
                ),
            ]))
            .build();

        let mut out = Vec::new();
        let mut writer = ArrowWriter::try_new(&mut out, schema, Some(props)).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();
        out
    }

    #[test]
    fn numeric_and_list_columns_become_features() {
        let store = ParquetStore::from_bytes("mem://test", payload()).unwrap();
        assert_eq!(store.length().unwrap(), 3);
        assert_eq!(store.kind("frame"), Some(FeatureKind::Scalar));
        assert_eq!(store.kind("trace"), Some(FeatureKind::Array));
        assert!(!store.has("label"));

        assert_eq!(store.scalars("frame").unwrap(), vec![7.0, 8.0, 9.0]);
        assert_eq!(store.get("frame", 1).unwrap(), FeatureValue::Scalar(8.0));
        assert_eq!(store.get("trace", 2).unwrap(), FeatureValue::Array(vec![2.0, 2.5]));
        assert!(matches!(store.get("trace", 3), Err(Error::IndexOutOfRange { .. })));
    }

    #[test]
    fn close_drops_cached_columns() {
        let store = ParquetStore::from_bytes("mem://test", payload()).unwrap();
        store.scalars("frame").unwrap();
        store.get("trace", 0).unwrap();
        assert_eq!(store.cached_columns(), 2);

        store.close();
        assert_eq!(store.cached_columns(), 0);
        assert_eq!(store.get("frame", 2).unwrap(), FeatureValue::Scalar(9.0));
        assert_eq!(store.cached_columns(), 1);
    }

    #[test]
    fn container_keys_are_not_configuration() {
        let store = ParquetStore::from_bytes("mem://test", payload()).unwrap();
        let keys: Vec<String> = store.metadata().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["experiment:sample".to_string()]);
        let basins = store.basins().unwrap();
        assert_eq!(basins.len(), 1);
        assert_eq!(basins[0].paths, vec!["raw.parquet".to_string()]);
    }
}

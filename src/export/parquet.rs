use std::fs::File;
use std::io::BufWriter;
use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Array, Float64Builder, ListBuilder};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use log::debug;
use parquet::arrow::ArrowWriter;
use parquet::file::metadata::KeyValue;
use parquet::file::properties::WriterProperties;

use crate::data::loader::BASINS_KEY;
use crate::data::model::{FeatureKind, FeatureValue};
use crate::dataset::Dataset;
use crate::error::{Error, Result};

use super::{ExportOptions, Selection};

/// Events per record batch.
const CHUNK_SIZE: usize = 1000;

fn schema(selection: &Selection) -> SchemaRef {
    let fields: Vec<Field> = selection
        .features
        .iter()
        .map(|(name, kind)| match kind {
            FeatureKind::Scalar => Field::new(name, DataType::Float64, true),
            FeatureKind::Array => Field::new(
                name,
                DataType::List(Arc::new(Field::new("item", DataType::Float64, true))),
                true,
            ),
        })
        .collect();
    Arc::new(Schema::new(fields))
}

/// Configuration (with the written event count) plus declared basins.
fn key_values(dataset: &Dataset, events: usize, options: &ExportOptions) -> Result<Vec<KeyValue>> {
    let mut config = dataset.config().clone();
    config.set("experiment", "event count", events as i64)?;

    let mut kvs: Vec<KeyValue> = config
        .to_flat()
        .into_iter()
        .map(|(key, value)| KeyValue::new(key, value))
        .collect();
    if !options.basins.is_empty() {
        let basins = serde_json::to_string(&options.basins)?;
        kvs.push(KeyValue::new(BASINS_KEY.to_string(), basins));
    }
    Ok(kvs)
}

fn array_column(dataset: &Dataset, name: &str, indices: &[usize]) -> Result<ArrayRef> {
    let mut builder = ListBuilder::new(Float64Builder::new());
    for &i in indices {
        match dataset.get(name, i)? {
            FeatureValue::Array(values) => {
                builder.values().append_slice(&values);
                builder.append(true);
            }
            FeatureValue::Scalar(_) => {
                return Err(Error::DataIntegrity(format!(
                    "feature '{name}' returned a scalar for event {i}"
                )));
            }
        }
    }
    Ok(Arc::new(builder.finish()))
}

pub(super) fn write(
    dataset: &Dataset,
    selection: &Selection,
    options: &ExportOptions,
    out: BufWriter<File>,
) -> Result<()> {
    let schema = schema(selection);
    let props = WriterProperties::builder()
        .set_key_value_metadata(Some(key_values(dataset, selection.indices.len(), options)?))
        .build();
    let mut writer = ArrowWriter::try_new(out, schema.clone(), Some(props))?;

    let scalars = selection
        .features
        .iter()
        .map(|(name, kind)| match kind {
            FeatureKind::Scalar => dataset.scalars(name).map(Some),
            FeatureKind::Array => Ok(None),
        })
        .collect::<Result<Vec<_>>>()?;

    for chunk in selection.indices.chunks(CHUNK_SIZE) {
        let mut columns: Vec<ArrayRef> = Vec::with_capacity(selection.features.len());
        for ((name, _), values) in selection.features.iter().zip(&scalars) {
            let column: ArrayRef = match values {
                Some(values) => Arc::new(Float64Array::from_iter_values(
                    chunk.iter().map(|&i| values[i]),
                )),
                None => array_column(dataset, name, chunk)?,
            };
            columns.push(column);
        }
        let batch = RecordBatch::try_new(schema.clone(), columns)?;
        writer.write(&batch)?;
        debug!("Wrote chunk of {} events", chunk.len());
    }
    writer.close()?;
    Ok(())
}

use std::fs::File;
use std::io::BufWriter;

use crate::dataset::Dataset;
use crate::error::Result;

use super::{ExportOptions, Selection};

/// Header row of feature names, then one row per event.
pub(super) fn write(
    dataset: &Dataset,
    selection: &Selection,
    _options: &ExportOptions,
    out: BufWriter<File>,
) -> Result<()> {
    let columns = selection
        .features
        .iter()
        .map(|(name, _)| dataset.scalars(name))
        .collect::<Result<Vec<_>>>()?;

    let mut writer = csv::WriterBuilder::new().delimiter(b'\t').from_writer(out);
    writer.write_record(selection.features.iter().map(|(name, _)| name.as_str()))?;
    for &i in &selection.indices {
        writer.write_record(columns.iter().map(|c| c[i].to_string()))?;
    }
    writer.flush()?;
    Ok(())
}

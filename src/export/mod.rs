//! Export of (filtered) datasets to files.
//!
//! Every writer follows the same contract:
//!
//! * the caller names the features; an unresolvable feature is an error,
//!   never silently dropped
//! * `filtered` (default) writes only events included by the filter,
//!   in their original order
//! * the format's extension is appended to the path unless already present
//! * an existing file is only replaced with `overwrite`
//! * nothing is written when there are no events, or when a requested
//!   array feature has no data behind it
//!
//! # Supported Formats
//!
//! - TSV (`.tsv`) - scalar features as tab-separated text
//! - FCS (`.fcs`) - flow cytometry standard 3.0, scalar features
//! - Parquet (`.parquet`) - all features plus configuration; can be
//!   reopened with `Dataset::open`

mod fcs;
mod parquet;
mod tsv;

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use log::info;

use crate::data::basin::BasinDefinition;
use crate::data::model::FeatureKind;
use crate::dataset::Dataset;
use crate::error::{Error, Result};

/// Options shared by all exporters.
#[derive(Debug, Clone)]
pub struct ExportOptions {
    /// Only export events included by the filter.
    pub filtered: bool,
    /// Replace an existing file at the target path.
    pub overwrite: bool,
    /// Basins to declare in the written file (container formats only).
    pub basins: Vec<BasinDefinition>,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            filtered: true,
            overwrite: false,
            basins: Vec::new(),
        }
    }
}

impl ExportOptions {
    pub fn unfiltered(mut self) -> Self {
        self.filtered = false;
        self
    }

    pub fn overwrite(mut self) -> Self {
        self.overwrite = true;
        self
    }
}

// ---------------------------------------------------------------------------
// Shared contract
// ---------------------------------------------------------------------------

/// Append `.ext` unless the path already ends with it (any case).
pub fn with_extension(path: &Path, ext: &str) -> PathBuf {
    let has_ext = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(ext));
    if has_ext {
        return path.to_path_buf();
    }
    let mut raw: OsString = path.as_os_str().to_owned();
    raw.push(".");
    raw.push(ext);
    PathBuf::from(raw)
}

/// Resolve the final output path and refuse to clobber existing files.
pub fn target_path(path: &Path, ext: &str, overwrite: bool) -> Result<PathBuf> {
    let target = with_extension(path, ext);
    if target.exists() && !overwrite {
        return Err(Error::ExportConflict(target));
    }
    Ok(target)
}

/// The validated features and event indices an exporter writes.
pub(crate) struct Selection {
    pub features: Vec<(String, FeatureKind)>,
    pub indices: Vec<usize>,
}

/// Resolve features and pick events. `scalar_only` names the format when
/// it cannot hold array features.
pub(crate) fn select(
    dataset: &Dataset,
    features: &[&str],
    filtered: bool,
    scalar_only: Option<&'static str>,
) -> Result<Selection> {
    if features.is_empty() {
        return Err(Error::ExportEmpty("no features requested".to_string()));
    }
    let mut resolved = Vec::with_capacity(features.len());
    for &name in features {
        let kind = dataset.kind(name)?;
        match (kind, scalar_only) {
            (FeatureKind::Array, Some(format)) => {
                return Err(Error::ExportUnsupported {
                    format,
                    feature: name.to_string(),
                });
            }
            (FeatureKind::Array, None) => {
                if dataset.accessor().backed_len(name)? == 0 {
                    return Err(Error::ExportEmpty(format!(
                        "feature '{name}' has no data in {}",
                        dataset.name()
                    )));
                }
            }
            (FeatureKind::Scalar, _) => {}
        }
        resolved.push((name.to_string(), kind));
    }

    let indices = if filtered {
        dataset.filter().filtered_indices()
    } else {
        (0..dataset.len()).collect()
    };
    if indices.is_empty() {
        return Err(Error::ExportEmpty(format!(
            "{} has no {}events",
            dataset.name(),
            if filtered { "filtered " } else { "" }
        )));
    }
    Ok(Selection {
        features: resolved,
        indices,
    })
}

/// Write through a temporary sibling file that replaces `target` only once
/// the writer has finished.
pub(crate) fn write_file<F>(target: &Path, write: F) -> Result<()>
where
    F: FnOnce(BufWriter<File>) -> Result<()>,
{
    let mut partial = target.as_os_str().to_owned();
    partial.push(".part");
    let partial = PathBuf::from(partial);

    let result = File::create(&partial)
        .map_err(Error::from)
        .and_then(|file| write(BufWriter::new(file)));
    match result {
        Ok(()) => {
            fs::rename(&partial, target)?;
            Ok(())
        }
        Err(e) => {
            let _ = fs::remove_file(&partial);
            Err(e)
        }
    }
}

// ---------------------------------------------------------------------------
// Export – per-dataset dispatch
// ---------------------------------------------------------------------------

/// Exporters bound to one dataset; see [`Dataset::export`].
pub struct Export<'a> {
    dataset: &'a Dataset,
}

impl<'a> Export<'a> {
    pub(crate) fn new(dataset: &'a Dataset) -> Self {
        Export { dataset }
    }

    /// Tab-separated values. Returns the path written.
    pub fn tsv(&self, path: impl AsRef<Path>, features: &[&str], options: &ExportOptions) -> Result<PathBuf> {
        self.run(path.as_ref(), "tsv", features, options, Some("TSV"), tsv::write)
    }

    /// Flow cytometry standard 3.0 file. Returns the path written.
    pub fn fcs(&self, path: impl AsRef<Path>, features: &[&str], options: &ExportOptions) -> Result<PathBuf> {
        self.run(path.as_ref(), "fcs", features, options, Some("FCS"), fcs::write)
    }

    /// Parquet container with configuration. Returns the path written.
    pub fn parquet(
        &self,
        path: impl AsRef<Path>,
        features: &[&str],
        options: &ExportOptions,
    ) -> Result<PathBuf> {
        self.run(path.as_ref(), "parquet", features, options, None, parquet::write)
    }

    fn run(
        &self,
        path: &Path,
        ext: &str,
        features: &[&str],
        options: &ExportOptions,
        scalar_only: Option<&'static str>,
        writer: fn(&Dataset, &Selection, &ExportOptions, BufWriter<File>) -> Result<()>,
    ) -> Result<PathBuf> {
        let selection = select(self.dataset, features, options.filtered, scalar_only)?;
        let target = target_path(path, ext, options.overwrite)?;
        write_file(&target, |out| writer(self.dataset, &selection, options, out))?;
        info!(
            "Exported {} events x {} features of {} to {}",
            selection.indices.len(),
            selection.features.len(),
            self.dataset.name(),
            target.display()
        );
        Ok(target)
    }
}

use std::path::PathBuf;

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// Errors surfaced by datasets, providers, filters and exporters.
///
/// `ProviderUnavailable` is normally absorbed by the basin chain; it only
/// reaches a caller who talks to a provider directly.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("dataset does not contain the feature '{0}'")]
    FeatureNotFound(String),

    #[error("provider '{location}' is unavailable: {reason}")]
    ProviderUnavailable { location: String, reason: String },

    #[error("data integrity: {0}")]
    DataIntegrity(String),

    #[error("index {index} out of range for feature '{feature}' ({len} events)")]
    IndexOutOfRange {
        feature: String,
        index: usize,
        len: usize,
    },

    #[error("invalid filter criterion on '{feature}': {reason}")]
    FilterCriterionInvalid { feature: String, reason: String },

    #[error("configuration [{section}] '{key}': {reason}")]
    Config {
        section: String,
        key: String,
        reason: String,
    },

    #[error("output file already exists: {} (set overwrite to replace it)", .0.display())]
    ExportConflict(PathBuf),

    #[error("nothing to export: {0}")]
    ExportEmpty(String),

    #[error("{format} export does not support array feature '{feature}'")]
    ExportUnsupported { format: &'static str, feature: String },

    #[error("unsupported file extension: .{0}")]
    UnsupportedFormat(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Arrow(#[from] arrow::error::ArrowError),

    #[error(transparent)]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn unavailable(location: impl Into<String>, reason: impl ToString) -> Self {
        Error::ProviderUnavailable {
            location: location.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn invalid_criterion(feature: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::FilterCriterionInvalid {
            feature: feature.into(),
            reason: reason.into(),
        }
    }
}

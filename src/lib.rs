//! Basin-aware event datasets for real-time deformability cytometry.
//!
//! A [`Dataset`] exposes per-event features from its own store and from
//! basins (other stores that supply the features it lacks), keeps a
//! combined manual/automatic event filter, identifies itself by a content
//! hash and exports filtered subsets to TSV, FCS or Parquet.
//!
//! ```no_run
//! use rusty_rtdc::{Criterion, Dataset, ExportOptions};
//!
//! # fn main() -> rusty_rtdc::Result<()> {
//! let mut ds = Dataset::open("measurement.parquet")?;
//! ds.add_criterion(Criterion::range("area_um", 0.0, 100.0))?;
//! ds.apply_filter()?;
//! ds.export().tsv("small_cells", &["area_um", "deform"], &ExportOptions::default())?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod data;
pub mod dataset;
pub mod error;
pub mod export;
pub mod hash;

pub use config::{ConfigValue, Configuration, RawValue};
pub use data::basin::{BasinDefinition, BasinPolicy, RemoteTransport};
pub use data::filter::{Criterion, CriterionId, FilterEngine};
pub use data::model::{FeatureColumn, FeatureKind, FeatureValue};
pub use data::provider::{FeatureProvider, MemoryStore};
pub use dataset::{Dataset, FeatureIter};
pub use error::{Error, Result};
pub use export::{Export, ExportOptions};

//! The dataset: configuration, features (through the basin chain), filter
//! state and identity of one measurement.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use log::{debug, info};

use crate::config::Configuration;
use crate::data::accessor::EventAccessor;
use crate::data::basin::{BasinDefinition, BasinPolicy, RemoteTransport, build_basins};
use crate::data::chain::BasinChain;
use crate::data::filter::{Criterion, CriterionId, FilterEngine, evaluate};
use crate::data::loader::open_store;
use crate::data::model::{FeatureColumn, FeatureKind, FeatureValue};
use crate::data::parquet_store::ParquetStore;
use crate::data::provider::{FeatureProvider, MemoryStore};
use crate::error::{Error, Result};
use crate::export::Export;
use crate::hash::{IdentityHasher, IdentitySource};

// ---------------------------------------------------------------------------
// Dataset
// ---------------------------------------------------------------------------

pub struct Dataset {
    name: String,
    path: Option<PathBuf>,
    config: Configuration,
    accessor: EventAccessor,
    filter: FilterEngine,
    identity: IdentityHasher,
}

impl Dataset {
    /// Open a measurement file, with basins resolved lazily.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, &BasinPolicy::default())
    }

    pub fn open_with(path: impl AsRef<Path>, policy: &BasinPolicy) -> Result<Self> {
        let path = path.as_ref();
        let opened = open_store(path)?;
        let config = Configuration::from_flat(opened.metadata)?;
        let basins = build_basins(&opened.basins, path.parent(), policy);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self::assemble(name, Some(path.to_path_buf()), config, opened.provider, basins)
    }

    /// Open a Parquet measurement served through `transport`.
    ///
    /// Remote datasets may only use remote basins.
    pub fn open_remote(url: &str, transport: Rc<dyn RemoteTransport>) -> Result<Self> {
        let payload = transport.fetch(url)?;
        let store = ParquetStore::from_bytes(url, payload)?;
        let config = Configuration::from_flat(store.metadata())?;
        let definitions = store.basins()?;
        let policy = BasinPolicy {
            local_basins_allowed: false,
            transport: Some(transport),
        };
        let basins = build_basins(&definitions, None, &policy);
        Self::assemble(url.to_string(), None, config, Box::new(store), basins)
    }

    /// A dataset over in-memory columns.
    pub fn from_columns(
        name: impl Into<String>,
        columns: BTreeMap<String, FeatureColumn>,
    ) -> Result<Self> {
        let name = name.into();
        let store = MemoryStore::new(name.clone(), columns)?;
        Self::assemble(name, None, Configuration::new(), Box::new(store), Vec::new())
    }

    /// A dataset over any provider, with configuration and basins given
    /// explicitly.
    pub fn from_parts(
        name: impl Into<String>,
        local: Box<dyn FeatureProvider>,
        config: Configuration,
        basins: &[BasinDefinition],
        policy: &BasinPolicy,
    ) -> Result<Self> {
        let basins = build_basins(basins, None, policy);
        Self::assemble(name.into(), None, config, local, basins)
    }

    fn assemble(
        name: String,
        path: Option<PathBuf>,
        config: Configuration,
        local: Box<dyn FeatureProvider>,
        basins: Vec<Box<dyn FeatureProvider>>,
    ) -> Result<Self> {
        let declared = config.event_count();
        if let Some(n) = declared {
            if !local.claimed().is_empty() {
                let local_len = local.length()?;
                if local_len != n {
                    return Err(Error::DataIntegrity(format!(
                        "{name}: configuration declares {n} events but the store holds {local_len}"
                    )));
                }
            }
        }

        let accessor = EventAccessor::new(BasinChain::new(local, basins), declared)?;
        let filter = FilterEngine::new(accessor.event_count());
        info!(
            "Dataset {name}: {} events, {} basins",
            filter.len(),
            accessor.chain().basins().len()
        );
        Ok(Dataset {
            name,
            path,
            config,
            accessor,
            filter,
            identity: IdentityHasher::new(),
        })
    }

    // -- identity and metadata --

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Configuration {
        &mut self.config
    }

    /// `"<sample> - M<run index>"`, falling back to the dataset name.
    pub fn title(&self) -> String {
        let sample = self
            .config
            .get("experiment", "sample")
            .ok()
            .map(ToString::to_string)
            .unwrap_or_else(|| self.name.clone());
        match self.config.get("experiment", "run index") {
            Ok(run) => format!("{sample} - M{run}"),
            Err(_) => sample,
        }
    }

    /// Fingerprint of the backing store, computed once.
    pub fn hash(&self) -> Result<&str> {
        self.identity.get_or_compute(|| match &self.path {
            Some(path) => Ok(IdentitySource::File(path.clone())),
            None => self.accessor.chain().local().identity(),
        })
    }

    // -- features --

    /// Number of events.
    pub fn len(&self) -> usize {
        self.filter.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Features stored in the dataset's own store.
    pub fn features_innate(&self) -> BTreeSet<String> {
        self.accessor.chain().innate_features()
    }

    /// Features offered by basins (declared, or found once a basin is open).
    pub fn features_basin(&self) -> BTreeSet<String> {
        self.accessor.chain().basin_features()
    }

    pub fn features(&self) -> BTreeSet<String> {
        let mut all = self.features_innate();
        all.extend(self.features_basin());
        all
    }

    /// Whether the feature can be resolved (may open basins).
    pub fn contains(&self, name: &str) -> bool {
        self.accessor.contains(name)
    }

    pub fn kind(&self, name: &str) -> Result<FeatureKind> {
        self.accessor.kind(name)
    }

    pub fn get(&self, name: &str, index: usize) -> Result<FeatureValue> {
        self.accessor.get(name, index)
    }

    /// Events `range` of one feature (unfiltered indices).
    pub fn slice(&self, name: &str, range: Range<usize>) -> Result<Vec<FeatureValue>> {
        self.accessor.slice(name, range)
    }

    /// All events of a scalar feature (unfiltered).
    pub fn scalars(&self, name: &str) -> Result<Rc<[f64]>> {
        self.accessor.scalars(name)
    }

    pub(crate) fn accessor(&self) -> &EventAccessor {
        &self.accessor
    }

    /// Iterate over one feature, optionally only over included events.
    ///
    /// Each call starts from the first event.
    pub fn iter_feature(&self, name: &str, filtered: bool) -> Result<FeatureIter<'_>> {
        let kind = self.accessor.kind(name)?;
        let indices = if filtered {
            self.filter.filtered_indices()
        } else {
            (0..self.len()).collect()
        };
        let scalars = match kind {
            FeatureKind::Scalar => Some(self.accessor.scalars(name)?),
            FeatureKind::Array => None,
        };
        Ok(FeatureIter {
            accessor: &self.accessor,
            name: name.to_string(),
            scalars,
            indices: indices.into_iter(),
        })
    }

    // -- filtering --

    pub fn filter(&self) -> &FilterEngine {
        &self.filter
    }

    /// Manual mask edits go through here; criteria go through
    /// [`Dataset::add_criterion`] so their features are checked.
    pub fn filter_mut(&mut self) -> &mut FilterEngine {
        &mut self.filter
    }

    /// Add an automatic criterion. Its features must resolve to scalar
    /// features; it takes effect at the next [`Dataset::apply_filter`].
    pub fn add_criterion(&mut self, criterion: Criterion) -> Result<CriterionId> {
        criterion.validate()?;
        for feature in criterion.features() {
            match self.accessor.kind(feature) {
                Ok(FeatureKind::Scalar) => {}
                Ok(FeatureKind::Array) => {
                    return Err(Error::invalid_criterion(feature, "not a scalar feature"));
                }
                Err(Error::FeatureNotFound(_)) => {
                    return Err(Error::invalid_criterion(feature, "feature not available"));
                }
                Err(e) => return Err(e),
            }
        }
        self.filter.add_criterion(criterion)
    }

    pub fn remove_criterion(&mut self, id: CriterionId) -> Option<Criterion> {
        self.filter.remove_criterion(id)
    }

    /// Recompute the effective mask from the manual mask and all criteria.
    pub fn apply_filter(&mut self) -> Result<()> {
        let mut results = Vec::new();
        for criterion in self.filter.criteria() {
            let columns = criterion
                .features()
                .into_iter()
                .map(|f| self.accessor.scalars(f))
                .collect::<Result<Vec<_>>>()?;
            let slices: Vec<&[f64]> = columns.iter().map(|c| c.as_ref()).collect();
            results.push(evaluate(criterion, &slices)?);
        }
        self.filter.commit(results)?;
        debug!(
            "{}: filter keeps {} of {} events",
            self.name,
            self.filter.count(),
            self.len()
        );
        Ok(())
    }

    // -- export and lifecycle --

    pub fn export(&self) -> Export<'_> {
        Export::new(self)
    }

    /// Drop cached feature data and release every backing store.
    pub fn close(&mut self) {
        debug!("Closing dataset {}", self.name);
        self.accessor.clear();
    }
}

impl Drop for Dataset {
    fn drop(&mut self) {
        self.close();
    }
}

/// Datasets are equal when their identity hashes are.
impl PartialEq for Dataset {
    fn eq(&self, other: &Self) -> bool {
        match (self.hash(), other.hash()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dataset")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("events", &self.len())
            .field("hash", &self.identity.cached())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// FeatureIter
// ---------------------------------------------------------------------------

/// Lazy iteration over one feature's events.
pub struct FeatureIter<'a> {
    accessor: &'a EventAccessor,
    name: String,
    scalars: Option<Rc<[f64]>>,
    indices: std::vec::IntoIter<usize>,
}

impl Iterator for FeatureIter<'_> {
    type Item = Result<FeatureValue>;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.indices.next()?;
        Some(match &self.scalars {
            Some(values) => Ok(FeatureValue::Scalar(values[index])),
            None => self.accessor.get(&self.name, index),
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.indices.size_hint()
    }
}

impl ExactSizeIterator for FeatureIter<'_> {}

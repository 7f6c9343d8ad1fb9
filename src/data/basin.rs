//! Basins: external stores that supply features the local store lacks.
//!
//! A store lists its basins as [`BasinDefinition`]s. Each supported
//! definition becomes a [`BasinProvider`] that opens its backing store only
//! when a feature is first requested from it.

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hash::IdentitySource;

use super::loader::open_store;
use super::model::{FeatureKind, FeatureValue};
use super::parquet_store::ParquetStore;
use super::provider::FeatureProvider;

// ---------------------------------------------------------------------------
// BasinDefinition – how a store declares a basin
// ---------------------------------------------------------------------------

/// A basin as declared in store metadata.
///
/// ```json
/// { "type": "file", "format": "parquet", "features": ["image"],
///   "paths": ["/data/raw.parquet", "raw.parquet"] }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasinDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub basin_type: String,
    pub format: String,
    /// Features this basin is meant to supply. `None` means "whatever the
    /// store has", which can only be known after opening it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
}

impl BasinDefinition {
    /// A local Parquet basin; candidate paths are tried in order.
    pub fn file<P: Into<String>>(paths: impl IntoIterator<Item = P>) -> Self {
        BasinDefinition {
            name: None,
            basin_type: "file".to_string(),
            format: "parquet".to_string(),
            features: None,
            paths: paths.into_iter().map(Into::into).collect(),
            urls: Vec::new(),
        }
    }

    /// A remote basin fetched through a [`RemoteTransport`].
    pub fn remote<U: Into<String>>(format: &str, urls: impl IntoIterator<Item = U>) -> Self {
        BasinDefinition {
            name: None,
            basin_type: "remote".to_string(),
            format: format.to_string(),
            features: None,
            paths: Vec::new(),
            urls: urls.into_iter().map(Into::into).collect(),
        }
    }

    pub fn with_features<S: Into<String>>(mut self, features: impl IntoIterator<Item = S>) -> Self {
        self.features = Some(features.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sort key: local files before remote stores, cheap formats first.
    /// Unknown types or formats sort last.
    pub fn priority_key(&self) -> String {
        let t = match self.basin_type.as_str() {
            "file" => 'a',
            "remote" => 'b',
            _ => 'z',
        };
        let f = match self.format.as_str() {
            "parquet" => 'a',
            "http" => 'b',
            "s3" => 'c',
            "dcor" => 'd',
            _ => 'z',
        };
        format!("{t}{f}")
    }

    fn label(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("{} basin ({})", self.basin_type, self.format),
        }
    }
}

// ---------------------------------------------------------------------------
// Remote transport
// ---------------------------------------------------------------------------

/// Fetches remote basin payloads. The physical transport (HTTP, S3, DCOR)
/// lives outside this crate.
pub trait RemoteTransport {
    /// Return the Parquet payload found at `url`.
    fn fetch(&self, url: &str) -> anyhow::Result<Vec<u8>>;
}

/// Options that decide which basins a dataset may use.
#[derive(Clone)]
pub struct BasinPolicy {
    /// Remote datasets must not reach into the local file system.
    pub local_basins_allowed: bool,
    pub transport: Option<Rc<dyn RemoteTransport>>,
}

impl Default for BasinPolicy {
    fn default() -> Self {
        Self {
            local_basins_allowed: true,
            transport: None,
        }
    }
}

// ---------------------------------------------------------------------------
// BasinProvider – a lazily opened basin
// ---------------------------------------------------------------------------

enum Target {
    File(Vec<PathBuf>),
    Remote(Vec<String>),
}

enum State {
    Closed,
    Open(Box<dyn FeatureProvider>),
    Unavailable(String),
}

/// A basin that opens its store on first probe.
pub struct BasinProvider {
    label: String,
    target: Target,
    declared: Option<Vec<String>>,
    transport: Option<Rc<dyn RemoteTransport>>,
    state: RefCell<State>,
}

impl BasinProvider {
    fn open_target(&self) -> std::result::Result<Box<dyn FeatureProvider>, String> {
        match &self.target {
            Target::File(paths) => {
                let path = paths
                    .iter()
                    .find(|p| p.exists())
                    .ok_or_else(|| "none of the basin paths exist".to_string())?;
                let opened = open_store(path).map_err(|e| e.to_string())?;
                if !opened.basins.is_empty() {
                    debug!("{}: not following basins of {}", self.label, path.display());
                }
                Ok(opened.provider)
            }
            Target::Remote(urls) => {
                let transport = self
                    .transport
                    .as_ref()
                    .ok_or_else(|| "no remote transport configured".to_string())?;
                let mut last_error = "no URLs given".to_string();
                for url in urls {
                    match transport
                        .fetch(url)
                        .map_err(Error::from)
                        .and_then(|payload| ParquetStore::from_bytes(url.clone(), payload))
                    {
                        Ok(store) => return Ok(Box::new(store)),
                        Err(e) => {
                            debug!("{}: {url} failed: {e}", self.label);
                            last_error = e.to_string();
                        }
                    }
                }
                Err(last_error)
            }
        }
    }

    fn with_open<T>(&self, name: &str, f: impl FnOnce(&dyn FeatureProvider) -> Result<T>) -> Result<T> {
        if !self.declares(name) {
            return Err(Error::FeatureNotFound(name.to_string()));
        }
        self.probe()?;
        match &*self.state.borrow() {
            State::Open(inner) => f(inner.as_ref()),
            _ => Err(Error::unavailable(&self.label, "not open")),
        }
    }
}

impl FeatureProvider for BasinProvider {
    fn location(&self) -> &str {
        &self.label
    }

    fn probe(&self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        match &*state {
            State::Open(_) => Ok(()),
            State::Unavailable(reason) => Err(Error::unavailable(&self.label, reason)),
            State::Closed => match self.open_target() {
                Ok(inner) => {
                    debug!("{}: opened {}", self.label, inner.location());
                    *state = State::Open(inner);
                    Ok(())
                }
                Err(reason) => {
                    warn!("Basin {} is unavailable: {reason}", self.label);
                    let err = Error::unavailable(&self.label, &reason);
                    *state = State::Unavailable(reason);
                    Err(err)
                }
            },
        }
    }

    fn is_available(&self) -> bool {
        !matches!(&*self.state.borrow(), State::Unavailable(_))
    }

    fn declares(&self, name: &str) -> bool {
        match &self.declared {
            Some(list) => list.iter().any(|f| f == name),
            None => true,
        }
    }

    /// Features known without I/O: the store's real features once opened,
    /// nothing before.
    fn features(&self) -> Vec<(String, FeatureKind)> {
        match &*self.state.borrow() {
            State::Open(inner) => inner
                .features()
                .into_iter()
                .filter(|(name, _)| self.declares(name))
                .collect(),
            _ => Vec::new(),
        }
    }

    fn claimed(&self) -> Vec<String> {
        match (&*self.state.borrow(), &self.declared) {
            (State::Open(_), _) => self.features().into_iter().map(|(n, _)| n).collect(),
            (State::Closed, Some(declared)) => declared.clone(),
            _ => Vec::new(),
        }
    }

    fn length(&self) -> Result<usize> {
        self.probe()?;
        match &*self.state.borrow() {
            State::Open(inner) => inner.length(),
            _ => Err(Error::unavailable(&self.label, "not open")),
        }
    }

    fn feature_len(&self, name: &str) -> Result<usize> {
        self.with_open(name, |inner| inner.feature_len(name))
    }

    fn get(&self, name: &str, index: usize) -> Result<FeatureValue> {
        self.with_open(name, |inner| inner.get(name, index))
    }

    fn scalars(&self, name: &str) -> Result<Vec<f64>> {
        self.with_open(name, |inner| inner.scalars(name))
    }

    fn identity(&self) -> Result<IdentitySource> {
        self.probe()?;
        match &*self.state.borrow() {
            State::Open(inner) => inner.identity(),
            _ => Err(Error::unavailable(&self.label, "not open")),
        }
    }

    fn close(&self) {
        *self.state.borrow_mut() = State::Closed;
    }
}

// ---------------------------------------------------------------------------
// Building providers from definitions
// ---------------------------------------------------------------------------

/// Turn declared basins into providers, highest priority first.
///
/// Unsupported types and formats, and local basins where they are not
/// allowed, are skipped with a warning. Nothing is opened here.
pub fn build_basins(
    definitions: &[BasinDefinition],
    base_dir: Option<&Path>,
    policy: &BasinPolicy,
) -> Vec<Box<dyn FeatureProvider>> {
    let mut sorted: Vec<&BasinDefinition> = definitions.iter().collect();
    sorted.sort_by_key(|d| d.priority_key());

    let mut providers: Vec<Box<dyn FeatureProvider>> = Vec::new();
    for def in sorted {
        let target = match (def.basin_type.as_str(), def.format.as_str()) {
            ("file", "parquet") if !policy.local_basins_allowed => {
                warn!(
                    "Basin type 'file' not allowed for format '{}' in this dataset",
                    def.format
                );
                continue;
            }
            ("file", "parquet") => Target::File(
                def.paths
                    .iter()
                    .map(|p| match base_dir {
                        Some(dir) if Path::new(p).is_relative() => dir.join(p),
                        _ => PathBuf::from(p),
                    })
                    .collect(),
            ),
            ("remote", "http" | "s3" | "dcor") => Target::Remote(def.urls.clone()),
            ("file" | "remote", format) => {
                warn!("Encountered unsupported basin format '{format}'");
                continue;
            }
            (other, _) => {
                warn!("Encountered unsupported basin type '{other}'");
                continue;
            }
        };
        providers.push(Box::new(BasinProvider {
            label: def.label(),
            target,
            declared: def.features.clone(),
            transport: policy.transport.clone(),
            state: RefCell::new(State::Closed),
        }));
    }
    providers
}

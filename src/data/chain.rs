use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};

use log::debug;

use crate::error::{Error, Result};

use super::provider::FeatureProvider;

// ---------------------------------------------------------------------------
// BasinChain – ordered providers with a per-feature resolution cache
// ---------------------------------------------------------------------------

/// The local store followed by its basins, highest priority first.
///
/// A feature resolves to the first provider that declares it, can be
/// reached, and actually has it. Unreachable providers are skipped. The
/// answer is cached per feature name until [`BasinChain::clear`].
pub struct BasinChain {
    providers: Vec<Box<dyn FeatureProvider>>,
    resolved: RefCell<HashMap<String, usize>>,
}

impl BasinChain {
    pub fn new(local: Box<dyn FeatureProvider>, basins: Vec<Box<dyn FeatureProvider>>) -> Self {
        let mut providers = Vec::with_capacity(basins.len() + 1);
        providers.push(local);
        providers.extend(basins);
        BasinChain {
            providers,
            resolved: RefCell::new(HashMap::new()),
        }
    }

    /// Index of the provider serving `name`.
    pub fn resolve(&self, name: &str) -> Result<usize> {
        if let Some(&idx) = self.resolved.borrow().get(name) {
            return Ok(idx);
        }

        for (idx, provider) in self.providers.iter().enumerate() {
            if !provider.declares(name) || !provider.is_available() {
                continue;
            }
            if let Err(e) = provider.probe() {
                debug!("Skipping {} for '{name}': {e}", provider.location());
                continue;
            }
            if provider.has(name) {
                debug!("Feature '{name}' resolved to {}", provider.location());
                self.resolved.borrow_mut().insert(name.to_string(), idx);
                return Ok(idx);
            }
        }
        Err(Error::FeatureNotFound(name.to_string()))
    }

    /// The provider serving `name`.
    pub fn provider_for(&self, name: &str) -> Result<&dyn FeatureProvider> {
        let idx = self.resolve(name)?;
        Ok(self.providers[idx].as_ref())
    }

    pub fn provider(&self, idx: usize) -> Option<&dyn FeatureProvider> {
        self.providers.get(idx).map(|p| p.as_ref())
    }

    /// The dataset's own store.
    pub fn local(&self) -> &dyn FeatureProvider {
        self.providers[0].as_ref()
    }

    pub fn basins(&self) -> &[Box<dyn FeatureProvider>] {
        &self.providers[1..]
    }

    /// Features stored in the local store.
    pub fn innate_features(&self) -> BTreeSet<String> {
        self.local().claimed().into_iter().collect()
    }

    /// Features claimed by the basins (declared or, once opened, real).
    pub fn basin_features(&self) -> BTreeSet<String> {
        let innate = self.innate_features();
        self.basins()
            .iter()
            .flat_map(|p| p.claimed())
            .filter(|name| !innate.contains(name))
            .collect()
    }

    /// Number of feature names with a cached resolution.
    pub fn resolved_count(&self) -> usize {
        self.resolved.borrow().len()
    }

    /// Forget resolutions and release every provider.
    pub fn clear(&self) {
        self.resolved.borrow_mut().clear();
        for provider in &self.providers {
            provider.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::collections::BTreeMap;
    use std::rc::Rc;

    use super::*;
    use crate::data::model::{FeatureColumn, FeatureKind, FeatureValue};
    use crate::data::provider::MemoryStore;
    use crate::hash::IdentitySource;

    /// Wraps a memory store, counts probes and can pretend to be offline.
    struct Flaky {
        inner: MemoryStore,
        online: bool,
        probes: Rc<Cell<usize>>,
    }

    impl FeatureProvider for Flaky {
        fn location(&self) -> &str {
            self.inner.location()
        }
        fn probe(&self) -> Result<()> {
            self.probes.set(self.probes.get() + 1);
            if self.online {
                Ok(())
            } else {
                Err(Error::unavailable(self.location(), "offline"))
            }
        }
        fn features(&self) -> Vec<(String, FeatureKind)> {
            self.inner.features()
        }
        fn length(&self) -> Result<usize> {
            self.inner.length()
        }
        fn get(&self, name: &str, index: usize) -> Result<FeatureValue> {
            self.inner.get(name, index)
        }
        fn scalars(&self, name: &str) -> Result<Vec<f64>> {
            self.inner.scalars(name)
        }
        fn identity(&self) -> Result<IdentitySource> {
            self.inner.identity()
        }
    }

    fn store(name: &str, features: &[&str]) -> MemoryStore {
        let columns: BTreeMap<String, FeatureColumn> = features
            .iter()
            .map(|f| (f.to_string(), FeatureColumn::Scalar(vec![1.0, 2.0])))
            .collect();
        MemoryStore::new(name, columns).unwrap()
    }

    fn flaky(name: &str, features: &[&str], online: bool) -> (Box<dyn FeatureProvider>, Rc<Cell<usize>>) {
        let probes = Rc::new(Cell::new(0));
        let provider = Flaky {
            inner: store(name, features),
            online,
            probes: probes.clone(),
        };
        (Box::new(provider), probes)
    }

    #[test]
    fn local_store_wins() {
        let (basin, probes) = flaky("basin", &["area_um", "image"], true);
        let chain = BasinChain::new(Box::new(store("local", &["area_um"])), vec![basin]);
        assert_eq!(chain.resolve("area_um").unwrap(), 0);
        assert_eq!(probes.get(), 0, "basin must not be probed for innate features");
        assert_eq!(chain.resolve("image").unwrap(), 1);
    }

    #[test]
    fn unreachable_basin_falls_through() {
        let (down, _) = flaky("down", &["image"], false);
        let (up, _) = flaky("up", &["image"], true);
        let chain = BasinChain::new(Box::new(store("local", &["area_um"])), vec![down, up]);
        assert_eq!(chain.provider_for("image").unwrap().location(), "up");
    }

    #[test]
    fn resolution_is_cached_and_deterministic() {
        let (basin, probes) = flaky("basin", &["image"], true);
        let chain = BasinChain::new(Box::new(store("local", &["area_um"])), vec![basin]);
        for _ in 0..5 {
            assert_eq!(chain.resolve("image").unwrap(), 1);
        }
        assert_eq!(probes.get(), 1);
    }

    #[test]
    fn clear_forgets_resolutions() {
        let (basin, probes) = flaky("basin", &["image"], true);
        let chain = BasinChain::new(Box::new(store("local", &["area_um"])), vec![basin]);
        chain.resolve("image").unwrap();
        chain.resolve("area_um").unwrap();
        assert_eq!(chain.resolved_count(), 2);

        chain.clear();
        assert_eq!(chain.resolved_count(), 0);
        assert_eq!(chain.resolve("image").unwrap(), 1);
        assert_eq!(probes.get(), 2, "resolved again after clear");
    }

    #[test]
    fn exhausted_chain_is_feature_not_found() {
        let (down, _) = flaky("down", &["image"], false);
        let chain = BasinChain::new(Box::new(store("local", &["area_um"])), vec![down]);
        assert!(matches!(chain.resolve("image"), Err(Error::FeatureNotFound(f)) if f == "image"));
        assert!(matches!(chain.resolve("deform"), Err(Error::FeatureNotFound(_))));
    }

    #[test]
    fn feature_listing() {
        let (basin, _) = flaky("basin", &["area_um", "image"], true);
        let chain = BasinChain::new(Box::new(store("local", &["area_um"])), vec![basin]);
        assert_eq!(chain.innate_features().into_iter().collect::<Vec<_>>(), vec!["area_um"]);
        assert_eq!(chain.basin_features().into_iter().collect::<Vec<_>>(), vec!["image"]);
    }
}

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::ops::Range;
use std::rc::Rc;

use log::debug;

use crate::error::{Error, Result};

use super::chain::BasinChain;
use super::model::{FeatureKind, FeatureValue};
use super::provider::{FeatureProvider, out_of_range};

/// Per-event array values kept around for repeated access.
pub const ARRAY_CACHE_CAPACITY: usize = 8;

// ---------------------------------------------------------------------------
// EventCache – small recency-bounded cache for array events
// ---------------------------------------------------------------------------

/// Keeps the most recently used `(feature, index)` array values.
#[derive(Debug)]
struct EventCache {
    capacity: usize,
    entries: VecDeque<((String, usize), Rc<[f64]>)>,
}

impl EventCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    fn get(&mut self, feature: &str, index: usize) -> Option<Rc<[f64]>> {
        let pos = self
            .entries
            .iter()
            .position(|((f, i), _)| *i == index && f == feature)?;
        let entry = self.entries.remove(pos)?;
        let value = entry.1.clone();
        self.entries.push_back(entry);
        Some(value)
    }

    fn insert(&mut self, feature: &str, index: usize, value: Rc<[f64]>) {
        if self.capacity == 0 {
            return;
        }
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(((feature.to_string(), index), value));
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

// ---------------------------------------------------------------------------
// EventAccessor
// ---------------------------------------------------------------------------

fn count_events(chain: &BasinChain) -> Result<usize> {
    let local = chain.local();
    if !local.claimed().is_empty() {
        return local.length();
    }
    for basin in chain.basins() {
        match basin.length() {
            Ok(n) => return Ok(n),
            Err(err) => debug!("{}: no event count: {err}", basin.location()),
        }
    }
    Ok(0)
}

/// Dataset-facing access to features through the basin chain.
///
/// Scalar features are materialized once and shared; array features are
/// fetched per event through a small cache. Every feature's length is
/// checked against the event count the first time it is resolved.
pub struct EventAccessor {
    chain: BasinChain,
    event_count: usize,
    checked: RefCell<HashSet<String>>,
    scalars: RefCell<HashMap<String, Rc<[f64]>>>,
    arrays: RefCell<EventCache>,
}

impl EventAccessor {
    /// `declared_count` is the store's authoritative event count, if any.
    ///
    /// Without one, the count is the local store's length, else the length
    /// of the first reachable basin, which opens that basin here.
    pub fn new(chain: BasinChain, declared_count: Option<usize>) -> Result<Self> {
        let event_count = match declared_count {
            Some(n) => n,
            None => count_events(&chain)?,
        };
        Ok(EventAccessor {
            chain,
            event_count,
            checked: RefCell::new(HashSet::new()),
            scalars: RefCell::new(HashMap::new()),
            arrays: RefCell::new(EventCache::new(ARRAY_CACHE_CAPACITY)),
        })
    }

    pub fn chain(&self) -> &BasinChain {
        &self.chain
    }

    pub fn event_count(&self) -> usize {
        self.event_count
    }

    /// Resolve a feature and check its length once.
    fn provider(&self, name: &str) -> Result<&dyn FeatureProvider> {
        let provider = self.chain.provider_for(name)?;
        if self.checked.borrow().contains(name) {
            return Ok(provider);
        }

        let len = provider.feature_len(name)?;
        let expected = self.event_count();
        let unbacked = len == 0 && provider.kind(name) == Some(FeatureKind::Array);
        if len != expected && !unbacked {
            return Err(Error::DataIntegrity(format!(
                "feature '{name}' from {} has {len} events, dataset has {expected}",
                provider.location()
            )));
        }
        self.checked.borrow_mut().insert(name.to_string());
        Ok(provider)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.chain.resolve(name).is_ok()
    }

    pub fn kind(&self, name: &str) -> Result<FeatureKind> {
        self.provider(name)?
            .kind(name)
            .ok_or_else(|| Error::FeatureNotFound(name.to_string()))
    }

    /// Number of events that actually carry data for `name` (zero for
    /// declared-but-unbacked array features).
    pub fn backed_len(&self, name: &str) -> Result<usize> {
        self.provider(name)?.feature_len(name)
    }

    /// The whole scalar feature, loaded on first use.
    pub fn scalars(&self, name: &str) -> Result<Rc<[f64]>> {
        if let Some(values) = self.scalars.borrow().get(name) {
            return Ok(values.clone());
        }
        let provider = self.provider(name)?;
        if provider.kind(name) != Some(FeatureKind::Scalar) {
            return Err(Error::DataIntegrity(format!(
                "feature '{name}' is an array feature, not a scalar one"
            )));
        }
        let values: Rc<[f64]> = Rc::from(provider.scalars(name)?);
        debug!("Materialized '{name}' ({} events)", values.len());
        self.scalars
            .borrow_mut()
            .insert(name.to_string(), values.clone());
        Ok(values)
    }

    /// One event of one feature.
    pub fn get(&self, name: &str, index: usize) -> Result<FeatureValue> {
        let provider = self.provider(name)?;
        let len = self.event_count();
        if index >= len {
            return Err(out_of_range(name, index, len));
        }
        match provider.kind(name) {
            Some(FeatureKind::Scalar) => Ok(FeatureValue::Scalar(self.scalars(name)?[index])),
            Some(FeatureKind::Array) => {
                if let Some(values) = self.arrays.borrow_mut().get(name, index) {
                    return Ok(FeatureValue::Array(values.to_vec()));
                }
                let value = provider.get(name, index)?;
                if let FeatureValue::Array(values) = &value {
                    self.arrays
                        .borrow_mut()
                        .insert(name, index, Rc::from(values.as_slice()));
                }
                Ok(value)
            }
            None => Err(Error::FeatureNotFound(name.to_string())),
        }
    }

    /// A contiguous run of events of one feature.
    pub fn slice(&self, name: &str, range: Range<usize>) -> Result<Vec<FeatureValue>> {
        let kind = self.kind(name)?;
        let len = self.event_count();
        if range.end > len || range.start > range.end {
            return Err(out_of_range(name, range.end.max(range.start), len));
        }
        match kind {
            FeatureKind::Scalar => {
                let values = self.scalars(name)?;
                Ok(values[range].iter().map(|v| FeatureValue::Scalar(*v)).collect())
            }
            FeatureKind::Array => range.map(|i| self.get(name, i)).collect(),
        }
    }

    pub fn cached_events(&self) -> usize {
        self.arrays.borrow().len()
    }

    /// Drop every cache and release the providers.
    pub fn clear(&self) {
        self.checked.borrow_mut().clear();
        self.scalars.borrow_mut().clear();
        self.arrays.borrow_mut().clear();
        self.chain.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::data::model::FeatureColumn;
    use crate::data::provider::MemoryStore;

    fn accessor(declared: Option<usize>) -> EventAccessor {
        let mut columns = BTreeMap::new();
        columns.insert("area_um".to_string(), FeatureColumn::Scalar(vec![5.0, 6.0, 7.0]));
        columns.insert(
            "image".to_string(),
            FeatureColumn::Array((0..3).map(|i| vec![i as f64; 4]).collect()),
        );
        columns.insert("mask".to_string(), FeatureColumn::Array(Vec::new()));
        let local = MemoryStore::new("local", columns).unwrap();
        EventAccessor::new(BasinChain::new(Box::new(local), Vec::new()), declared).unwrap()
    }

    #[test]
    fn event_cache_evicts_oldest() {
        let mut cache = EventCache::new(2);
        cache.insert("image", 0, Rc::from(vec![0.0]));
        cache.insert("image", 1, Rc::from(vec![1.0]));
        assert!(cache.get("image", 0).is_some());
        cache.insert("image", 2, Rc::from(vec![2.0]));
        assert!(cache.get("image", 1).is_none(), "least recently used goes first");
        assert!(cache.get("image", 0).is_some());
        assert!(cache.get("image", 2).is_some());
    }

    #[test]
    fn get_scalar_and_array() {
        let acc = accessor(None);
        assert_eq!(acc.event_count(), 3);
        assert_eq!(acc.get("area_um", 2).unwrap(), FeatureValue::Scalar(7.0));
        assert_eq!(acc.get("image", 1).unwrap(), FeatureValue::Array(vec![1.0; 4]));
        assert_eq!(acc.cached_events(), 1);
        acc.get("image", 1).unwrap();
        assert_eq!(acc.cached_events(), 1);
    }

    #[test]
    fn out_of_range_and_unknown() {
        let acc = accessor(None);
        assert!(matches!(acc.get("area_um", 3), Err(Error::IndexOutOfRange { index: 3, .. })));
        assert!(matches!(acc.get("deform", 0), Err(Error::FeatureNotFound(_))));
    }

    #[test]
    fn slices_check_bounds() {
        let acc = accessor(None);
        assert_eq!(
            acc.slice("area_um", 1..3).unwrap(),
            vec![FeatureValue::Scalar(6.0), FeatureValue::Scalar(7.0)]
        );
        assert_eq!(acc.slice("image", 2..3).unwrap(), vec![FeatureValue::Array(vec![2.0; 4])]);
        assert!(acc.slice("area_um", 0..0).unwrap().is_empty());
        assert!(matches!(acc.slice("area_um", 2..4), Err(Error::IndexOutOfRange { index: 4, .. })));
    }

    #[test]
    fn declared_count_mismatch_is_integrity_error() {
        let acc = accessor(Some(4));
        assert!(matches!(acc.get("area_um", 0), Err(Error::DataIntegrity(_))));
    }

    #[test]
    fn unbacked_array_feature_resolves_with_zero_length() {
        let acc = accessor(None);
        assert_eq!(acc.backed_len("mask").unwrap(), 0);
        assert!(acc.get("mask", 0).is_err());
    }

    /// Knows its features but cannot count its events.
    struct Broken;

    impl FeatureProvider for Broken {
        fn location(&self) -> &str {
            "broken"
        }
        fn features(&self) -> Vec<(String, FeatureKind)> {
            vec![("area_um".to_string(), FeatureKind::Scalar)]
        }
        fn length(&self) -> Result<usize> {
            Err(Error::unavailable("broken", "footer unreadable"))
        }
        fn get(&self, name: &str, _index: usize) -> Result<FeatureValue> {
            Err(Error::FeatureNotFound(name.to_string()))
        }
        fn scalars(&self, name: &str) -> Result<Vec<f64>> {
            Err(Error::FeatureNotFound(name.to_string()))
        }
        fn identity(&self) -> Result<crate::hash::IdentitySource> {
            Err(Error::unavailable("broken", "no data"))
        }
    }

    #[test]
    fn local_length_failure_is_reported() {
        let result = EventAccessor::new(BasinChain::new(Box::new(Broken), Vec::new()), None);
        assert!(matches!(result, Err(Error::ProviderUnavailable { .. })));
        // a declared count does not need the store's length
        let acc = EventAccessor::new(BasinChain::new(Box::new(Broken), Vec::new()), Some(2)).unwrap();
        assert_eq!(acc.event_count(), 2);
    }

    #[test]
    fn count_comes_from_first_reachable_basin() {
        let empty = MemoryStore::new("local", BTreeMap::new()).unwrap();
        let mut columns = BTreeMap::new();
        columns.insert("image".to_string(), FeatureColumn::Array(vec![vec![0.0]; 5]));
        let basin = MemoryStore::new("basin", columns).unwrap();
        let chain = BasinChain::new(Box::new(empty), vec![Box::new(Broken), Box::new(basin)]);
        let acc = EventAccessor::new(chain, None).unwrap();
        assert_eq!(acc.event_count(), 5);
    }
}

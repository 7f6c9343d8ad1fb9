use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::hash::{IdentitySource, SAMPLE_BYTES};

use super::model::{FeatureColumn, FeatureKind, FeatureValue};

// ---------------------------------------------------------------------------
// FeatureProvider – one backing store
// ---------------------------------------------------------------------------

/// A single backing store (local file, in-memory data or a basin).
///
/// Feature claims (`features`, `has`) are advisory; `get` is authoritative
/// and fails if the data is not actually there. Methods take `&self`; stores
/// that open lazily keep their state behind a `RefCell`.
pub trait FeatureProvider {
    /// Human readable location (path, URL or name).
    fn location(&self) -> &str;

    /// Make sure the store is reachable, opening it if needed.
    ///
    /// Idempotent. Local stores are always available.
    fn probe(&self) -> Result<()> {
        Ok(())
    }

    /// Whether the last probe succeeded (or the store needs none).
    fn is_available(&self) -> bool {
        true
    }

    /// Whether the store *declares* a feature without doing any I/O.
    ///
    /// Lazy stores use this to skip probing for features they cannot serve.
    fn declares(&self, name: &str) -> bool {
        self.has(name)
    }

    /// Feature names and kinds this store can serve, sorted by name.
    fn features(&self) -> Vec<(String, FeatureKind)>;

    /// Names this store claims to serve without doing any I/O.
    fn claimed(&self) -> Vec<String> {
        self.features().into_iter().map(|(name, _)| name).collect()
    }

    fn has(&self, name: &str) -> bool {
        self.kind(name).is_some()
    }

    fn kind(&self, name: &str) -> Option<FeatureKind> {
        self.features()
            .into_iter()
            .find(|(feat, _)| feat == name)
            .map(|(_, kind)| kind)
    }

    /// Number of events in the store.
    fn length(&self) -> Result<usize>;

    /// Number of events actually backed for one feature.
    ///
    /// Zero means the feature is declared but has no data.
    fn feature_len(&self, name: &str) -> Result<usize> {
        if self.has(name) {
            self.length()
        } else {
            Err(Error::FeatureNotFound(name.to_string()))
        }
    }

    /// One event of one feature.
    fn get(&self, name: &str, index: usize) -> Result<FeatureValue>;

    /// A whole scalar feature.
    fn scalars(&self, name: &str) -> Result<Vec<f64>>;

    /// What the identity hash is computed from.
    fn identity(&self) -> Result<IdentitySource>;

    /// Release open handles and caches. The store may be probed again.
    fn close(&self) {}
}

pub(crate) fn out_of_range(feature: &str, index: usize, len: usize) -> Error {
    Error::IndexOutOfRange {
        feature: feature.to_string(),
        index,
        len,
    }
}

// ---------------------------------------------------------------------------
// MemoryStore – columns held in memory
// ---------------------------------------------------------------------------

/// A store backed by in-memory columns (JSON/CSV files, or data built in code).
#[derive(Debug, Clone)]
pub struct MemoryStore {
    name: String,
    columns: BTreeMap<String, FeatureColumn>,
    len: usize,
}

impl MemoryStore {
    /// All non-empty columns must have the same number of events. Empty
    /// array columns are allowed: they stand for declared-but-unbacked data.
    pub fn new(name: impl Into<String>, columns: BTreeMap<String, FeatureColumn>) -> Result<Self> {
        let name = name.into();
        let mut len: Option<(usize, &str)> = None;
        for (feat, column) in &columns {
            if column.is_empty() && column.kind() == FeatureKind::Array {
                continue;
            }
            match len {
                None => len = Some((column.len(), feat)),
                Some((n, first)) if n != column.len() => {
                    return Err(Error::DataIntegrity(format!(
                        "{name}: feature '{feat}' has {} events but '{first}' has {n}",
                        column.len()
                    )));
                }
                Some(_) => {}
            }
        }
        let len = len.map(|(n, _)| n).unwrap_or(0);
        Ok(MemoryStore { name, columns, len })
    }

    pub fn column(&self, name: &str) -> Option<&FeatureColumn> {
        self.columns.get(name)
    }

    fn require(&self, name: &str) -> Result<&FeatureColumn> {
        self.columns
            .get(name)
            .ok_or_else(|| Error::FeatureNotFound(name.to_string()))
    }

    /// Column bytes in name order, at most [`SAMPLE_BYTES`] of them.
    ///
    /// Each column is framed by its name, kind and event count, and each
    /// array event by its length, so equal values in a different shape give
    /// a different sample.
    fn content_sample(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (feat, column) in &self.columns {
            if out.len() >= SAMPLE_BYTES {
                break;
            }
            out.extend_from_slice(&(feat.len() as u64).to_le_bytes());
            out.extend_from_slice(feat.as_bytes());
            match column {
                FeatureColumn::Scalar(values) => {
                    out.push(b's');
                    out.extend_from_slice(&(values.len() as u64).to_le_bytes());
                    push_values(&mut out, values);
                }
                FeatureColumn::Array(events) => {
                    out.push(b'a');
                    out.extend_from_slice(&(events.len() as u64).to_le_bytes());
                    for event in events {
                        if out.len() >= SAMPLE_BYTES {
                            break;
                        }
                        out.extend_from_slice(&(event.len() as u64).to_le_bytes());
                        push_values(&mut out, event);
                    }
                }
            }
        }
        out.truncate(SAMPLE_BYTES);
        out
    }
}

fn push_values(out: &mut Vec<u8>, values: &[f64]) {
    for v in values {
        if out.len() >= SAMPLE_BYTES {
            return;
        }
        out.extend_from_slice(&v.to_le_bytes());
    }
}

impl FeatureProvider for MemoryStore {
    fn location(&self) -> &str {
        &self.name
    }

    fn features(&self) -> Vec<(String, FeatureKind)> {
        self.columns
            .iter()
            .map(|(name, col)| (name.clone(), col.kind()))
            .collect()
    }

    fn kind(&self, name: &str) -> Option<FeatureKind> {
        self.columns.get(name).map(FeatureColumn::kind)
    }

    fn length(&self) -> Result<usize> {
        Ok(self.len)
    }

    fn feature_len(&self, name: &str) -> Result<usize> {
        Ok(self.require(name)?.len())
    }

    fn get(&self, name: &str, index: usize) -> Result<FeatureValue> {
        let column = self.require(name)?;
        column
            .get(index)
            .ok_or_else(|| out_of_range(name, index, column.len()))
    }

    fn scalars(&self, name: &str) -> Result<Vec<f64>> {
        match self.require(name)? {
            FeatureColumn::Scalar(v) => Ok(v.clone()),
            FeatureColumn::Array(_) => Err(Error::DataIntegrity(format!(
                "feature '{name}' is an array feature, not a scalar one"
            ))),
        }
    }

    fn identity(&self) -> Result<IdentitySource> {
        Ok(IdentitySource::Content {
            name: self.name.clone(),
            content: self.content_sample(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        let mut columns = BTreeMap::new();
        columns.insert("area_um".to_string(), FeatureColumn::Scalar(vec![1.0, 2.0, 3.0]));
        columns.insert(
            "trace".to_string(),
            FeatureColumn::Array(vec![vec![0.0; 4], vec![1.0; 4], vec![2.0; 4]]),
        );
        columns.insert("image".to_string(), FeatureColumn::Array(Vec::new()));
        MemoryStore::new("memory", columns).unwrap()
    }

    #[test]
    fn serves_declared_features() {
        let store = store();
        assert_eq!(store.length().unwrap(), 3);
        assert!(store.has("area_um"));
        assert_eq!(store.kind("trace"), Some(FeatureKind::Array));
        assert_eq!(store.get("area_um", 1).unwrap(), FeatureValue::Scalar(2.0));
        assert_eq!(store.get("trace", 2).unwrap(), FeatureValue::Array(vec![2.0; 4]));
        assert_eq!(store.feature_len("image").unwrap(), 0);
    }

    #[test]
    fn access_is_authoritative() {
        let store = store();
        assert!(matches!(store.get("deform", 0), Err(Error::FeatureNotFound(_))));
        assert!(matches!(store.get("area_um", 3), Err(Error::IndexOutOfRange { .. })));
        assert!(matches!(store.scalars("trace"), Err(Error::DataIntegrity(_))));
    }

    #[test]
    fn mismatched_columns_are_rejected() {
        let mut columns = BTreeMap::new();
        columns.insert("a".to_string(), FeatureColumn::Scalar(vec![1.0, 2.0]));
        columns.insert("b".to_string(), FeatureColumn::Scalar(vec![1.0]));
        assert!(matches!(
            MemoryStore::new("bad", columns),
            Err(Error::DataIntegrity(_))
        ));
    }

    fn identity_of(column: FeatureColumn) -> IdentitySource {
        let mut columns = BTreeMap::new();
        columns.insert("trace".to_string(), column);
        MemoryStore::new("m", columns).unwrap().identity().unwrap()
    }

    #[test]
    fn content_sample_sees_array_shape_and_kind() {
        let a = identity_of(FeatureColumn::Array(vec![vec![1.0, 2.0], vec![3.0]]));
        let b = identity_of(FeatureColumn::Array(vec![vec![1.0], vec![2.0, 3.0]]));
        assert_ne!(a, b);

        let scalar = identity_of(FeatureColumn::Scalar(vec![1.0, 2.0]));
        let array = identity_of(FeatureColumn::Array(vec![vec![1.0], vec![2.0]]));
        assert_ne!(scalar, array);
    }

    #[test]
    fn content_sample_is_bounded() {
        let mut columns = BTreeMap::new();
        columns.insert(
            "big".to_string(),
            FeatureColumn::Scalar(vec![1.5; SAMPLE_BYTES / 4]),
        );
        let store = MemoryStore::new("big", columns).unwrap();
        assert_eq!(store.content_sample().len(), SAMPLE_BYTES);
    }
}

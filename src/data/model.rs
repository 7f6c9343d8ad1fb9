use std::fmt;

// ---------------------------------------------------------------------------
// FeatureKind / FeatureValue – one event of one feature
// ---------------------------------------------------------------------------

/// Whether a feature holds one number per event or an array per event
/// (image, contour, fluorescence trace).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureKind {
    Scalar,
    Array,
}

impl fmt::Display for FeatureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureKind::Scalar => write!(f, "scalar"),
            FeatureKind::Array => write!(f, "array"),
        }
    }
}

/// The value of a feature for a single event.
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureValue {
    Scalar(f64),
    /// Flattened array data; the shape is a property of the store.
    Array(Vec<f64>),
}

impl FeatureValue {
    pub fn kind(&self) -> FeatureKind {
        match self {
            FeatureValue::Scalar(_) => FeatureKind::Scalar,
            FeatureValue::Array(_) => FeatureKind::Array,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FeatureValue::Scalar(v) => Some(*v),
            FeatureValue::Array(_) => None,
        }
    }

    pub fn as_slice(&self) -> Option<&[f64]> {
        match self {
            FeatureValue::Array(v) => Some(v),
            FeatureValue::Scalar(_) => None,
        }
    }
}

impl fmt::Display for FeatureValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureValue::Scalar(v) => write!(f, "{v}"),
            FeatureValue::Array(v) => write!(f, "<array of {}>", v.len()),
        }
    }
}

// ---------------------------------------------------------------------------
// FeatureColumn – all events of one feature, held in memory
// ---------------------------------------------------------------------------

/// In-memory storage for one feature.
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureColumn {
    Scalar(Vec<f64>),
    Array(Vec<Vec<f64>>),
}

impl FeatureColumn {
    pub fn kind(&self) -> FeatureKind {
        match self {
            FeatureColumn::Scalar(_) => FeatureKind::Scalar,
            FeatureColumn::Array(_) => FeatureKind::Array,
        }
    }

    /// Number of events.
    pub fn len(&self) -> usize {
        match self {
            FeatureColumn::Scalar(v) => v.len(),
            FeatureColumn::Array(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<FeatureValue> {
        match self {
            FeatureColumn::Scalar(v) => v.get(index).copied().map(FeatureValue::Scalar),
            FeatureColumn::Array(v) => v.get(index).cloned().map(FeatureValue::Array),
        }
    }

    /// Append one event. Fails if the value kind does not match the column.
    pub fn push(&mut self, value: FeatureValue) -> Result<(), FeatureValue> {
        match (self, value) {
            (FeatureColumn::Scalar(col), FeatureValue::Scalar(v)) => col.push(v),
            (FeatureColumn::Array(col), FeatureValue::Array(v)) => col.push(v),
            (_, value) => return Err(value),
        }
        Ok(())
    }

    /// An empty column of the given kind.
    pub fn empty(kind: FeatureKind) -> Self {
        match kind {
            FeatureKind::Scalar => FeatureColumn::Scalar(Vec::new()),
            FeatureKind::Array => FeatureColumn::Array(Vec::new()),
        }
    }
}

impl From<Vec<f64>> for FeatureColumn {
    fn from(values: Vec<f64>) -> Self {
        FeatureColumn::Scalar(values)
    }
}

impl From<Vec<Vec<f64>>> for FeatureColumn {
    fn from(values: Vec<Vec<f64>>) -> Self {
        FeatureColumn::Array(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_rejects_mismatched_kind() {
        let mut col = FeatureColumn::empty(FeatureKind::Scalar);
        col.push(FeatureValue::Scalar(1.0)).unwrap();
        assert!(col.push(FeatureValue::Array(vec![1.0])).is_err());
        assert_eq!(col.len(), 1);
        assert_eq!(col.get(0), Some(FeatureValue::Scalar(1.0)));
        assert_eq!(col.get(1), None);
    }
}

#![allow(dead_code)]

use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use rusty_rtdc::{Dataset, ExportOptions, FeatureColumn, RemoteTransport};

/// `area_um = 1.5 * i`, `deform = (i % 10) / 100`, `trace = [i; 4]`.
pub fn columns(n: usize) -> BTreeMap<String, FeatureColumn> {
    let mut columns = BTreeMap::new();
    columns.insert(
        "area_um".to_string(),
        FeatureColumn::from((0..n).map(|i| i as f64 * 1.5).collect::<Vec<_>>()),
    );
    columns.insert(
        "deform".to_string(),
        FeatureColumn::from((0..n).map(|i| (i % 10) as f64 / 100.0).collect::<Vec<_>>()),
    );
    columns.insert(
        "trace".to_string(),
        FeatureColumn::from((0..n).map(|i| vec![i as f64; 4]).collect::<Vec<_>>()),
    );
    columns
}

pub fn dataset(n: usize) -> Dataset {
    Dataset::from_columns("synthetic", columns(n)).unwrap()
}

/// Write selected columns of a synthetic dataset as an unfiltered Parquet file.
pub fn write_parquet(
    path: &Path,
    n: usize,
    features: &[&str],
    basins: Vec<rusty_rtdc::BasinDefinition>,
) -> PathBuf {
    let ds = dataset(n);
    let options = ExportOptions {
        filtered: false,
        overwrite: true,
        basins,
    };
    ds.export().parquet(path, features, &options).unwrap()
}

/// Serves fixed payloads by URL and counts fetches.
#[derive(Default)]
pub struct MockTransport {
    pub payloads: HashMap<String, Vec<u8>>,
    pub fetches: Cell<usize>,
}

impl MockTransport {
    pub fn serve(mut self, url: &str, file: &Path) -> Self {
        self.payloads
            .insert(url.to_string(), std::fs::read(file).unwrap());
        self
    }
}

impl RemoteTransport for MockTransport {
    fn fetch(&self, url: &str) -> anyhow::Result<Vec<u8>> {
        self.fetches.set(self.fetches.get() + 1);
        self.payloads
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("404 Not Found: {url}"))
    }
}

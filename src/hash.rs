//! Dataset identity: a fingerprint from the store name and a bounded sample
//! of its content.
//!
//! Only the first [`BLOCK_COUNT`] blocks of [`BLOCK_SIZE`] bytes are read, so
//! two stores that differ only beyond that point share a fingerprint.

use std::cell::OnceCell;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use log::debug;
use sha2::{Digest, Sha256};

use crate::error::Result;

pub const BLOCK_SIZE: usize = 65536;
pub const BLOCK_COUNT: usize = 20;
/// Upper bound on the content bytes that enter a fingerprint.
pub const SAMPLE_BYTES: usize = BLOCK_SIZE * BLOCK_COUNT;

/// What a store offers to be fingerprinted.
#[derive(Debug, Clone, PartialEq)]
pub enum IdentitySource {
    /// A file on disk; its name and leading blocks are hashed.
    File(PathBuf),
    /// Content already in memory (in-memory stores, fetched remote data).
    Content { name: String, content: Vec<u8> },
}

/// Hex SHA-256 of at most `count` blocks of `blocksize` bytes of a file.
pub fn hash_file(path: &Path, blocksize: usize, count: usize) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; blocksize];
    for _ in 0..count {
        let n = read_block(&mut file, &mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        if n < blocksize {
            break;
        }
    }
    Ok(hex::encode(hasher.finalize()))
}

// `read` may return short counts before EOF.
fn read_block(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// Hex SHA-256 of a byte slice, truncated to [`SAMPLE_BYTES`].
pub fn hash_bytes(content: &[u8]) -> String {
    let end = content.len().min(SAMPLE_BYTES);
    hex::encode(Sha256::digest(&content[..end]))
}

/// Combine a display name and a content digest into the final token.
fn combine(name: &str, digest: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update([0u8]);
    hasher.update(digest.as_bytes());
    hex::encode(hasher.finalize())
}

/// Compute the identity token for a source.
pub fn identity_hash(source: &IdentitySource) -> Result<String> {
    match source {
        IdentitySource::File(path) => {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let digest = hash_file(path, BLOCK_SIZE, BLOCK_COUNT)?;
            Ok(combine(&name, &digest))
        }
        IdentitySource::Content { name, content } => Ok(combine(name, &hash_bytes(content))),
    }
}

// ---------------------------------------------------------------------------
// IdentityHasher – lazily computed, cached token
// ---------------------------------------------------------------------------

/// Computes the identity token once and hands out the cached value after.
#[derive(Debug, Default)]
pub struct IdentityHasher {
    token: OnceCell<String>,
}

impl IdentityHasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached token, computing it from `source` on first use.
    ///
    /// A failed computation is not cached.
    pub fn get_or_compute<F>(&self, source: F) -> Result<&str>
    where
        F: FnOnce() -> Result<IdentitySource>,
    {
        if let Some(token) = self.token.get() {
            return Ok(token);
        }
        let token = identity_hash(&source()?)?;
        debug!("Computed dataset identity {token}");
        Ok(self.token.get_or_init(|| token))
    }

    pub fn cached(&self) -> Option<&str> {
        self.token.get().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn file_hash_ignores_content_past_the_sample() {
        let dir = tempfile::TempDir::new().unwrap();
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin");
        let mut content = vec![7u8; 3 * 16];
        std::fs::write(&a, &content).unwrap();
        content.extend_from_slice(b"tail");
        std::fs::write(&b, &content).unwrap();

        assert_eq!(hash_file(&a, 16, 3).unwrap(), hash_file(&b, 16, 3).unwrap());
        assert_ne!(hash_file(&a, 16, 4).unwrap(), hash_file(&b, 16, 4).unwrap());
    }

    #[test]
    fn name_and_content_both_matter() {
        let dir = tempfile::TempDir::new().unwrap();
        let a = dir.path().join("a.parquet");
        let b = dir.path().join("b.parquet");
        std::fs::File::create(&a).unwrap().write_all(b"same").unwrap();
        std::fs::File::create(&b).unwrap().write_all(b"same").unwrap();

        let ha = identity_hash(&IdentitySource::File(a)).unwrap();
        let hb = identity_hash(&IdentitySource::File(b)).unwrap();
        assert_ne!(ha, hb);
        assert_eq!(ha.len(), 64);

        let c1 = IdentitySource::Content { name: "x".into(), content: vec![1, 2] };
        let c2 = IdentitySource::Content { name: "x".into(), content: vec![1, 3] };
        assert_ne!(identity_hash(&c1).unwrap(), identity_hash(&c2).unwrap());
    }

    #[test]
    fn hasher_caches_first_result() {
        let hasher = IdentityHasher::new();
        let first = hasher
            .get_or_compute(|| Ok(IdentitySource::Content { name: "a".into(), content: vec![1] }))
            .unwrap()
            .to_string();
        let second = hasher
            .get_or_compute(|| Ok(IdentitySource::Content { name: "b".into(), content: vec![2] }))
            .unwrap();
        assert_eq!(first, second);
    }
}

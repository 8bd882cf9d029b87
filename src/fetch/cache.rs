//! Content-addressed download cache: `<root>/objects/<sha256>`.
//!
//! Objects are written to a temp file in the same directory and renamed into
//! place, so concurrent readers never see a partial object.

use super::FetchedArtifact;
use crate::tripwire::hasher::{normalize_checksum, sha256_file};
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct DownloadCache {
    root: PathBuf,
}

impl DownloadCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn objects(&self) -> PathBuf {
        self.root.join("objects")
    }

    /// Staging directory for in-flight downloads (same filesystem as objects).
    pub fn staging(&self) -> io::Result<PathBuf> {
        let dir = self.root.join("tmp");
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Path of a cached object, if present.
    pub fn get(&self, checksum: &str) -> Option<PathBuf> {
        let key = normalize_checksum(checksum);
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        let path = self.objects().join(key);
        path.is_file().then_some(path)
    }

    /// Move a staged file into the cache under its SHA-256.
    pub fn insert(&self, staged: tempfile::NamedTempFile) -> io::Result<FetchedArtifact> {
        let (checksum, size) = sha256_file(staged.path())?;
        let objects = self.objects();
        std::fs::create_dir_all(&objects)?;
        let target = objects.join(&checksum);
        if target.is_file() {
            debug!(%checksum, "object already cached");
        } else {
            staged.persist(&target).map_err(|e| e.error)?;
        }
        Ok(FetchedArtifact {
            path: target,
            checksum,
            size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tripwire::hasher::sha256_bytes;
    use std::io::Write;

    #[test]
    fn test_kl050_insert_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DownloadCache::new(dir.path());
        let mut staged = tempfile::NamedTempFile::new_in(cache.staging().unwrap()).unwrap();
        staged.write_all(b"payload").unwrap();

        let art = cache.insert(staged).unwrap();
        assert_eq!(art.checksum, sha256_bytes(b"payload"));
        assert_eq!(art.size, 7);
        assert_eq!(std::fs::read(&art.path).unwrap(), b"payload");
        assert_eq!(cache.get(&format!("sha256:{}", art.checksum)), Some(art.path));
    }

    #[test]
    fn test_kl050_get_rejects_non_hex_keys() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DownloadCache::new(dir.path());
        assert!(cache.get("../../etc/passwd").is_none());
        assert!(cache.get("").is_none());
        assert!(cache.get(&sha256_bytes(b"absent")).is_none());
    }
}

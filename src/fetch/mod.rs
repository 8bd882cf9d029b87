//! KL-050: Artifact fetching.
//!
//! Generation fetches every download step once to record its checksum and
//! size; execution fetches again and compares. Both go through [`Downloader`].

pub mod cache;
pub mod http;

use crate::core::error::FetchError;
use std::path::PathBuf;

/// A fetched artifact on local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedArtifact {
    pub path: PathBuf,
    /// SHA-256, lowercase hex
    pub checksum: String,
    pub size: u64,
}

/// Fetches URLs to local files.
pub trait Downloader {
    /// Fetch `url`. When `expected` is given, an already cached object with
    /// that checksum may be returned instead of going to the network.
    fn fetch(&self, url: &str, expected: Option<&str>) -> Result<FetchedArtifact, FetchError>;
}

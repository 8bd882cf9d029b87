//! HTTP(S) and `file://` downloader backed by the content cache.

use super::cache::DownloadCache;
use super::{Downloader, FetchedArtifact};
use crate::core::error::{FetchError, NetworkErrorKind};
use crate::tripwire::hasher::sha256_file;
use std::time::Duration;
use tracing::{debug, info};

/// Map a reqwest failure to a network class.
pub(crate) fn classify_reqwest_error(e: &reqwest::Error) -> NetworkErrorKind {
    let mut chain = e.to_string();
    let mut source = std::error::Error::source(e);
    while let Some(s) = source {
        chain.push_str(": ");
        chain.push_str(&s.to_string());
        source = s.source();
    }
    let chain = chain.to_ascii_lowercase();
    if e.is_timeout() {
        NetworkErrorKind::Timeout
    } else if chain.contains("dns") || chain.contains("resolve") {
        NetworkErrorKind::Dns
    } else if chain.contains("certificate") || chain.contains("tls") {
        NetworkErrorKind::Tls
    } else if e.is_connect() {
        NetworkErrorKind::Connection
    } else {
        NetworkErrorKind::Other
    }
}

pub struct HttpDownloader {
    cache: DownloadCache,
    timeout: Duration,
}

impl HttpDownloader {
    pub fn new(cache: DownloadCache, timeout: Duration) -> Self {
        Self { cache, timeout }
    }

    fn io(context: String) -> impl FnOnce(std::io::Error) -> FetchError {
        move |source| FetchError::Io { context, source }
    }

    fn download(&self, url: &str) -> Result<FetchedArtifact, FetchError> {
        let staging = self
            .cache
            .staging()
            .map_err(Self::io(format!("create staging dir in {}", self.cache.root().display())))?;
        let mut staged = tempfile::NamedTempFile::new_in(&staging)
            .map_err(Self::io(format!("create temp file in {}", staging.display())))?;

        if let Some(path) = url.strip_prefix("file://") {
            let mut src = std::fs::File::open(path).map_err(Self::io(format!("open {}", path)))?;
            std::io::copy(&mut src, staged.as_file_mut())
                .map_err(Self::io(format!("copy {}", path)))?;
        } else if url.starts_with("https://") || url.starts_with("http://") {
            let network = |e: reqwest::Error| FetchError::Network {
                url: url.to_string(),
                kind: classify_reqwest_error(&e),
                message: e.to_string(),
            };
            let client = reqwest::blocking::Client::builder()
                .connect_timeout(self.timeout)
                .timeout(self.timeout)
                .user_agent(concat!("kiln/", env!("CARGO_PKG_VERSION")))
                .build()
                .map_err(network)?;
            let mut response = client.get(url).send().map_err(network)?;
            let status = response.status();
            if !status.is_success() {
                return Err(FetchError::Http {
                    url: url.to_string(),
                    status: status.as_u16(),
                });
            }
            response.copy_to(staged.as_file_mut()).map_err(network)?;
        } else {
            return Err(FetchError::UnsupportedScheme {
                url: url.to_string(),
            });
        }

        let art = self
            .cache
            .insert(staged)
            .map_err(Self::io(format!("store download of {}", url)))?;
        info!(url, checksum = %art.checksum, size = art.size, "downloaded");
        Ok(art)
    }
}

impl Downloader for HttpDownloader {
    fn fetch(&self, url: &str, expected: Option<&str>) -> Result<FetchedArtifact, FetchError> {
        if let Some(path) = expected.and_then(|sum| self.cache.get(sum)) {
            let (checksum, size) =
                sha256_file(&path).map_err(Self::io(format!("read {}", path.display())))?;
            debug!(url, %checksum, "download cache hit");
            return Ok(FetchedArtifact {
                path,
                checksum,
                size,
            });
        }
        self.download(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tripwire::hasher::sha256_bytes;

    fn downloader(dir: &std::path::Path) -> HttpDownloader {
        HttpDownloader::new(DownloadCache::new(dir.join("cache")), Duration::from_secs(2))
    }

    #[test]
    fn test_kl050_file_url() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("tool.tar.gz");
        std::fs::write(&src, b"archive bytes").unwrap();
        let d = downloader(dir.path());

        let art = d.fetch(&format!("file://{}", src.display()), None).unwrap();
        assert_eq!(art.checksum, sha256_bytes(b"archive bytes"));
        assert_eq!(art.size, 13);
        assert!(art.path.starts_with(dir.path().join("cache/objects")));
    }

    #[test]
    fn test_kl050_cache_hit_by_expected_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.bin");
        std::fs::write(&src, b"v1").unwrap();
        let d = downloader(dir.path());
        let url = format!("file://{}", src.display());
        let first = d.fetch(&url, None).unwrap();

        std::fs::remove_file(&src).unwrap();
        let again = d.fetch(&url, Some(&first.checksum)).unwrap();
        assert_eq!(again, first);
        assert!(d.fetch(&url, None).is_err());
    }

    #[test]
    fn test_kl050_missing_file_and_bad_scheme() {
        let dir = tempfile::tempdir().unwrap();
        let d = downloader(dir.path());
        assert!(matches!(
            d.fetch("file:///definitely/not/here", None),
            Err(FetchError::Io { .. })
        ));
        assert!(matches!(
            d.fetch("ftp://example.com/x", None),
            Err(FetchError::UnsupportedScheme { .. })
        ));
    }

    #[test]
    fn test_kl050_connection_refused_is_network() {
        let dir = tempfile::tempdir().unwrap();
        let err = downloader(dir.path())
            .fetch("http://127.0.0.1:9/x.tar.gz", None)
            .unwrap_err();
        assert!(matches!(err, FetchError::Network { .. }), "{err}");
    }
}

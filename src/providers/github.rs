//! `github_releases` source: tags from the GitHub releases API.

use crate::core::error::{NetworkErrorKind, VersionError};
use crate::core::recipe::VersionSection;
use crate::core::version::{select_best, strip_v, ResolvedVersion, VersionProvider};
use crate::fetch::http::classify_reqwest_error;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

const SOURCE: &str = "github_releases";

/// Subset of the release object we read.
#[derive(Debug, Clone, Deserialize)]
pub struct Release {
    pub tag_name: String,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub prerelease: bool,
}

pub struct GitHubReleasesProvider {
    api_url: String,
    timeout: Duration,
}

impl GitHubReleasesProvider {
    pub fn new(api_url: &str, timeout: Duration) -> Self {
        Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            timeout,
        }
    }

    fn network(kind: NetworkErrorKind, message: impl Into<String>) -> VersionError {
        VersionError::Network {
            source_name: SOURCE.to_string(),
            kind,
            message: message.into(),
        }
    }

    fn fetch_releases(&self, repo: &str) -> Result<Vec<Release>, VersionError> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(self.timeout)
            .timeout(self.timeout)
            .build()
            .map_err(|e| Self::network(NetworkErrorKind::Other, e.to_string()))?;
        let endpoint = format!("{}/repos/{}/releases?per_page=100", self.api_url, repo);
        debug!(%endpoint, "listing releases");

        let mut request = client
            .get(&endpoint)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", concat!("kiln/", env!("CARGO_PKG_VERSION")))
            .header("X-GitHub-Api-Version", "2022-11-28");
        if let Ok(token) = std::env::var("GITHUB_TOKEN") {
            if !token.trim().is_empty() {
                request = request.bearer_auth(token.trim());
            }
        }
        let response = request
            .send()
            .map_err(|e| Self::network(classify_reqwest_error(&e), e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 403 || status.as_u16() == 429 {
            return Err(Self::network(
                NetworkErrorKind::RateLimit,
                format!("HTTP {} from {}", status.as_u16(), endpoint),
            ));
        }
        if status.is_server_error() {
            return Err(Self::network(
                NetworkErrorKind::Other,
                format!("HTTP {} from {}", status.as_u16(), endpoint),
            ));
        }
        if !status.is_success() {
            return Err(VersionError::InvalidResponse {
                source_name: SOURCE.to_string(),
                message: format!("HTTP {} from {}", status.as_u16(), endpoint),
            });
        }
        response.json().map_err(|e| VersionError::InvalidResponse {
            source_name: SOURCE.to_string(),
            message: e.to_string(),
        })
    }
}

/// Pick the best release for a constraint, keeping the upstream tag.
pub fn pick_release(
    releases: &[Release],
    tag_prefix: Option<&str>,
    constraint: &str,
) -> Option<ResolvedVersion> {
    let candidates: Vec<(String, &str)> = releases
        .iter()
        .filter(|r| !r.draft)
        .filter_map(|r| {
            let version = match tag_prefix {
                Some(prefix) => r.tag_name.strip_prefix(prefix)?,
                None => strip_v(&r.tag_name),
            };
            Some((version.to_string(), r.tag_name.as_str()))
        })
        .collect();
    let best = select_best(candidates.iter().map(|(v, _)| v.as_str()), constraint)?;
    let (version, tag) = candidates.iter().find(|(v, _)| v == best)?;
    Some(ResolvedVersion {
        version: version.clone(),
        tag: tag.to_string(),
    })
}

impl VersionProvider for GitHubReleasesProvider {
    fn resolve(
        &self,
        section: &VersionSection,
        tool: &str,
        constraint: &str,
    ) -> Result<ResolvedVersion, VersionError> {
        let repo = section
            .github_repo
            .as_deref()
            .filter(|r| r.contains('/'))
            .ok_or_else(|| VersionError::Misconfigured {
                tool: tool.to_string(),
                message: "github_releases requires github_repo = \"owner/name\"".into(),
            })?;
        let releases = self.fetch_releases(repo)?;
        pick_release(&releases, section.tag_prefix.as_deref(), constraint).ok_or_else(|| {
            VersionError::NoMatch {
                tool: tool.to_string(),
                constraint: constraint.to_string(),
            }
        })
    }
}

//! KL-041: Built-in version providers.

pub mod github;
pub mod static_list;

use crate::core::version::VersionResolver;
use std::time::Duration;

/// Resolver with every built-in provider registered.
pub fn builtin_resolver(github_api_url: &str, timeout: Duration) -> VersionResolver {
    VersionResolver::new()
        .with_provider("static", Box::new(static_list::StaticProvider))
        .with_provider(
            "github_releases",
            Box::new(github::GitHubReleasesProvider::new(github_api_url, timeout)),
        )
}

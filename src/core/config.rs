//! KL-011: Settings — `$KILN_HOME/config.yaml` plus environment overrides.
//!
//! Every field is optional; relative paths resolve against the kiln home.

use super::error::KilnError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_GITHUB_API: &str = "https://api.github.com";
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;
const CONFIG_FILE: &str = "config.yaml";

/// On-disk form of `config.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SettingsFile {
    pub recipes_dirs: Vec<PathBuf>,
    pub state_dir: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub tools_dir: Option<PathBuf>,
    pub work_dir: Option<PathBuf>,
    pub github_api_url: Option<String>,
    pub http_timeout_secs: Option<u64>,
}

/// Effective settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub home: PathBuf,
    pub recipes_dirs: Vec<PathBuf>,
    /// Installed-tool state locks and event logs
    pub state_dir: PathBuf,
    /// Content-addressed download cache
    pub cache_dir: PathBuf,
    /// Install roots, one per `(tool, version)`
    pub tools_dir: PathBuf,
    /// Parent of per-attempt scratch directories
    pub work_dir: PathBuf,
    pub github_api_url: String,
    pub http_timeout: Duration,
}

fn under(home: &Path, p: Option<PathBuf>, default: &str) -> PathBuf {
    match p {
        Some(p) if p.is_absolute() => p,
        Some(p) => home.join(p),
        None => home.join(default),
    }
}

impl Settings {
    /// Resolve a settings file against a home directory.
    pub fn resolve(home: &Path, file: SettingsFile) -> Self {
        let recipes_dirs = if file.recipes_dirs.is_empty() {
            vec![home.join("recipes")]
        } else {
            file.recipes_dirs
                .into_iter()
                .map(|p| under(home, Some(p), "recipes"))
                .collect()
        };
        Self {
            home: home.to_path_buf(),
            recipes_dirs,
            state_dir: under(home, file.state_dir, "state"),
            cache_dir: under(home, file.cache_dir, "cache"),
            tools_dir: under(home, file.tools_dir, "tools"),
            work_dir: under(home, file.work_dir, "work"),
            github_api_url: file
                .github_api_url
                .unwrap_or_else(|| DEFAULT_GITHUB_API.to_string()),
            http_timeout: Duration::from_secs(
                file.http_timeout_secs.unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS),
            ),
        }
    }

    /// Load using the process environment.
    pub fn load() -> Result<Self, KilnError> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    /// Load with an injectable environment lookup.
    pub fn load_with(env: impl Fn(&str) -> Option<String>) -> Result<Self, KilnError> {
        let home = match env("KILN_HOME").filter(|h| !h.is_empty()) {
            Some(h) => PathBuf::from(h),
            None => env("HOME")
                .filter(|h| !h.is_empty())
                .map(|h| PathBuf::from(h).join(".kiln"))
                .ok_or_else(|| {
                    KilnError::Config("cannot locate kiln home: set KILN_HOME or HOME".into())
                })?,
        };

        let path = home.join(CONFIG_FILE);
        let file = if path.is_file() {
            let content = std::fs::read_to_string(&path).map_err(|e| KilnError::io(&path, e))?;
            serde_yaml_ng::from_str(&content).map_err(|source| KilnError::ConfigFile {
                path: path.display().to_string(),
                source,
            })?
        } else {
            SettingsFile::default()
        };

        let mut settings = Self::resolve(&home, file);
        if let Some(dirs) = env("KILN_RECIPES").filter(|d| !d.is_empty()) {
            settings.recipes_dirs = dirs
                .split(':')
                .filter(|d| !d.is_empty())
                .map(PathBuf::from)
                .collect();
        }
        Ok(settings)
    }
}

//! KL-013: Installed-tool state — one YAML lock per `(tool, version)`.
//!
//! Layout: `<state>/<tool>/<version>/state.lock.yaml`. Saves are atomic
//! (temp file + rename) and replace any previous lock for the same pair.
//! Only a lock marks a version as installed; the plan cache keeps its own
//! `plan.json` next to it.

use super::error::StateError;
use super::types::{InstallationPlan, ToolState};
use crate::tripwire::eventlog::now_iso8601;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const STATE_SCHEMA: &str = "1.0";
const LOCK_FILE: &str = "state.lock.yaml";
const PLAN_FILE: &str = "plan.json";

/// Derive the lock file path for an installed tool version.
pub fn lock_file_path(state_dir: &Path, tool: &str, version: &str) -> PathBuf {
    state_dir.join(tool).join(version).join(LOCK_FILE)
}

/// Derive the cached plan path for a tool version.
pub fn plan_file_path(state_dir: &Path, tool: &str, version: &str) -> PathBuf {
    state_dir.join(tool).join(version).join(PLAN_FILE)
}

/// Write through a uniquely named sibling temp file, then rename over `path`.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StateError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(io_err(parent))?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(io_err(parent))?;
    tmp.write_all(contents).map_err(io_err(tmp.path()))?;
    tmp.persist(path).map_err(|e| StateError::Io {
        path: path.display().to_string(),
        source: e.error,
    })?;
    Ok(())
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StateError + '_ {
    move |source| StateError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load a lock. Returns None if the tool version isn't installed.
    pub fn load(&self, tool: &str, version: &str) -> Result<Option<ToolState>, StateError> {
        let path = lock_file_path(&self.dir, tool, version);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path).map_err(io_err(&path))?;
        let state: ToolState =
            serde_yaml_ng::from_str(&content).map_err(|e| StateError::Corrupt {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
        if state.schema != STATE_SCHEMA {
            return Err(StateError::Corrupt {
                path: path.display().to_string(),
                message: format!("unsupported schema '{}'", state.schema),
            });
        }
        Ok(Some(state))
    }

    /// Save a lock atomically, replacing any prior lock for the same pair.
    pub fn save(&self, state: &ToolState) -> Result<(), StateError> {
        let path = lock_file_path(&self.dir, &state.tool, &state.version);
        let yaml = serde_yaml_ng::to_string(state).map_err(|e| StateError::Corrupt {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        write_atomic(&path, yaml.as_bytes())
    }

    pub fn is_installed(&self, tool: &str, version: &str) -> bool {
        lock_file_path(&self.dir, tool, version).is_file()
    }

    /// All installed `(tool, version)` pairs, sorted.
    pub fn list_installed(&self) -> Result<Vec<(String, String)>, StateError> {
        let mut out = Vec::new();
        if !self.dir.is_dir() {
            return Ok(out);
        }
        for tool in std::fs::read_dir(&self.dir).map_err(io_err(&self.dir))? {
            let tool = tool.map_err(io_err(&self.dir))?;
            if !tool.path().is_dir() {
                continue;
            }
            let tool_path = tool.path();
            for version in std::fs::read_dir(&tool_path).map_err(io_err(&tool_path))? {
                let version = version.map_err(io_err(&tool_path))?;
                if version.path().join(LOCK_FILE).is_file() {
                    out.push((
                        tool.file_name().to_string_lossy().into_owned(),
                        version.file_name().to_string_lossy().into_owned(),
                    ));
                }
            }
        }
        out.sort();
        Ok(out)
    }
}

/// Build a fresh lock for a completed installation.
pub fn new_state(plan: &InstallationPlan, install_dir: &Path) -> ToolState {
    ToolState {
        schema: STATE_SCHEMA.to_string(),
        tool: plan.tool.clone(),
        version: plan.version.clone(),
        installed_at: now_iso8601(),
        generator: format!("kiln {}", env!("CARGO_PKG_VERSION")),
        install_dir: install_dir.display().to_string(),
        plan: plan.clone(),
    }
}

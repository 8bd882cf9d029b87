//! KL-030: Action catalog — closed set of primitive and composite actions.
//!
//! Every action is an [`ActionKind`] variant, and every variant declares its
//! [`Capabilities`] in one exhaustive match, so adding an action without
//! metadata fails to compile. Composites are expanded at generation time by
//! [`composite`]; primitives run at execution time through [`Action`].

pub mod archive;
pub mod composite;
pub mod files;
pub mod system;

use crate::core::error::ActionError;
use crate::core::types::{Params, Platform};
use std::path::{Component, Path, PathBuf};

/// Every action the installer knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ActionKind {
    // Primitives
    DownloadFile,
    Extract,
    Chmod,
    InstallBinaries,
    InstallLibraries,
    SetEnv,
    TextReplace,
    RunCommand,
    AptInstall,
    DnfInstall,
    ApkInstall,
    PacmanInstall,
    BrewInstall,
    CargoBuild,
    GoBuild,
    NpmExec,
    PipExec,
    // Composites
    Download,
    DownloadArchive,
    GithubArchive,
    GithubFile,
    CargoInstall,
    GoInstall,
    NpmInstall,
    PipxInstall,
}

/// Platform an action is inherently limited to (e.g. apt only on Debian).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImplicitConstraint {
    pub os: &'static str,
    pub linux_family: Option<&'static str>,
}

impl ImplicitConstraint {
    /// Absent target family is a wildcard.
    pub fn matches(&self, target: &Platform) -> bool {
        if target.os != self.os {
            return false;
        }
        match (self.linux_family, target.linux_family.as_deref()) {
            (Some(want), Some(have)) => want == have,
            _ => true,
        }
    }
}

/// Static metadata attached to each action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Expands into other actions at generation time
    pub composite: bool,
    /// Touches the network when executed
    pub requires_network: bool,
    /// Produces identical results on every run
    pub deterministic: bool,
    /// Fully reproducible from plan parameters alone
    pub evaluable: bool,
    /// Tools that must be installed before this action runs
    pub implicit_dependencies: &'static [&'static str],
    /// Host tools needed only to generate the plan
    pub eval_dependencies: &'static [&'static str],
    pub constraint: Option<ImplicitConstraint>,
}

impl Capabilities {
    /// Safe default: a local, deterministic, evaluable primitive.
    pub const PRIMITIVE: Capabilities = Capabilities {
        composite: false,
        requires_network: false,
        deterministic: true,
        evaluable: true,
        implicit_dependencies: &[],
        eval_dependencies: &[],
        constraint: None,
    };

    const COMPOSITE: Capabilities = Capabilities {
        composite: true,
        ..Capabilities::PRIMITIVE
    };

    const SYSTEM_PACKAGE: Capabilities = Capabilities {
        requires_network: true,
        deterministic: false,
        evaluable: false,
        ..Capabilities::PRIMITIVE
    };

    const ECOSYSTEM_BUILD: Capabilities = Capabilities {
        requires_network: true,
        deterministic: false,
        ..Capabilities::PRIMITIVE
    };
}

const fn on(os: &'static str, family: Option<&'static str>) -> Option<ImplicitConstraint> {
    Some(ImplicitConstraint {
        os,
        linux_family: family,
    })
}

impl ActionKind {
    pub const ALL: &'static [ActionKind] = &[
        ActionKind::DownloadFile,
        ActionKind::Extract,
        ActionKind::Chmod,
        ActionKind::InstallBinaries,
        ActionKind::InstallLibraries,
        ActionKind::SetEnv,
        ActionKind::TextReplace,
        ActionKind::RunCommand,
        ActionKind::AptInstall,
        ActionKind::DnfInstall,
        ActionKind::ApkInstall,
        ActionKind::PacmanInstall,
        ActionKind::BrewInstall,
        ActionKind::CargoBuild,
        ActionKind::GoBuild,
        ActionKind::NpmExec,
        ActionKind::PipExec,
        ActionKind::Download,
        ActionKind::DownloadArchive,
        ActionKind::GithubArchive,
        ActionKind::GithubFile,
        ActionKind::CargoInstall,
        ActionKind::GoInstall,
        ActionKind::NpmInstall,
        ActionKind::PipxInstall,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ActionKind::DownloadFile => "download_file",
            ActionKind::Extract => "extract",
            ActionKind::Chmod => "chmod",
            ActionKind::InstallBinaries => "install_binaries",
            ActionKind::InstallLibraries => "install_libraries",
            ActionKind::SetEnv => "set_env",
            ActionKind::TextReplace => "text_replace",
            ActionKind::RunCommand => "run_command",
            ActionKind::AptInstall => "apt_install",
            ActionKind::DnfInstall => "dnf_install",
            ActionKind::ApkInstall => "apk_install",
            ActionKind::PacmanInstall => "pacman_install",
            ActionKind::BrewInstall => "brew_install",
            ActionKind::CargoBuild => "cargo_build",
            ActionKind::GoBuild => "go_build",
            ActionKind::NpmExec => "npm_exec",
            ActionKind::PipExec => "pip_exec",
            ActionKind::Download => "download",
            ActionKind::DownloadArchive => "download_archive",
            ActionKind::GithubArchive => "github_archive",
            ActionKind::GithubFile => "github_file",
            ActionKind::CargoInstall => "cargo_install",
            ActionKind::GoInstall => "go_install",
            ActionKind::NpmInstall => "npm_install",
            ActionKind::PipxInstall => "pipx_install",
        }
    }

    pub fn from_name(name: &str) -> Option<ActionKind> {
        Self::ALL.iter().copied().find(|k| k.name() == name)
    }

    pub fn is_composite(self) -> bool {
        self.capabilities().composite
    }

    pub fn capabilities(self) -> Capabilities {
        use ActionKind::*;
        match self {
            DownloadFile => Capabilities {
                requires_network: true,
                ..Capabilities::PRIMITIVE
            },
            Extract | Chmod | InstallBinaries | InstallLibraries | SetEnv | TextReplace => {
                Capabilities::PRIMITIVE
            }
            RunCommand => Capabilities {
                deterministic: false,
                evaluable: false,
                ..Capabilities::PRIMITIVE
            },
            AptInstall => Capabilities {
                constraint: on("linux", Some("debian")),
                ..Capabilities::SYSTEM_PACKAGE
            },
            DnfInstall => Capabilities {
                constraint: on("linux", Some("rhel")),
                ..Capabilities::SYSTEM_PACKAGE
            },
            ApkInstall => Capabilities {
                constraint: on("linux", Some("alpine")),
                ..Capabilities::SYSTEM_PACKAGE
            },
            PacmanInstall => Capabilities {
                constraint: on("linux", Some("arch")),
                ..Capabilities::SYSTEM_PACKAGE
            },
            BrewInstall => Capabilities {
                constraint: on("darwin", None),
                ..Capabilities::SYSTEM_PACKAGE
            },
            CargoBuild => Capabilities {
                implicit_dependencies: &["rust"],
                ..Capabilities::ECOSYSTEM_BUILD
            },
            GoBuild => Capabilities {
                implicit_dependencies: &["go"],
                ..Capabilities::ECOSYSTEM_BUILD
            },
            NpmExec => Capabilities {
                implicit_dependencies: &["nodejs"],
                ..Capabilities::ECOSYSTEM_BUILD
            },
            PipExec => Capabilities {
                implicit_dependencies: &["python-standalone"],
                ..Capabilities::ECOSYSTEM_BUILD
            },
            Download | DownloadArchive | GithubArchive | GithubFile | CargoInstall | GoInstall => {
                Capabilities::COMPOSITE
            }
            NpmInstall => Capabilities {
                eval_dependencies: &["nodejs"],
                ..Capabilities::COMPOSITE
            },
            PipxInstall => Capabilities {
                eval_dependencies: &["python-standalone"],
                ..Capabilities::COMPOSITE
            },
        }
    }

    /// Platform constraint check; unconstrained actions match everywhere.
    pub fn allowed_on(self, target: &Platform) -> bool {
        self.capabilities()
            .constraint
            .is_none_or(|c| c.matches(target))
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Execution contract
// ============================================================================

/// Everything a primitive needs at execution time.
#[derive(Debug, Clone)]
pub struct ExecContext {
    pub tool: String,
    pub version: String,
    pub platform: Platform,
    /// Private per-attempt scratch directory
    pub work_dir: PathBuf,
    /// Final install location for this tool
    pub install_dir: PathBuf,
    /// Bin dirs of already-installed dependencies, prepended to PATH
    pub search_path: Vec<PathBuf>,
}

/// A primitive's execution contract.
pub trait Action {
    fn execute(&self, ctx: &ExecContext, params: &Params) -> Result<(), ActionError>;
}

/// Lookup of primitive implementations.
pub trait ActionRegistry {
    fn get(&self, kind: ActionKind) -> Option<&dyn Action>;
}

/// The built-in primitive implementations. Downloads are handled by the
/// executor itself, so `download_file` has no entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinActions;

impl ActionRegistry for BuiltinActions {
    fn get(&self, kind: ActionKind) -> Option<&dyn Action> {
        use ActionKind::*;
        let action: &dyn Action = match kind {
            Extract => &archive::Extract,
            Chmod => &files::Chmod,
            InstallBinaries => &files::InstallBinaries,
            InstallLibraries => &files::InstallLibraries,
            SetEnv => &files::SetEnv,
            TextReplace => &files::TextReplace,
            RunCommand => &system::RunCommand,
            AptInstall | DnfInstall | ApkInstall | PacmanInstall | BrewInstall => {
                system::package_manager(kind)?
            }
            CargoBuild | GoBuild | NpmExec | PipExec => system::ecosystem(kind)?,
            DownloadFile | Download | DownloadArchive | GithubArchive | GithubFile
            | CargoInstall | GoInstall | NpmInstall | PipxInstall => return None,
        };
        Some(action)
    }
}

// ============================================================================
// Parameter helpers
// ============================================================================

pub(crate) fn str_param<'a>(params: &'a Params, key: &str) -> Result<&'a str, ActionError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ActionError::MissingParam {
            param: key.to_string(),
        })
}

pub(crate) fn opt_str<'a>(params: &'a Params, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| v.as_str())
}

/// A string or list of strings.
pub(crate) fn str_list(params: &Params, key: &str) -> Result<Vec<String>, ActionError> {
    match params.get(key) {
        None => Err(ActionError::MissingParam {
            param: key.to_string(),
        }),
        Some(serde_json::Value::String(s)) => Ok(vec![s.clone()]),
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| ActionError::InvalidParam {
                        param: key.to_string(),
                        reason: "expected a list of strings".into(),
                    })
            })
            .collect(),
        Some(_) => Err(ActionError::InvalidParam {
            param: key.to_string(),
            reason: "expected a string or list of strings".into(),
        }),
    }
}

pub(crate) fn u64_param(params: &Params, key: &str, default: u64) -> Result<u64, ActionError> {
    match params.get(key) {
        None => Ok(default),
        Some(v) => v
            .as_u64()
            .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
            .ok_or_else(|| ActionError::InvalidParam {
                param: key.to_string(),
                reason: "expected a non-negative integer".into(),
            }),
    }
}

/// Resolve a relative path under `base`, refusing absolute paths and `..`.
pub(crate) fn contained(base: &Path, rel: &str, param: &str) -> Result<PathBuf, ActionError> {
    let path = Path::new(rel);
    let safe = path
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if rel.is_empty() || !safe {
        return Err(ActionError::InvalidParam {
            param: param.to_string(),
            reason: format!("path '{}' escapes the working directory", rel),
        });
    }
    Ok(base.join(path))
}

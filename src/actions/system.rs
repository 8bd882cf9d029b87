//! KL-034: Shell-backed primitives — run_command, system package managers,
//! and language ecosystem installers.
//!
//! Each action renders an idempotent bash script and runs it through the
//! local transport with the work dir as cwd and dependency bin dirs on PATH.

use super::{str_list, str_param, Action, ActionKind, ExecContext};
use crate::core::error::ActionError;
use crate::core::types::Params;
use crate::transport::local::{exec_local, shell_quote};

/// Run a rendered script for a step.
pub fn run_script(script: &str, ctx: &ExecContext) -> Result<(), ActionError> {
    std::fs::create_dir_all(&ctx.work_dir)
        .map_err(|e| ActionError::io(format!("create {}", ctx.work_dir.display()), e))?;
    let mut path_parts: Vec<String> = ctx
        .search_path
        .iter()
        .map(|p| p.to_string_lossy().to_string())
        .collect();
    if let Ok(existing) = std::env::var("PATH") {
        path_parts.push(existing);
    }
    let env = [
        ("PATH", path_parts.join(":")),
        ("KILN_TOOL", ctx.tool.clone()),
        ("KILN_VERSION", ctx.version.clone()),
        ("KILN_INSTALL_DIR", ctx.install_dir.to_string_lossy().to_string()),
        ("KILN_WORK_DIR", ctx.work_dir.to_string_lossy().to_string()),
    ];
    let out = exec_local(script, Some(&ctx.work_dir), &env)
        .map_err(|e| ActionError::io("spawn bash", e))?;
    if !out.success() {
        return Err(ActionError::Command {
            exit_code: out.exit_code,
            stderr: out.stderr_tail(20),
        });
    }
    Ok(())
}

/// `run_command`: arbitrary shell in the work dir.
#[derive(Debug, Clone, Copy)]
pub struct RunCommand;

impl Action for RunCommand {
    fn execute(&self, ctx: &ExecContext, params: &Params) -> Result<(), ActionError> {
        let command = str_param(params, "command")?;
        run_script(&format!("set -euo pipefail\n{}", command), ctx)
    }
}

// ============================================================================
// System package managers
// ============================================================================

/// System package manager step (apt, dnf, apk, pacman, brew).
#[derive(Debug, Clone, Copy)]
pub struct PackageManager {
    kind: ActionKind,
}

static APT: PackageManager = PackageManager {
    kind: ActionKind::AptInstall,
};
static DNF: PackageManager = PackageManager {
    kind: ActionKind::DnfInstall,
};
static APK: PackageManager = PackageManager {
    kind: ActionKind::ApkInstall,
};
static PACMAN: PackageManager = PackageManager {
    kind: ActionKind::PacmanInstall,
};
static BREW: PackageManager = PackageManager {
    kind: ActionKind::BrewInstall,
};

pub fn package_manager(kind: ActionKind) -> Option<&'static dyn Action> {
    let pm: &'static PackageManager = match kind {
        ActionKind::AptInstall => &APT,
        ActionKind::DnfInstall => &DNF,
        ActionKind::ApkInstall => &APK,
        ActionKind::PacmanInstall => &PACMAN,
        ActionKind::BrewInstall => &BREW,
        _ => return None,
    };
    Some(pm)
}

/// `(presence check, install command)` for a package manager.
fn package_commands(kind: ActionKind) -> Option<(&'static str, &'static str)> {
    Some(match kind {
        ActionKind::AptInstall => (
            "dpkg -s \"$pkg\" >/dev/null 2>&1",
            "apt-get update -qq\nDEBIAN_FRONTEND=noninteractive apt-get install -y -qq",
        ),
        ActionKind::DnfInstall => ("rpm -q \"$pkg\" >/dev/null 2>&1", "dnf install -y -q"),
        ActionKind::ApkInstall => ("apk info -e \"$pkg\" >/dev/null 2>&1", "apk add --no-cache"),
        ActionKind::PacmanInstall => (
            "pacman -Q \"$pkg\" >/dev/null 2>&1",
            "pacman -S --noconfirm --needed",
        ),
        ActionKind::BrewInstall => ("brew list --formula \"$pkg\" >/dev/null 2>&1", "brew install"),
        _ => return None,
    })
}

/// Render the install script for system packages.
pub fn package_script(kind: ActionKind, packages: &[String]) -> Option<String> {
    let (check, install) = package_commands(kind)?;
    let joined = packages
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ");
    Some(format!(
        "set -euo pipefail\n\
         NEED_INSTALL=0\n\
         for pkg in {joined}; do\n\
           {check} || NEED_INSTALL=1\n\
         done\n\
         if [ \"$NEED_INSTALL\" = \"1\" ]; then\n\
           {install} {joined}\n\
         fi\n\
         for pkg in {joined}; do\n\
           {check}\n\
         done"
    ))
}

impl Action for PackageManager {
    fn execute(&self, ctx: &ExecContext, params: &Params) -> Result<(), ActionError> {
        let packages = str_list(params, "packages")?;
        if packages.is_empty() {
            return Err(ActionError::InvalidParam {
                param: "packages".into(),
                reason: "must not be empty".into(),
            });
        }
        let script = package_script(self.kind, &packages)
            .ok_or_else(|| ActionError::Unsupported(format!("{} is not a package manager", self.kind)))?;
        run_script(&script, ctx)
    }
}

// ============================================================================
// Language ecosystems
// ============================================================================

/// Ecosystem build step (cargo, go, npm, pip).
#[derive(Debug, Clone, Copy)]
pub struct Ecosystem {
    kind: ActionKind,
}

static CARGO: Ecosystem = Ecosystem {
    kind: ActionKind::CargoBuild,
};
static GO: Ecosystem = Ecosystem {
    kind: ActionKind::GoBuild,
};
static NPM: Ecosystem = Ecosystem {
    kind: ActionKind::NpmExec,
};
static PIP: Ecosystem = Ecosystem {
    kind: ActionKind::PipExec,
};

pub fn ecosystem(kind: ActionKind) -> Option<&'static dyn Action> {
    let eco: &'static Ecosystem = match kind {
        ActionKind::CargoBuild => &CARGO,
        ActionKind::GoBuild => &GO,
        ActionKind::NpmExec => &NPM,
        ActionKind::PipExec => &PIP,
        _ => return None,
    };
    Some(eco)
}

/// Render the build script for an ecosystem step.
pub fn ecosystem_script(
    kind: ActionKind,
    params: &Params,
    ctx: &ExecContext,
) -> Result<String, ActionError> {
    let version = str_param(params, "version")?;
    let root = ctx.install_dir.to_string_lossy().to_string();
    let q_root = shell_quote(&root);
    let bin = shell_quote(&format!("{}/bin", root));
    let install = match kind {
        ActionKind::CargoBuild => format!(
            "cargo install --locked --root {} {} --version {}",
            q_root,
            shell_quote(str_param(params, "crate")?),
            shell_quote(version)
        ),
        ActionKind::GoBuild => format!(
            "mkdir -p {bin}\nGOBIN={bin} go install {}",
            shell_quote(&format!("{}@{}", str_param(params, "module")?, version))
        ),
        ActionKind::NpmExec => format!(
            "npm install --global --prefix {} {}",
            q_root,
            shell_quote(&format!("{}@{}", str_param(params, "package")?, version))
        ),
        ActionKind::PipExec => {
            let venv = format!("{}/venv", root);
            let mut s = format!(
                "python3 -m venv {}\n{} install --quiet {}\nmkdir -p {bin}",
                shell_quote(&venv),
                shell_quote(&format!("{}/bin/pip", venv)),
                shell_quote(&format!("{}=={}", str_param(params, "package")?, version))
            );
            for exe in str_list(params, "executables")? {
                s.push_str(&format!(
                    "\nln -sf {} {}",
                    shell_quote(&format!("{}/bin/{}", venv, exe)),
                    shell_quote(&format!("{}/bin/{}", root, exe))
                ));
            }
            s
        }
        other => {
            return Err(ActionError::Unsupported(format!(
                "{} is not an ecosystem build",
                other
            )))
        }
    };
    let mut script = format!("set -euo pipefail\n{}", install);
    for exe in str_list(params, "executables")? {
        script.push_str(&format!(
            "\ntest -x {}",
            shell_quote(&format!("{}/bin/{}", root, exe))
        ));
    }
    Ok(script)
}

impl Action for Ecosystem {
    fn execute(&self, ctx: &ExecContext, params: &Params) -> Result<(), ActionError> {
        let script = ecosystem_script(self.kind, params, ctx)?;
        run_script(&script, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Platform;
    use serde_json::json;
    use std::path::Path;

    fn ctx(root: &Path) -> ExecContext {
        ExecContext {
            tool: "t".into(),
            version: "1.2.3".into(),
            platform: Platform::new("linux", "amd64"),
            work_dir: root.join("work"),
            install_dir: root.join("install"),
            search_path: vec![],
        }
    }

    fn params(v: serde_json::Value) -> Params {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn test_kl034_apt_script() {
        let s = package_script(ActionKind::AptInstall, &["zlib1g-dev".into(), "curl".into()])
            .unwrap();
        assert!(s.starts_with("set -euo pipefail"));
        assert!(s.contains("dpkg -s \"$pkg\""));
        assert!(s.contains("apt-get install -y -qq 'zlib1g-dev' 'curl'"));
    }

    #[test]
    fn test_kl034_other_package_managers() {
        let pkgs = vec!["jq".to_string()];
        assert!(package_script(ActionKind::ApkInstall, &pkgs)
            .unwrap()
            .contains("apk add --no-cache 'jq'"));
        assert!(package_script(ActionKind::DnfInstall, &pkgs)
            .unwrap()
            .contains("rpm -q"));
        assert!(package_script(ActionKind::BrewInstall, &pkgs)
            .unwrap()
            .contains("brew install 'jq'"));
        assert!(package_script(ActionKind::Extract, &pkgs).is_none());
    }

    #[test]
    fn test_kl034_package_names_quoted() {
        let s = package_script(ActionKind::AptInstall, &["a'; rm -rf /".into()]).unwrap();
        assert!(s.contains("'a'\\''; rm -rf /'"));
    }

    #[test]
    fn test_kl034_cargo_script() {
        let dir = tempfile::tempdir().unwrap();
        let c = ctx(dir.path());
        let s = ecosystem_script(
            ActionKind::CargoBuild,
            &params(json!({"crate": "ripgrep", "version": "14.1.0", "executables": ["rg"]})),
            &c,
        )
        .unwrap();
        assert!(s.contains("cargo install --locked --root"));
        assert!(s.contains("'ripgrep' --version '14.1.0'"));
        assert!(s.contains("/bin/rg'"));
    }

    #[test]
    fn test_kl034_pip_script_links_executables() {
        let dir = tempfile::tempdir().unwrap();
        let s = ecosystem_script(
            ActionKind::PipExec,
            &params(json!({"package": "black", "version": "24.1.0", "executables": ["black"]})),
            &ctx(dir.path()),
        )
        .unwrap();
        assert!(s.contains("python3 -m venv"));
        assert!(s.contains("'black==24.1.0'"));
        assert!(s.contains("ln -sf"));
    }

    #[test]
    fn test_kl034_ecosystem_missing_param() {
        let dir = tempfile::tempdir().unwrap();
        let err = ecosystem_script(
            ActionKind::GoBuild,
            &params(json!({"version": "v1.0.0", "executables": ["x"]})),
            &ctx(dir.path()),
        )
        .unwrap_err();
        assert!(matches!(err, ActionError::MissingParam { ref param } if param == "module"));
    }

    #[test]
    fn test_kl034_run_command_in_workdir() {
        let dir = tempfile::tempdir().unwrap();
        let c = ctx(dir.path());
        RunCommand
            .execute(&c, &params(json!({"command": "echo \"$KILN_VERSION\" > out.txt"})))
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(c.work_dir.join("out.txt")).unwrap().trim(),
            "1.2.3"
        );
    }

    #[test]
    fn test_kl034_run_command_failure() {
        let dir = tempfile::tempdir().unwrap();
        let err = RunCommand
            .execute(&ctx(dir.path()), &params(json!({"command": "echo boom >&2; exit 3"})))
            .unwrap_err();
        match err {
            ActionError::Command { exit_code, stderr } => {
                assert_eq!(exit_code, 3);
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_kl034_search_path_prepended() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("dep/bin");
        std::fs::create_dir_all(&bin).unwrap();
        let tool = bin.join("kiln-fake-dep");
        std::fs::write(&tool, "#!/bin/sh\necho from-dep\n").unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();
        let mut c = ctx(dir.path());
        c.search_path = vec![bin];
        RunCommand
            .execute(&c, &params(json!({"command": "kiln-fake-dep > dep.txt"})))
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(c.work_dir.join("dep.txt")).unwrap().trim(),
            "from-dep"
        );
    }
}

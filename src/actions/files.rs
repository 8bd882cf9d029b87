//! KL-033: File primitives — chmod, binary/library install, env, text replace.

use super::{contained, opt_str, str_list, str_param, Action, ExecContext};
use crate::core::error::ActionError;
use crate::core::types::Params;
use serde_json::Value;
use std::path::Path;

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<(), ActionError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(|e| ActionError::io(format!("chmod {}", path.display()), e))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<(), ActionError> {
    Ok(())
}

fn parse_mode(params: &Params) -> Result<u32, ActionError> {
    let raw = opt_str(params, "mode").unwrap_or("755");
    u32::from_str_radix(raw, 8).map_err(|_| ActionError::InvalidParam {
        param: "mode".into(),
        reason: format!("'{}' is not an octal mode", raw),
    })
}

/// `chmod`: set `mode` (octal string, default 755) on `files` in the work dir.
#[derive(Debug, Clone, Copy)]
pub struct Chmod;

impl Action for Chmod {
    fn execute(&self, ctx: &ExecContext, params: &Params) -> Result<(), ActionError> {
        let mode = parse_mode(params)?;
        for file in str_list(params, "files")? {
            let path = contained(&ctx.work_dir, &file, "files")?;
            set_mode(&path, mode)?;
        }
        Ok(())
    }
}

/// A `{src, dest}` pair from a `binaries` entry.
fn binary_entry(v: &Value) -> Result<(String, String), ActionError> {
    let invalid = || ActionError::InvalidParam {
        param: "binaries".into(),
        reason: "entries must be strings or {src, dest} tables".into(),
    };
    let (src, dest) = match v {
        Value::String(s) => (s.clone(), None),
        Value::Object(o) => (
            o.get("src").and_then(Value::as_str).ok_or_else(invalid)?.to_string(),
            o.get("dest").and_then(Value::as_str).map(str::to_string),
        ),
        _ => return Err(invalid()),
    };
    let dest = match dest {
        Some(d) => d,
        None => Path::new(&src)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(invalid)?,
    };
    Ok((src, dest))
}

fn copy_into(src: &Path, dest: &Path) -> Result<(), ActionError> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ActionError::io(format!("create {}", parent.display()), e))?;
    }
    std::fs::copy(src, dest)
        .map_err(|e| ActionError::io(format!("copy {} -> {}", src.display(), dest.display()), e))?;
    Ok(())
}

/// `install_binaries`: copy executables into `<install_dir>/bin`.
#[derive(Debug, Clone, Copy)]
pub struct InstallBinaries;

impl Action for InstallBinaries {
    fn execute(&self, ctx: &ExecContext, params: &Params) -> Result<(), ActionError> {
        let entries = match params.get("binaries") {
            Some(Value::Array(items)) => items.clone(),
            Some(v @ Value::String(_)) => vec![v.clone()],
            Some(_) => {
                return Err(ActionError::InvalidParam {
                    param: "binaries".into(),
                    reason: "expected a list".into(),
                })
            }
            None => {
                return Err(ActionError::MissingParam {
                    param: "binaries".into(),
                })
            }
        };
        let bin_dir = ctx.install_dir.join("bin");
        for entry in &entries {
            let (src, dest) = binary_entry(entry)?;
            let from = contained(&ctx.work_dir, &src, "binaries")?;
            let to = contained(&bin_dir, &dest, "binaries")?;
            copy_into(&from, &to)?;
            set_mode(&to, 0o755)?;
        }
        Ok(())
    }
}

/// `install_libraries`: copy files matching glob patterns (relative to the
/// work dir) into `<install_dir>/lib`.
#[derive(Debug, Clone, Copy)]
pub struct InstallLibraries;

impl Action for InstallLibraries {
    fn execute(&self, ctx: &ExecContext, params: &Params) -> Result<(), ActionError> {
        let lib_dir = ctx.install_dir.join("lib");
        for pattern in str_list(params, "libraries")? {
            let base = contained(&ctx.work_dir, &pattern, "libraries")?;
            let matches = glob::glob(&base.to_string_lossy()).map_err(|e| {
                ActionError::InvalidParam {
                    param: "libraries".into(),
                    reason: e.to_string(),
                }
            })?;
            let mut found = false;
            for path in matches.flatten() {
                let Some(name) = path.file_name() else {
                    continue;
                };
                copy_into(&path, &lib_dir.join(name))?;
                found = true;
            }
            if !found {
                return Err(ActionError::InvalidParam {
                    param: "libraries".into(),
                    reason: format!("'{}' matched no files", pattern),
                });
            }
        }
        Ok(())
    }
}

/// `set_env`: write `vars` as `export` lines to `<install_dir>/env.sh`.
#[derive(Debug, Clone, Copy)]
pub struct SetEnv;

impl Action for SetEnv {
    fn execute(&self, ctx: &ExecContext, params: &Params) -> Result<(), ActionError> {
        let vars = params
            .get("vars")
            .and_then(Value::as_object)
            .ok_or_else(|| ActionError::MissingParam {
                param: "vars".into(),
            })?;
        let mut lines = String::new();
        for (name, value) in vars {
            if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(ActionError::InvalidParam {
                    param: "vars".into(),
                    reason: format!("'{}' is not a valid variable name", name),
                });
            }
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let value = value.replace("{install_dir}", &ctx.install_dir.to_string_lossy());
            lines.push_str(&format!("export {}=\"{}\"\n", name, value.replace('"', "\\\"")));
        }
        std::fs::create_dir_all(&ctx.install_dir)
            .map_err(|e| ActionError::io(format!("create {}", ctx.install_dir.display()), e))?;
        let path = ctx.install_dir.join("env.sh");
        std::fs::write(&path, lines)
            .map_err(|e| ActionError::io(format!("write {}", path.display()), e))
    }
}

/// `text_replace`: regex replace in a work dir file.
#[derive(Debug, Clone, Copy)]
pub struct TextReplace;

impl Action for TextReplace {
    fn execute(&self, ctx: &ExecContext, params: &Params) -> Result<(), ActionError> {
        let path = contained(&ctx.work_dir, str_param(params, "file")?, "file")?;
        let pattern = str_param(params, "pattern")?;
        let replacement = str_param(params, "replacement")?;
        let re = regex::Regex::new(pattern).map_err(|e| ActionError::InvalidParam {
            param: "pattern".into(),
            reason: e.to_string(),
        })?;
        let content = std::fs::read_to_string(&path)
            .map_err(|e| ActionError::io(format!("read {}", path.display()), e))?;
        let updated = re.replace_all(&content, replacement);
        std::fs::write(&path, updated.as_bytes())
            .map_err(|e| ActionError::io(format!("write {}", path.display()), e))
    }
}

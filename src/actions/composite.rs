//! KL-031: Composite action expansion.
//!
//! A composite expands into an ordered list of child actions. Children are
//! named by string so a catalog can refer to any action, composite or not;
//! the decomposer resolves names and guards against cycles. Parameters may
//! still contain `{version}`-style placeholders, which are expanded after
//! expansion completes.

use super::ActionKind;
use crate::core::types::Params;
use serde_json::{json, Value};
use thiserror::Error;

/// One child produced by a composite.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildStep {
    pub action: String,
    pub params: Params,
}

impl ChildStep {
    fn new(kind: ActionKind, params: Params) -> Self {
        Self {
            action: kind.name().to_string(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpandError {
    #[error("missing required parameter '{0}'")]
    MissingParam(String),

    #[error("invalid parameter '{param}': {reason}")]
    InvalidParam { param: String, reason: String },
}

/// Expands composite actions into children.
pub trait CompositeExpander {
    fn expand(&self, kind: ActionKind, params: &Params) -> Result<Vec<ChildStep>, ExpandError>;
}

/// The built-in expansion rules.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinComposites;

fn req<'a>(params: &'a Params, key: &str) -> Result<&'a str, ExpandError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ExpandError::MissingParam(key.to_string()))
}

fn opt<'a>(params: &'a Params, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str)
}

fn params_of(pairs: Vec<(&str, Value)>) -> Params {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

/// Last path segment of a URL or path template.
fn basename(url: &str) -> &str {
    let trimmed = url.split(['?', '#']).next().unwrap_or(url);
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// Archive format from a file name.
pub fn infer_archive_format(file: &str) -> Option<&'static str> {
    let lower = file.to_ascii_lowercase();
    [
        (".tar.gz", "tar.gz"),
        (".tgz", "tar.gz"),
        (".tar.bz2", "tar.bz2"),
        (".tbz2", "tar.bz2"),
        (".tar.zst", "tar.zst"),
        (".tar", "tar"),
        (".zip", "zip"),
    ]
    .iter()
    .find(|(suffix, _)| lower.ends_with(suffix))
    .map(|(_, fmt)| *fmt)
}

/// Source names of a `binaries` list (strings or `{src, dest}` tables).
fn binary_sources(binaries: &Value) -> Result<Vec<Value>, ExpandError> {
    let invalid = |reason: &str| ExpandError::InvalidParam {
        param: "binaries".into(),
        reason: reason.into(),
    };
    let items = match binaries {
        Value::String(_) => vec![binaries.clone()],
        Value::Array(items) if !items.is_empty() => items.clone(),
        Value::Array(_) => return Err(invalid("must not be empty")),
        _ => return Err(invalid("expected a list")),
    };
    items
        .iter()
        .map(|b| match b {
            Value::String(s) => Ok(json!(s)),
            Value::Object(o) => o
                .get("src")
                .filter(|v| v.is_string())
                .cloned()
                .ok_or_else(|| invalid("table entries need a 'src' string")),
            _ => Err(invalid("entries must be strings or tables")),
        })
        .collect()
}

/// download_file → extract → chmod → install_binaries
fn archive_steps(url: String, params: &Params) -> Result<Vec<ChildStep>, ExpandError> {
    let file = basename(&url).to_string();
    let format = match opt(params, "archive_format") {
        Some(f) => f.to_string(),
        None => infer_archive_format(&file)
            .ok_or_else(|| ExpandError::InvalidParam {
                param: "archive_format".into(),
                reason: format!("cannot infer from '{}'", file),
            })?
            .to_string(),
    };
    let binaries = params
        .get("binaries")
        .ok_or_else(|| ExpandError::MissingParam("binaries".into()))?;
    let sources = binary_sources(binaries)?;

    let mut download = params_of(vec![("url", json!(url)), ("dest", json!(file))]);
    if let Some(sum) = params.get("checksum") {
        download.insert("checksum".into(), sum.clone());
    }
    let strip = params.get("strip_dirs").cloned().unwrap_or(json!(0));

    Ok(vec![
        ChildStep::new(ActionKind::DownloadFile, download),
        ChildStep::new(
            ActionKind::Extract,
            params_of(vec![
                ("archive", json!(file)),
                ("format", json!(format)),
                ("strip_dirs", strip),
                ("dest", json!(".")),
            ]),
        ),
        ChildStep::new(
            ActionKind::Chmod,
            params_of(vec![("files", Value::Array(sources)), ("mode", json!("755"))]),
        ),
        ChildStep::new(
            ActionKind::InstallBinaries,
            params_of(vec![("binaries", binaries.clone())]),
        ),
    ])
}

fn github_url(repo: &str, asset: &str) -> String {
    format!(
        "https://github.com/{}/releases/download/{{version_tag}}/{}",
        repo, asset
    )
}

/// Executables list, defaulting to a single name.
fn executables(params: &Params, default: &str) -> Value {
    params
        .get("executables")
        .cloned()
        .unwrap_or_else(|| json!([default]))
}

impl CompositeExpander for BuiltinComposites {
    fn expand(&self, kind: ActionKind, params: &Params) -> Result<Vec<ChildStep>, ExpandError> {
        use ActionKind::*;
        match kind {
            Download => {
                let url = req(params, "url")?;
                let mut p = params.clone();
                p.entry("dest".to_string())
                    .or_insert_with(|| json!(basename(url)));
                Ok(vec![ChildStep::new(DownloadFile, p)])
            }
            DownloadArchive => archive_steps(req(params, "url")?.to_string(), params),
            GithubArchive => {
                let url = github_url(req(params, "repo")?, req(params, "asset_pattern")?);
                archive_steps(url, params)
            }
            GithubFile => {
                let repo = req(params, "repo")?;
                let asset = req(params, "asset_pattern")?;
                let binary = match opt(params, "binary") {
                    Some(b) => b,
                    None => repo.rsplit('/').next().unwrap_or(repo),
                };
                let mut download = params_of(vec![
                    ("url", json!(github_url(repo, asset))),
                    ("dest", json!(asset)),
                ]);
                if let Some(sum) = params.get("checksum") {
                    download.insert("checksum".into(), sum.clone());
                }
                Ok(vec![
                    ChildStep::new(DownloadFile, download),
                    ChildStep::new(
                        Chmod,
                        params_of(vec![("files", json!([asset])), ("mode", json!("755"))]),
                    ),
                    ChildStep::new(
                        InstallBinaries,
                        params_of(vec![(
                            "binaries",
                            json!([{ "src": asset, "dest": binary }]),
                        )]),
                    ),
                ])
            }
            CargoInstall => {
                let krate = req(params, "crate")?;
                Ok(vec![ChildStep::new(
                    CargoBuild,
                    params_of(vec![
                        ("crate", json!(krate)),
                        ("version", json!("{version}")),
                        ("executables", executables(params, krate)),
                    ]),
                )])
            }
            GoInstall => {
                let module = req(params, "module")?;
                let default = module.rsplit('/').next().unwrap_or(module);
                Ok(vec![ChildStep::new(
                    GoBuild,
                    params_of(vec![
                        ("module", json!(module)),
                        ("version", json!("{version_tag}")),
                        ("executables", executables(params, default)),
                    ]),
                )])
            }
            NpmInstall | PipxInstall => {
                let package = req(params, "package")?;
                let child = if kind == NpmInstall { NpmExec } else { PipExec };
                Ok(vec![ChildStep::new(
                    child,
                    params_of(vec![
                        ("package", json!(package)),
                        ("version", json!("{version}")),
                        ("executables", executables(params, package)),
                    ]),
                )])
            }
            primitive => Err(ExpandError::InvalidParam {
                param: "action".into(),
                reason: format!("'{}' is not a composite", primitive),
            }),
        }
    }
}

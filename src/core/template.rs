//! KL-021: Step parameter templates.
//!
//! Syntax: `{name}` or `{version|transform}`. `{{` and `}}` produce literal
//! braces; `${...}` passes through untouched so shell snippets survive.
//! Unknown variables or transforms are errors, never left unexpanded.

use super::error::TemplateError;
use super::types::Platform;

/// Values available to templates for one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateVars {
    pub version: String,
    pub version_tag: String,
    pub os: String,
    pub arch: String,
    pub linux_family: Option<String>,
    pub libc: Option<String>,
}

impl TemplateVars {
    pub fn new(version: &str, version_tag: &str, platform: &Platform) -> Self {
        Self {
            version: version.to_string(),
            version_tag: version_tag.to_string(),
            os: platform.os.clone(),
            arch: platform.arch.clone(),
            linux_family: platform.linux_family.clone(),
            libc: platform.libc.clone(),
        }
    }

    fn lookup(&self, name: &str) -> Result<String, TemplateError> {
        let unavailable = || TemplateError::Unavailable {
            name: name.to_string(),
        };
        match name {
            "version" => Ok(self.version.clone()),
            "version_tag" => Ok(self.version_tag.clone()),
            "os" => Ok(self.os.clone()),
            "arch" => Ok(self.arch.clone()),
            "linux_family" => self.linux_family.clone().ok_or_else(unavailable),
            "libc" => self.libc.clone().ok_or_else(unavailable),
            _ => Err(TemplateError::UnknownVariable {
                name: name.to_string(),
            }),
        }
    }
}

/// Leading numeric components of a version (`v3.46.1-rc1` → `[3, 46, 1]`).
fn numeric_parts(version: &str) -> Vec<u64> {
    let start = version.trim_start_matches(|c: char| !c.is_ascii_digit());
    let core: String = start
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    core.split('.')
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse().ok())
        .collect()
}

/// Apply a named transform to a version string.
pub fn apply_transform(transform: &str, version: &str) -> Result<String, TemplateError> {
    let failed = || TemplateError::TransformFailed {
        transform: transform.to_string(),
        version: version.to_string(),
    };
    let parts = numeric_parts(version);
    match transform {
        "strip_v" => Ok(version
            .strip_prefix('v')
            .or_else(|| version.strip_prefix('V'))
            .unwrap_or(version)
            .to_string()),
        "semver" => match parts.as_slice() {
            [x, y, z, ..] => Ok(format!("{}.{}.{}", x, y, z)),
            [x, y] => Ok(format!("{}.{}.0", x, y)),
            _ => Err(failed()),
        },
        "major" => parts.first().map(|x| x.to_string()).ok_or_else(failed),
        "major_minor" => match parts.as_slice() {
            [x, y, ..] => Ok(format!("{}.{}", x, y)),
            _ => Err(failed()),
        },
        "underscore" => {
            let bare = version.strip_prefix('v').unwrap_or(version);
            Ok(bare.replace('.', "_"))
        }
        // 3.46.1 → 3460100
        "sqlite" => match parts.as_slice() {
            [x, y, rest @ ..] if *y < 100 && rest.first().copied().unwrap_or(0) < 100 => Ok(
                format!("{}{:02}{:02}00", x, y, rest.first().copied().unwrap_or(0)),
            ),
            _ => Err(failed()),
        },
        _ => Err(TemplateError::UnknownTransform {
            name: transform.to_string(),
        }),
    }
}

fn evaluate(expr: &str, vars: &TemplateVars) -> Result<String, TemplateError> {
    let (name, transform) = match expr.split_once('|') {
        Some((n, t)) => (n.trim(), Some(t.trim())),
        None => (expr.trim(), None),
    };
    let value = vars.lookup(name)?;
    match transform {
        None => Ok(value),
        Some(t) if name != "version" => Err(TemplateError::TransformNotAllowed {
            variable: name.to_string(),
            transform: t.to_string(),
        }),
        Some(t) => apply_transform(t, &value),
    }
}

/// Expand every placeholder in a string.
pub fn expand(input: &str, vars: &TemplateVars) -> Result<String, TemplateError> {
    let bytes = input.as_bytes();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        match bytes[i] {
            b'$' if bytes.get(i + 1) == Some(&b'{') => {
                let end = input[i..].find('}').map_or(input.len(), |e| i + e + 1);
                out.push_str(&input[i..end]);
                i = end;
            }
            b'{' if bytes.get(i + 1) == Some(&b'{') => {
                out.push('{');
                i += 2;
            }
            b'}' if bytes.get(i + 1) == Some(&b'}') => {
                out.push('}');
                i += 2;
            }
            b'{' => {
                let rest = &input[i + 1..];
                let end = rest
                    .find('}')
                    .ok_or(TemplateError::Unterminated { offset: i })?;
                let expr = &rest[..end];
                if expr.contains('{') {
                    return Err(TemplateError::Unterminated { offset: i });
                }
                out.push_str(&evaluate(expr, vars)?);
                i += end + 2;
            }
            _ => {
                let ch = input[i..].chars().next().unwrap_or_default();
                out.push(ch);
                i += ch.len_utf8().max(1);
            }
        }
    }
    Ok(out)
}

/// Expand all strings inside a JSON value (arrays and objects recursively;
/// object keys are left as written).
pub fn expand_value(
    value: &serde_json::Value,
    vars: &TemplateVars,
) -> Result<serde_json::Value, TemplateError> {
    use serde_json::Value;
    Ok(match value {
        Value::String(s) => Value::String(expand(s, vars)?),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| expand_value(v, vars))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), expand_value(v, vars)?);
            }
            Value::Object(out)
        }
        other => other.clone(),
    })
}

//! KL-012: Recipe loading and structural validation.
//!
//! Validation collects every problem instead of stopping at the first:
//! - Name must be present and path-safe
//! - At least one step; every action in the catalog
//! - `when` tuples and linux families well-formed
//! - Dependency specs parse and never name the recipe itself
//! - Version source fields consistent with the declared source

use super::recipe::{DependencySpec, Recipe, Step};
use super::types::is_path_safe;
use super::error::RecipeError;
use crate::actions::ActionKind;
use std::path::Path;

pub const LINUX_FAMILIES: &[&str] = &["debian", "rhel", "alpine", "arch", "suse"];
const LIBC_FLAVORS: &[&str] = &["glibc", "musl"];

/// Validation error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Load a recipe file and validate it.
pub fn parse_recipe_file(path: &Path) -> Result<(Recipe, Vec<ValidationError>), RecipeError> {
    let recipe = Recipe::load_file(path)?;
    let errors = validate_recipe(&recipe);
    Ok((recipe, errors))
}

fn valid_tuple(t: &str) -> bool {
    matches!(t.split_once('/'), Some((os, arch)) if !os.is_empty() && !arch.is_empty() && !arch.contains('/'))
}

/// Validate a parsed recipe. Returns all errors found.
pub fn validate_recipe(recipe: &Recipe) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let mut err = |message: String| errors.push(ValidationError { message });
    let name = recipe.name();

    if name.trim().is_empty() {
        err("metadata.name is required".to_string());
    } else if !is_path_safe(name) || name.contains(char::is_whitespace) {
        err(format!("metadata.name '{}' must be a plain identifier", name));
    }

    if recipe.steps.is_empty() {
        err("recipe has no steps".to_string());
    }

    for t in &recipe.metadata.unsupported_platforms {
        if !valid_tuple(t) {
            err(format!("unsupported_platforms entry '{}' is not os/arch", t));
        }
    }

    for raw in &recipe.metadata.dependencies {
        check_dependency(name, "metadata.dependencies", raw, &mut err);
    }

    for (i, step) in recipe.steps.iter().enumerate() {
        check_step(name, i, step, &mut err);
    }

    let v = &recipe.version;
    match v.source.as_deref() {
        Some("github_releases") if v.github_repo.as_deref().is_none_or(|r| !r.contains('/')) => {
            err("version.source github_releases requires github_repo = \"owner/name\"".to_string())
        }
        Some("static") if v.versions.is_empty() => {
            err("version.source static requires a non-empty versions list".to_string())
        }
        Some("") => err("version.source must not be empty".to_string()),
        _ => {}
    }

    if let Some(ref verify) = recipe.verify {
        if verify.command.trim().is_empty() {
            err("verify.command must not be empty".to_string());
        }
    }

    errors
}

fn check_dependency(tool: &str, field: &str, raw: &str, err: &mut impl FnMut(String)) {
    match DependencySpec::parse(raw) {
        None => err(format!("{}: invalid dependency '{}'", field, raw)),
        Some(spec) if spec.name == tool => {
            err(format!("{}: recipe '{}' depends on itself", field, tool))
        }
        Some(_) => {}
    }
}

fn check_step(tool: &str, i: usize, step: &Step, err: &mut impl FnMut(String)) {
    let n = i + 1;
    if ActionKind::from_name(&step.action).is_none() {
        err(format!("step {}: unknown action '{}'", n, step.action));
    }
    if let Some(ref when) = step.when {
        for t in &when.platform {
            if !valid_tuple(t) {
                err(format!("step {}: when.platform entry '{}' is not os/arch", n, t));
            }
        }
        for family in when.linux_family.to_vec() {
            if !LINUX_FAMILIES.contains(&family.as_str()) {
                err(format!("step {}: unknown linux_family '{}'", n, family));
            }
        }
        for libc in when.libc.to_vec() {
            if !LIBC_FLAVORS.contains(&libc.as_str()) {
                err(format!("step {}: unknown libc '{}'", n, libc));
            }
        }
    }
    for raw in &step.dependencies {
        check_dependency(tool, &format!("step {} dependencies", n), raw, &mut *err);
    }
}

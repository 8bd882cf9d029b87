//! KL-019: Recipe model, loading, and platform predicates.
//!
//! A recipe is the immutable declarative description of how to install one
//! tool: metadata, a version source, ordered steps, and dependencies. Recipes
//! are TOML or YAML on disk and are identified by a BLAKE3 content hash.

use super::error::RecipeError;
use super::types::{is_path_safe, Params, Platform};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A single string or a list of strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StringOrList {
    One(String),
    Many(Vec<String>),
}

impl Default for StringOrList {
    fn default() -> Self {
        StringOrList::Many(Vec::new())
    }
}

impl StringOrList {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            StringOrList::One(s) => vec![s.clone()],
            StringOrList::Many(v) => v.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            StringOrList::One(_) => false,
            StringOrList::Many(v) => v.is_empty(),
        }
    }

    fn contains(&self, value: &str) -> bool {
        match self {
            StringOrList::One(s) => s == value,
            StringOrList::Many(v) => v.iter().any(|s| s == value),
        }
    }
}

// ============================================================================
// Recipe file
// ============================================================================

/// A parsed recipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    pub metadata: RecipeMetadata,

    #[serde(default)]
    pub version: VersionSection,

    #[serde(default)]
    pub steps: Vec<Step>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify: Option<VerifySection>,

    /// Where this recipe was loaded from. Not part of the content hash.
    #[serde(skip)]
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipeMetadata {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,

    /// Install-time dependencies, `name` or `name@constraint`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub supported_os: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub supported_arch: Vec<String>,

    /// `"os/arch"` tuples this recipe refuses
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unsupported_platforms: Vec<String>,
}

/// Where versions come from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionSection {
    /// Provider name (`static`, `github_releases`). None = no provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_repo: Option<String>,

    /// Prefix stripped from tags (`v`, `jq-`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_prefix: Option<String>,

    /// Known versions for the `static` provider
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub versions: Vec<String>,
}

/// One recipe step: an action, its parameters, and an optional predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub action: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<WhenClause>,

    /// Dependencies active only when this step survives platform filtering
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,

    #[serde(flatten)]
    pub params: Params,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifySection {
    pub command: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

// ============================================================================
// When-clause
// ============================================================================

/// Step predicate over platform dimensions. Every specified dimension must
/// match; unspecified dimensions, and dimensions the target leaves unset,
/// are wildcards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WhenClause {
    #[serde(default, skip_serializing_if = "StringOrList::is_empty")]
    pub os: StringOrList,

    #[serde(default, skip_serializing_if = "StringOrList::is_empty")]
    pub arch: StringOrList,

    #[serde(default, skip_serializing_if = "StringOrList::is_empty")]
    pub linux_family: StringOrList,

    #[serde(default, skip_serializing_if = "StringOrList::is_empty")]
    pub libc: StringOrList,

    /// `"os/arch"` tuples; `"linux/*"` matches any arch
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub platform: Vec<String>,
}

impl WhenClause {
    pub fn is_empty(&self) -> bool {
        self.os.is_empty()
            && self.arch.is_empty()
            && self.linux_family.is_empty()
            && self.libc.is_empty()
            && self.platform.is_empty()
    }

    /// Evaluate against a target platform.
    pub fn matches(&self, target: &Platform) -> bool {
        fn dim(list: &StringOrList, value: Option<&str>) -> bool {
            match value {
                _ if list.is_empty() => true,
                None => true,
                Some(v) => list.contains(v),
            }
        }
        dim(&self.os, Some(&target.os))
            && dim(&self.arch, Some(&target.arch))
            && dim(&self.linux_family, target.linux_family.as_deref())
            && dim(&self.libc, target.libc.as_deref())
            && (self.platform.is_empty()
                || self
                    .platform
                    .iter()
                    .any(|t| tuple_matches(t, &target.os, &target.arch)))
    }
}

fn tuple_matches(tuple: &str, os: &str, arch: &str) -> bool {
    match tuple.split_once('/') {
        Some((o, a)) => (o == "*" || o == os) && (a == "*" || a == arch),
        None => false,
    }
}

// ============================================================================
// Recipe behavior
// ============================================================================

impl Recipe {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// `"blake3:{hex}"` over the canonical JSON form of the recipe.
    pub fn content_hash(&self) -> Result<String, RecipeError> {
        let canonical = serde_json::to_string(self).map_err(|e| RecipeError::Hash {
            name: self.metadata.name.clone(),
            message: e.to_string(),
        })?;
        Ok(crate::tripwire::hasher::hash_string(&canonical))
    }

    /// Whether the recipe declares support for the target.
    pub fn supports(&self, target: &Platform) -> bool {
        let m = &self.metadata;
        if !m.supported_os.is_empty() && !m.supported_os.iter().any(|o| *o == target.os) {
            return false;
        }
        if !m.supported_arch.is_empty() && !m.supported_arch.iter().any(|a| *a == target.arch) {
            return false;
        }
        !m.unsupported_platforms
            .iter()
            .any(|t| tuple_matches(t, &target.os, &target.arch))
    }

    pub fn from_toml_str(s: &str, source: &str) -> Result<Self, RecipeError> {
        let mut recipe: Recipe = toml::from_str(s).map_err(|e| RecipeError::Parse {
            path: source.to_string(),
            message: e.to_string(),
        })?;
        recipe.source = source.to_string();
        Ok(recipe)
    }

    pub fn from_yaml_str(s: &str, source: &str) -> Result<Self, RecipeError> {
        let mut recipe: Recipe = serde_yaml_ng::from_str(s).map_err(|e| RecipeError::Parse {
            path: source.to_string(),
            message: e.to_string(),
        })?;
        recipe.source = source.to_string();
        Ok(recipe)
    }

    /// Load a recipe file; format chosen by extension (`.toml`, `.yaml`, `.yml`).
    pub fn load_file(path: &Path) -> Result<Self, RecipeError> {
        let display = path.display().to_string();
        let content = std::fs::read_to_string(path).map_err(|e| RecipeError::Io {
            path: display.clone(),
            source: e,
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&content, &display),
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content, &display),
            _ => Err(RecipeError::Parse {
                path: display,
                message: "unsupported recipe extension (expected .toml, .yaml, .yml)".into(),
            }),
        }
    }
}

/// A dependency reference: `name` or `name@constraint`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DependencySpec {
    pub name: String,
    pub constraint: String,
}

impl DependencySpec {
    pub fn parse(spec: &str) -> Option<Self> {
        let spec = spec.trim();
        let (name, constraint) = match spec.split_once('@') {
            Some((n, c)) => (n.trim(), c.trim()),
            None => (spec, ""),
        };
        if !is_path_safe(name) || name.contains(char::is_whitespace) {
            return None;
        }
        Some(Self {
            name: name.to_string(),
            constraint: constraint.to_string(),
        })
    }
}

// ============================================================================
// Loaders
// ============================================================================

/// Loads recipes by tool name.
pub trait RecipeLoader {
    fn load(&self, name: &str) -> Result<Recipe, RecipeError>;
}

/// Searches a list of directories for `<name>.toml`, `<name>.yaml`, `<name>.yml`.
#[derive(Debug, Clone)]
pub struct DirRecipeLoader {
    dirs: Vec<PathBuf>,
}

const RECIPE_EXTENSIONS: &[&str] = &["toml", "yaml", "yml"];

impl DirRecipeLoader {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }

    /// First matching recipe file for a name.
    pub fn find(&self, name: &str) -> Option<PathBuf> {
        if name.is_empty() || name.contains('/') || name.contains("..") {
            return None;
        }
        self.dirs.iter().find_map(|dir| {
            RECIPE_EXTENSIONS
                .iter()
                .map(|ext| dir.join(format!("{}.{}", name, ext)))
                .find(|p| p.is_file())
        })
    }

    /// All recipe names across the search path, sorted, first dir wins.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for dir in &self.dirs {
            for ext in RECIPE_EXTENSIONS {
                let pattern = dir.join(format!("*.{}", ext));
                let Some(pattern) = pattern.to_str() else {
                    continue;
                };
                let Ok(paths) = glob::glob(pattern) else {
                    continue;
                };
                for path in paths.flatten() {
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        names.push(stem.to_string());
                    }
                }
            }
        }
        names.sort();
        names.dedup();
        names
    }
}

impl RecipeLoader for DirRecipeLoader {
    fn load(&self, name: &str) -> Result<Recipe, RecipeError> {
        let path = self.find(name).ok_or_else(|| RecipeError::NotFound {
            name: name.to_string(),
        })?;
        Recipe::load_file(&path)
    }
}

/// In-memory recipe set.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecipeLoader {
    recipes: IndexMap<String, Recipe>,
}

impl MemoryRecipeLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, recipe: Recipe) {
        self.recipes.insert(recipe.metadata.name.clone(), recipe);
    }
}

impl RecipeLoader for MemoryRecipeLoader {
    fn load(&self, name: &str) -> Result<Recipe, RecipeError> {
        self.recipes
            .get(name)
            .cloned()
            .ok_or_else(|| RecipeError::NotFound {
                name: name.to_string(),
            })
    }
}

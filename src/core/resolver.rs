//! KL-043: Dependency resolution.
//!
//! Depth-first over dependency recipes. Each dependency is loaded, its
//! version resolved, its own dependencies resolved, and its steps decomposed
//! for the same target platform. A memo table keyed by `(tool, version)`
//! collapses diamonds; the visiting stack detects cycles. Output is leaves
//! first, so installing in list order always finds requirements present.

use super::cancel::CancelToken;
use super::decomposer::{Decomposer, Decomposition};
use super::error::{DependencyError, GenerationError, KilnError};
use super::recipe::{DependencySpec, Recipe, RecipeLoader};
use super::template::TemplateVars;
use super::types::{DependencyNode, Platform};
use super::version::{ResolvedVersion, VersionResolver};
use rustc_hash::FxHashMap;
use tracing::debug;

/// Maximum dependency nesting below the root tool.
pub const MAX_DEPENDENCY_DEPTH: usize = 5;

/// Dependency specs in precedence order: explicit metadata dependencies,
/// step-scoped dependencies of surviving steps, then implicit action
/// requirements. The first occurrence of a name wins.
pub fn dependency_specs(
    tool: &str,
    explicit: &[String],
    decomposition: &Decomposition,
) -> Result<Vec<DependencySpec>, DependencyError> {
    let mut out: Vec<DependencySpec> = Vec::new();
    let declared = explicit
        .iter()
        .chain(decomposition.step_dependencies.iter());
    for raw in declared {
        let spec = DependencySpec::parse(raw).ok_or_else(|| DependencyError::InvalidSpec {
            tool: tool.to_string(),
            spec: raw.clone(),
        })?;
        if !out.iter().any(|s| s.name == spec.name) {
            out.push(spec);
        }
    }
    for name in &decomposition.implicit_dependencies {
        if name != tool && !out.iter().any(|s| s.name == *name) {
            out.push(DependencySpec {
                name: name.clone(),
                constraint: String::new(),
            });
        }
    }
    Ok(out)
}

/// Explicit resolution state threaded through the recursion.
#[derive(Debug, Default)]
pub struct ResolveTable {
    /// `(tool, version)` → index into `nodes`
    memo: FxHashMap<(String, String), usize>,
    /// `(tool, constraint)` → resolved version
    versions: FxHashMap<(String, String), ResolvedVersion>,
    visiting: Vec<String>,
    nodes: Vec<DependencyNode>,
    eval_dependencies: Vec<String>,
}

impl ResolveTable {
    pub fn nodes(&self) -> &[DependencyNode] {
        &self.nodes
    }

    pub fn eval_dependencies(&self) -> &[String] {
        &self.eval_dependencies
    }

    pub fn into_parts(self) -> (Vec<DependencyNode>, Vec<String>) {
        (self.nodes, self.eval_dependencies)
    }
}

pub struct DependencyResolver<'a> {
    loader: &'a dyn RecipeLoader,
    versions: &'a VersionResolver,
    decomposer: &'a Decomposer<'a>,
    platform: &'a Platform,
    cancel: Option<&'a CancelToken>,
}

impl<'a> DependencyResolver<'a> {
    pub fn new(
        loader: &'a dyn RecipeLoader,
        versions: &'a VersionResolver,
        decomposer: &'a Decomposer<'a>,
        platform: &'a Platform,
    ) -> Self {
        Self {
            loader,
            versions,
            decomposer,
            platform,
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, cancel: &'a CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Resolve the dependencies of `root` given its already-computed specs.
    pub fn resolve(&self, root: &Recipe, specs: &[DependencySpec]) -> Result<ResolveTable, KilnError> {
        let mut table = ResolveTable::default();
        table.visiting.push(root.name().to_string());
        for spec in specs {
            self.visit(spec, root.name(), 1, &mut table)?;
        }
        table.visiting.pop();
        Ok(table)
    }

    fn visit(
        &self,
        spec: &DependencySpec,
        required_by: &str,
        depth: usize,
        table: &mut ResolveTable,
    ) -> Result<(), KilnError> {
        if self.cancel.is_some_and(CancelToken::is_cancelled) {
            return Err(GenerationError::Cancelled.into());
        }
        let name = spec.name.as_str();
        if table.visiting.iter().any(|v| v == name) {
            let mut path = table.visiting.clone();
            path.push(name.to_string());
            return Err(DependencyError::Cycle {
                tool: name.to_string(),
                path,
            }
            .into());
        }
        if depth > MAX_DEPENDENCY_DEPTH {
            return Err(DependencyError::TooDeep {
                tool: name.to_string(),
                max: MAX_DEPENDENCY_DEPTH,
            }
            .into());
        }

        let recipe = self
            .loader
            .load(name)
            .map_err(|source| DependencyError::Missing {
                tool: name.to_string(),
                required_by: required_by.to_string(),
                source,
            })?;
        if !recipe.supports(self.platform) {
            return Err(GenerationError::UnsupportedPlatform {
                tool: name.to_string(),
                platform: self.platform.to_string(),
            }
            .into());
        }

        let version_key = (name.to_string(), spec.constraint.clone());
        let resolved = match table.versions.get(&version_key) {
            Some(v) => v.clone(),
            None => {
                let v = self.versions.resolve(&recipe, &spec.constraint)?;
                table.versions.insert(version_key, v.clone());
                v
            }
        };
        let memo_key = (name.to_string(), resolved.version.clone());
        if table.memo.contains_key(&memo_key) {
            debug!(tool = name, version = %resolved.version, required_by, "dependency already resolved");
            return Ok(());
        }

        table.visiting.push(name.to_string());
        let vars = TemplateVars::new(&resolved.version, &resolved.tag, self.platform);
        let decomposition = self
            .decomposer
            .decompose(name, &recipe.steps, self.platform, &vars)?;
        let children = dependency_specs(name, &recipe.metadata.dependencies, &decomposition)?;
        let mut requires = Vec::with_capacity(children.len());
        for child in &children {
            self.visit(child, name, depth + 1, table)?;
            requires.push(child.name.clone());
        }
        table.visiting.pop();

        for dep in &decomposition.eval_dependencies {
            if !table.eval_dependencies.contains(dep) {
                table.eval_dependencies.push(dep.clone());
            }
        }
        debug!(tool = name, version = %resolved.version, steps = decomposition.steps.len(), "resolved dependency");
        table.memo.insert(memo_key, table.nodes.len());
        table.nodes.push(DependencyNode {
            tool: name.to_string(),
            version: resolved.version,
            recipe_hash: recipe.content_hash()?,
            steps: decomposition.steps,
            requires,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::VersionError;
    use crate::core::recipe::MemoryRecipeLoader;
    use crate::providers::static_list::StaticProvider;
    use crate::testkit::recipe;

    fn loader(recipes: &[&str]) -> MemoryRecipeLoader {
        let mut l = MemoryRecipeLoader::new();
        for r in recipes {
            l.insert(recipe(r));
        }
        l
    }

    fn lib(name: &str, deps: &[&str]) -> String {
        let deps: Vec<String> = deps.iter().map(|d| format!("\"{}\"", d)).collect();
        format!(
            r#"
[metadata]
name = "{name}"
dependencies = [{deps}]

[version]
versions = ["1.0.0", "1.1.0"]

[[steps]]
action = "download_archive"
url = "https://example.com/{name}-{{version}}.tar.gz"
binaries = ["{name}"]
"#,
            name = name,
            deps = deps.join(", ")
        )
    }

    fn resolve(l: &MemoryRecipeLoader, root: &str) -> Result<ResolveTable, KilnError> {
        let versions = VersionResolver::new().with_provider("static", Box::new(StaticProvider));
        let decomposer = Decomposer::default();
        let platform = Platform::new("linux", "amd64").with_family("debian");
        let root = l.load(root).unwrap();
        let vars = TemplateVars::new("1.0.0", "v1.0.0", &platform);
        let d = decomposer
            .decompose(root.name(), &root.steps, &platform, &vars)
            .unwrap();
        let specs = dependency_specs(root.name(), &root.metadata.dependencies, &d).unwrap();
        DependencyResolver::new(l, &versions, &decomposer, &platform).resolve(&root, &specs)
    }

    fn tools(t: &ResolveTable) -> Vec<&str> {
        t.nodes().iter().map(|n| n.tool.as_str()).collect()
    }

    #[test]
    fn test_kl043_explicit_dependencies() {
        let l = loader(&[
            &lib("curl", &["openssl", "zlib"]),
            &lib("openssl", &[]),
            &lib("zlib", &[]),
        ]);
        let t = resolve(&l, "curl").unwrap();
        assert_eq!(tools(&t), vec!["openssl", "zlib"]);
        for node in t.nodes() {
            assert_eq!(node.version, "1.1.0");
            assert!(!node.steps.is_empty());
            assert!(node.recipe_hash.starts_with("blake3:"));
        }
        assert_eq!(
            t.nodes()[0].steps[0].params["url"],
            "https://example.com/openssl-1.1.0.tar.gz"
        );
    }

    #[test]
    fn test_kl043_diamond_deduplicated() {
        let l = loader(&[
            &lib("a", &["b", "c"]),
            &lib("b", &["d"]),
            &lib("c", &["d"]),
            &lib("d", &[]),
        ]);
        let t = resolve(&l, "a").unwrap();
        assert_eq!(tools(&t), vec!["d", "b", "c"]);
        assert_eq!(t.nodes()[1].requires, vec!["d"]);
        assert_eq!(t.nodes()[2].requires, vec!["d"]);
    }

    #[test]
    fn test_kl043_cycle_names_tool() {
        let l = loader(&[&lib("a", &["b"]), &lib("b", &["a"])]);
        match resolve(&l, "a") {
            Err(KilnError::Dependency(DependencyError::Cycle { tool, path })) => {
                assert_eq!(tool, "a");
                assert_eq!(path, vec!["a", "b", "a"]);
            }
            other => panic!("expected cycle, got {:?}", other.map(|t| tools(&t).join(","))),
        }
    }

    #[test]
    fn test_kl043_self_dependency_is_cycle() {
        let l = loader(&[&lib("a", &["a"])]);
        assert!(matches!(
            resolve(&l, "a"),
            Err(KilnError::Dependency(DependencyError::Cycle { .. }))
        ));
    }

    #[test]
    fn test_kl043_missing_recipe_names_parent() {
        let l = loader(&[&lib("a", &["ghost"])]);
        match resolve(&l, "a") {
            Err(KilnError::Dependency(DependencyError::Missing {
                tool, required_by, ..
            })) => {
                assert_eq!(tool, "ghost");
                assert_eq!(required_by, "a");
            }
            _ => panic!("expected missing dependency"),
        }
    }

    #[test]
    fn test_kl043_depth_limit() {
        let l = loader(&[
            &lib("root", &["d1"]),
            &lib("d1", &["d2"]),
            &lib("d2", &["d3"]),
            &lib("d3", &["d4"]),
            &lib("d4", &["d5"]),
            &lib("d5", &["d6"]),
            &lib("d6", &[]),
        ]);
        assert!(matches!(
            resolve(&l, "root"),
            Err(KilnError::Dependency(DependencyError::TooDeep { ref tool, .. })) if tool == "d6"
        ));
        let t = resolve(&l, "d1").unwrap();
        assert_eq!(tools(&t), vec!["d6", "d5", "d4", "d3", "d2"]);
    }

    #[test]
    fn test_kl043_pinned_dependency_version() {
        let l = loader(&[&lib("a", &["b@1.0.0"]), &lib("b", &[])]);
        let t = resolve(&l, "a").unwrap();
        assert_eq!(t.nodes()[0].version, "1.0.0");

        let l = loader(&[&lib("a", &["b@9.9.9"]), &lib("b", &[])]);
        assert!(matches!(
            resolve(&l, "a"),
            Err(KilnError::Version(VersionError::NoMatch { .. }))
        ));
    }

    #[test]
    fn test_kl043_spec_precedence() {
        let d = Decomposition {
            step_dependencies: vec!["zlib".into(), "openssl".into()],
            implicit_dependencies: vec!["rust".into(), "zlib".into(), "tool".into()],
            ..Default::default()
        };
        let specs = dependency_specs("tool", &["openssl@3.2.1".into()], &d).unwrap();
        let pairs: Vec<(&str, &str)> = specs
            .iter()
            .map(|s| (s.name.as_str(), s.constraint.as_str()))
            .collect();
        assert_eq!(pairs, vec![("openssl", "3.2.1"), ("zlib", ""), ("rust", "")]);

        let err = dependency_specs("tool", &["bad name".into()], &d).unwrap_err();
        assert!(matches!(err, DependencyError::InvalidSpec { .. }));
    }

    #[test]
    fn test_kl043_step_scoped_and_implicit() {
        let l = loader(&[
            r#"
[metadata]
name = "tool"

[version]
versions = ["1.0.0"]

[[steps]]
action = "cargo_install"
crate = "tool"

[[steps]]
action = "brew_install"
packages = ["pkg-config"]
dependencies = ["darwin-only"]
"#,
            &lib("rust", &[]),
        ]);
        let t = resolve(&l, "tool").unwrap();
        assert_eq!(tools(&t), vec!["rust"]);
    }

    #[test]
    fn test_kl043_cancelled() {
        let l = loader(&[&lib("a", &["b"]), &lib("b", &[])]);
        let versions = VersionResolver::new().with_provider("static", Box::new(StaticProvider));
        let decomposer = Decomposer::default();
        let platform = Platform::new("linux", "amd64");
        let cancel = CancelToken::new();
        cancel.cancel();
        let root = l.load("a").unwrap();
        let specs = vec![DependencySpec {
            name: "b".into(),
            constraint: String::new(),
        }];
        let err = DependencyResolver::new(&l, &versions, &decomposer, &platform)
            .with_cancel(&cancel)
            .resolve(&root, &specs)
            .unwrap_err();
        assert!(matches!(err, KilnError::Generation(GenerationError::Cancelled)));
    }
}

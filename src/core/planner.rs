//! KL-044: Plan generation.
//!
//! resolve version → decompose root steps → resolve dependencies → capture
//! download checksums → assemble the plan. Install-mode generation with an
//! Exact constraint may instead reuse a valid stored plan. Any failure aborts
//! the whole generation; partial plans are never returned. Fresh install-mode
//! plans are stored for later reuse; eval plans never are.

use super::cache::{cache_decision, CacheDecision, PlanCache, PlanStore};
use super::cancel::CancelToken;
use super::decomposer::Decomposer;
use super::error::{GenerationError, KilnError};
use super::parser::validate_recipe;
use super::recipe::{Recipe, RecipeLoader};
use super::resolver::{dependency_specs, DependencyResolver};
use super::template::{expand, TemplateVars};
use super::types::{InstallationPlan, PlanVerify, Platform, ResolvedStep, PLAN_FORMAT_VERSION};
use super::version::VersionResolver;
use crate::actions::ActionKind;
use crate::fetch::Downloader;
use crate::tripwire::eventlog::now_iso8601;
use crate::tripwire::hasher::checksums_match;
use tracing::{debug, info, warn};

/// Eval semantics always generate fresh; install semantics may reuse a
/// cached plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GenerationMode {
    Eval,
    #[default]
    Install,
}

#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    pub mode: GenerationMode,
    /// Bypass the plan cache unconditionally
    pub force_refresh: bool,
    /// Install eval-time dependencies without asking
    pub auto_accept_eval_deps: bool,
}

impl GenerateOptions {
    pub fn eval() -> Self {
        Self {
            mode: GenerationMode::Eval,
            ..Self::default()
        }
    }

    pub fn install(force_refresh: bool) -> Self {
        Self {
            mode: GenerationMode::Install,
            force_refresh,
            ..Self::default()
        }
    }
}

/// Host-side tools needed only to perform generation.
pub trait EvalDependencyHandler {
    /// The subset of `deps` not present on the generating host.
    fn missing(&self, deps: &[String]) -> Vec<String>;

    /// Install `deps` on the host, or refuse.
    fn install(&self, deps: &[String], auto_accept: bool) -> Result<(), String>;
}

pub struct PlanGenerator<'a> {
    loader: &'a dyn RecipeLoader,
    versions: &'a VersionResolver,
    downloader: &'a dyn Downloader,
    decomposer: Decomposer<'a>,
    store: Option<&'a dyn PlanStore>,
    eval_handler: Option<&'a dyn EvalDependencyHandler>,
    cancel: Option<&'a CancelToken>,
}

impl<'a> PlanGenerator<'a> {
    pub fn new(
        loader: &'a dyn RecipeLoader,
        versions: &'a VersionResolver,
        downloader: &'a dyn Downloader,
    ) -> Self {
        Self {
            loader,
            versions,
            downloader,
            decomposer: Decomposer::default(),
            store: None,
            eval_handler: None,
            cancel: None,
        }
    }

    pub fn with_store(mut self, store: &'a dyn PlanStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_eval_handler(mut self, handler: &'a dyn EvalDependencyHandler) -> Self {
        self.eval_handler = Some(handler);
        self
    }

    pub fn with_cancel(mut self, cancel: &'a CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn check_cancel(&self) -> Result<(), GenerationError> {
        match self.cancel {
            Some(c) if c.is_cancelled() => Err(GenerationError::Cancelled),
            _ => Ok(()),
        }
    }

    /// Load a recipe by name and generate its plan.
    pub fn generate_by_name(
        &self,
        tool: &str,
        constraint: &str,
        platform: &Platform,
        opts: &GenerateOptions,
    ) -> Result<InstallationPlan, KilnError> {
        let recipe = self.loader.load(tool)?;
        self.generate(&recipe, constraint, platform, opts)
    }

    /// Generate a plan for `recipe` at `constraint` on `platform`.
    pub fn generate(
        &self,
        recipe: &Recipe,
        constraint: &str,
        platform: &Platform,
        opts: &GenerateOptions,
    ) -> Result<InstallationPlan, KilnError> {
        self.check_cancel()?;
        let tool = recipe.name();

        let problems = validate_recipe(recipe);
        if !problems.is_empty() {
            let reason: Vec<String> = problems.iter().map(|p| p.to_string()).collect();
            return Err(GenerationError::InvalidRecipe {
                tool: tool.to_string(),
                reason: reason.join("; "),
            }
            .into());
        }
        if !recipe.supports(platform) {
            return Err(GenerationError::UnsupportedPlatform {
                tool: tool.to_string(),
                platform: platform.to_string(),
            }
            .into());
        }

        let recipe_hash = recipe.content_hash()?;
        if let Some(plan) = self.cached(recipe, &recipe_hash, constraint, platform, opts) {
            return Ok(plan);
        }

        let resolved = self.versions.resolve(recipe, constraint)?;
        let vars = TemplateVars::new(&resolved.version, &resolved.tag, platform);
        let decomposition = self
            .decomposer
            .decompose(tool, &recipe.steps, platform, &vars)?;

        let specs = dependency_specs(tool, &recipe.metadata.dependencies, &decomposition)?;
        let mut resolver =
            DependencyResolver::new(self.loader, self.versions, &self.decomposer, platform);
        if let Some(cancel) = self.cancel {
            resolver = resolver.with_cancel(cancel);
        }
        let (mut dependencies, dep_eval) = resolver.resolve(recipe, &specs)?.into_parts();

        let mut eval_deps = decomposition.eval_dependencies.clone();
        for dep in dep_eval {
            if !eval_deps.contains(&dep) {
                eval_deps.push(dep);
            }
        }
        self.report_eval_dependencies(tool, &eval_deps, opts)?;

        let mut steps = decomposition.steps;
        for node in &mut dependencies {
            self.capture_checksums(&node.tool, &mut node.steps)?;
        }
        self.capture_checksums(tool, &mut steps)?;

        let verify = match recipe.verify {
            Some(ref v) => Some(PlanVerify {
                command: expand_verify(tool, &v.command, &vars)?,
                pattern: match v.pattern {
                    Some(ref p) => Some(expand_verify(tool, p, &vars)?),
                    None => None,
                },
            }),
            None => None,
        };

        let mut plan = InstallationPlan {
            format_version: PLAN_FORMAT_VERSION,
            tool: tool.to_string(),
            version: resolved.version,
            platform: platform.clone(),
            generated_at: now_iso8601(),
            recipe_hash,
            recipe_source: recipe.source.clone(),
            deterministic: false,
            steps,
            dependencies,
            verify,
        };
        let deterministic = plan.all_steps().all(|s| s.deterministic);
        plan.deterministic = deterministic;
        info!(
            tool,
            version = %plan.version,
            %platform,
            steps = plan.steps.len(),
            dependencies = plan.dependencies.len(),
            "generated plan"
        );
        if opts.mode == GenerationMode::Install {
            if let Some(store) = self.store {
                PlanCache::new(store).store(&plan);
            }
        }
        Ok(plan)
    }

    /// Valid cached plan, when the mode and constraint allow one.
    fn cached(
        &self,
        recipe: &Recipe,
        recipe_hash: &str,
        constraint: &str,
        platform: &Platform,
        opts: &GenerateOptions,
    ) -> Option<InstallationPlan> {
        if opts.mode == GenerationMode::Eval {
            return None;
        }
        let store = self.store?;
        match cache_decision(constraint, opts.force_refresh) {
            CacheDecision::Consult => {}
            decision => {
                debug!(tool = recipe.name(), constraint, ?decision, "plan cache bypassed");
                return None;
            }
        }
        let plan = PlanCache::new(store).lookup_exact(
            recipe.name(),
            constraint,
            recipe_hash,
            platform,
            PLAN_FORMAT_VERSION,
        )?;
        info!(tool = recipe.name(), version = %plan.version, "reusing cached plan");
        Some(plan)
    }

    fn report_eval_dependencies(
        &self,
        tool: &str,
        deps: &[String],
        opts: &GenerateOptions,
    ) -> Result<(), GenerationError> {
        if deps.is_empty() {
            return Ok(());
        }
        let Some(handler) = self.eval_handler else {
            warn!(tool, ?deps, "generation needs eval-time dependencies; no handler configured");
            return Ok(());
        };
        let missing = handler.missing(deps);
        if missing.is_empty() {
            return Ok(());
        }
        info!(tool, ?missing, "installing eval-time dependencies");
        handler
            .install(&missing, opts.auto_accept_eval_deps)
            .map_err(|reason| GenerationError::EvalDependencies {
                tool: tool.to_string(),
                deps: missing,
                reason,
            })
    }

    /// Fetch every download step once, recording URL, checksum, and size.
    fn capture_checksums(&self, unit: &str, steps: &mut [ResolvedStep]) -> Result<(), GenerationError> {
        for (index, step) in steps.iter_mut().enumerate() {
            if step.action != ActionKind::DownloadFile.name() {
                continue;
            }
            self.check_cancel()?;
            let url = step
                .param_str("url")
                .filter(|u| !u.is_empty())
                .ok_or_else(|| GenerationError::MissingParam {
                    tool: unit.to_string(),
                    step: index,
                    action: step.action.clone(),
                    param: "url".into(),
                })?
                .to_string();
            let artifact = self
                .downloader
                .fetch(&url, None)
                .map_err(|source| GenerationError::Download {
                    url: url.clone(),
                    source,
                })?;
            if let Some(declared) = step.param_str("checksum").filter(|c| !c.is_empty()) {
                if !checksums_match(declared, &artifact.checksum) {
                    return Err(GenerationError::DeclaredChecksumMismatch {
                        url,
                        declared: declared.to_string(),
                        actual: artifact.checksum,
                    });
                }
            }
            debug!(unit, %url, checksum = %artifact.checksum, "captured checksum");
            step.url = Some(url);
            step.checksum = Some(artifact.checksum);
            step.size = Some(artifact.size);
        }
        Ok(())
    }
}

fn expand_verify(tool: &str, input: &str, vars: &TemplateVars) -> Result<String, GenerationError> {
    expand(input, vars).map_err(|e| GenerationError::InvalidRecipe {
        tool: tool.to_string(),
        reason: format!("verify: {}", e),
    })
}

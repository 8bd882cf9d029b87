//! KL-046: Installer — generation, execution, and state persistence.

use super::error::KilnError;
use super::executor::{ExecutionReport, PlanExecutor};
use super::planner::{GenerateOptions, PlanGenerator};
use super::state::{new_state, StateStore};
use super::types::{DependencyNode, InstallationPlan, Platform};
use rustc_hash::FxHashSet;
use tracing::info;

/// A completed installation.
#[derive(Debug, Clone)]
pub struct InstallOutcome {
    pub plan: InstallationPlan,
    pub report: ExecutionReport,
}

pub struct Installer<'a> {
    generator: PlanGenerator<'a>,
    executor: PlanExecutor<'a>,
    state: &'a StateStore,
}

impl<'a> Installer<'a> {
    pub fn new(
        generator: PlanGenerator<'a>,
        executor: PlanExecutor<'a>,
        state: &'a StateStore,
    ) -> Self {
        Self {
            generator,
            executor,
            state,
        }
    }

    /// Fresh plan for any platform. Never consults the plan cache.
    pub fn eval(
        &self,
        tool: &str,
        constraint: &str,
        platform: &Platform,
        auto_accept_eval_deps: bool,
    ) -> Result<InstallationPlan, KilnError> {
        let opts = GenerateOptions {
            auto_accept_eval_deps,
            ..GenerateOptions::eval()
        };
        self.generator
            .generate_by_name(tool, constraint, platform, &opts)
    }

    /// Generate (or reuse) a plan for the host, execute it, record state.
    pub fn install(
        &self,
        tool: &str,
        constraint: &str,
        opts: &GenerateOptions,
    ) -> Result<InstallOutcome, KilnError> {
        let host = self.executor.host().clone();
        let plan = self
            .generator
            .generate_by_name(tool, constraint, &host, opts)?;
        self.install_plan(plan)
    }

    /// Execute an already generated plan and record state.
    pub fn install_plan(&self, plan: InstallationPlan) -> Result<InstallOutcome, KilnError> {
        let report = self.executor.execute(&plan)?;
        for unit in &report.installed {
            let unit_plan = if unit.tool == plan.tool {
                plan.clone()
            } else {
                match plan.dependencies.iter().find(|d| d.tool == unit.tool) {
                    Some(node) => dependency_plan(&plan, node),
                    None => continue,
                }
            };
            self.state.save(&new_state(&unit_plan, &unit.install_dir))?;
        }
        info!(
            tool = %plan.tool,
            version = %plan.version,
            installed = report.installed.len(),
            skipped = report.dependencies_skipped.len(),
            "installation recorded"
        );
        Ok(InstallOutcome { plan, report })
    }
}

/// Standalone plan for one dependency, carrying its transitive dependencies
/// in the parent's order.
pub fn dependency_plan(parent: &InstallationPlan, node: &DependencyNode) -> InstallationPlan {
    let mut needed: FxHashSet<&str> = node.requires.iter().map(String::as_str).collect();
    // parent order is leaves first, so one reverse pass closes the set
    for dep in parent.dependencies.iter().rev() {
        if needed.contains(dep.tool.as_str()) {
            needed.extend(dep.requires.iter().map(String::as_str));
        }
    }
    let dependencies: Vec<DependencyNode> = parent
        .dependencies
        .iter()
        .filter(|d| needed.contains(d.tool.as_str()))
        .cloned()
        .collect();
    let mut plan = InstallationPlan {
        format_version: parent.format_version,
        tool: node.tool.clone(),
        version: node.version.clone(),
        platform: parent.platform.clone(),
        generated_at: parent.generated_at.clone(),
        recipe_hash: node.recipe_hash.clone(),
        recipe_source: String::new(),
        deterministic: false,
        steps: node.steps.clone(),
        dependencies,
        verify: None,
    };
    let deterministic = plan.all_steps().all(|s| s.deterministic);
    plan.deterministic = deterministic;
    plan
}

//! KL-045: Executor — runs a validated plan step by step.
//!
//! validate → dependencies (list order, installed ones skipped) → root steps.
//! Each unit gets a private scratch dir and its own install dir. Downloads are
//! re-verified against the recorded checksum; a mismatch is always fatal.
//! No retries. Cancellation is honored between steps only.

use super::cancel::CancelToken;
use super::error::{
    ChecksumMismatchError, ExecutionError, FetchError, PlanValidationError,
};
use super::state::StateStore;
use super::types::{
    is_path_safe, ExecState, InstallEvent, InstallationPlan, Platform, ResolvedStep,
    PLAN_FORMAT_VERSION,
};
use crate::actions::{contained, ActionKind, ActionRegistry, ExecContext};
use crate::fetch::Downloader;
use crate::tripwire::{eventlog, hasher};
use rustc_hash::FxHashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Upper bound on dependency entries in one plan.
pub const MAX_PLAN_DEPENDENCIES: usize = 100;

// ============================================================================
// Plan validation
// ============================================================================

/// Check a plan against the host before any side effect.
pub fn validate_plan(
    plan: &InstallationPlan,
    host: &Platform,
    registry: &dyn ActionRegistry,
) -> Result<(), PlanValidationError> {
    if plan.format_version != PLAN_FORMAT_VERSION {
        return Err(PlanValidationError::FormatVersion {
            found: plan.format_version,
            supported: PLAN_FORMAT_VERSION,
        });
    }
    let units = std::iter::once((&plan.tool, &plan.version))
        .chain(plan.dependencies.iter().map(|d| (&d.tool, &d.version)));
    for (tool, version) in units {
        for (field, value) in [("tool", tool), ("version", version)] {
            if !is_path_safe(value) {
                return Err(PlanValidationError::UnsafeName {
                    field,
                    value: value.clone(),
                });
            }
        }
    }
    if !plan.platform.runs_on(host) {
        return Err(PlanValidationError::PlatformMismatch {
            plan: plan.platform.to_string(),
            host: host.to_string(),
        });
    }
    if plan.dependencies.len() > MAX_PLAN_DEPENDENCIES {
        return Err(PlanValidationError::TooManyDependencies {
            count: plan.dependencies.len(),
            max: MAX_PLAN_DEPENDENCIES,
        });
    }

    let mut seen: FxHashSet<&str> = FxHashSet::default();
    for node in &plan.dependencies {
        if let Some(missing) = node.requires.iter().find(|r| !seen.contains(r.as_str())) {
            return Err(PlanValidationError::DependencyOrder {
                tool: node.tool.clone(),
                missing: missing.clone(),
            });
        }
        validate_steps(&node.tool, &node.steps, registry)?;
        seen.insert(&node.tool);
    }
    validate_steps(&plan.tool, &plan.steps, registry)
}

fn validate_steps(
    unit: &str,
    steps: &[ResolvedStep],
    registry: &dyn ActionRegistry,
) -> Result<(), PlanValidationError> {
    for (step, s) in steps.iter().enumerate() {
        let fail = |f: fn(String, usize, String) -> PlanValidationError| {
            f(unit.to_string(), step, s.action.clone())
        };
        let Some(kind) = ActionKind::from_name(&s.action) else {
            return Err(fail(|unit, step, action| PlanValidationError::UnknownAction { unit, step, action }));
        };
        if kind.is_composite() {
            return Err(fail(|unit, step, action| PlanValidationError::CompositeAction { unit, step, action }));
        }
        if kind == ActionKind::DownloadFile {
            let missing = if download_url(s).is_none() {
                Some("url")
            } else if s.checksum.as_deref().is_none_or(str::is_empty) {
                Some("checksum")
            } else {
                None
            };
            if let Some(field) = missing {
                return Err(PlanValidationError::IncompleteDownload {
                    unit: unit.to_string(),
                    step,
                    field,
                });
            }
        } else if registry.get(kind).is_none() {
            return Err(fail(|unit, step, action| PlanValidationError::Unregistered { unit, step, action }));
        }
    }
    Ok(())
}

fn download_url(step: &ResolvedStep) -> Option<&str> {
    step.url
        .as_deref()
        .or_else(|| step.param_str("url"))
        .filter(|u| !u.is_empty())
}

/// Destination file name: the `dest` param, else the URL's last segment.
fn download_dest<'a>(step: &'a ResolvedStep, url: &'a str) -> &'a str {
    step.param_str("dest").filter(|d| !d.is_empty()).unwrap_or_else(|| {
        let path = url.split(['?', '#']).next().unwrap_or(url);
        path.rsplit('/').find(|s| !s.is_empty()).unwrap_or("download")
    })
}

// ============================================================================
// Execution
// ============================================================================

/// A unit installed by one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledUnit {
    pub tool: String,
    pub version: String,
    pub install_dir: PathBuf,
}

/// Result of a successful execution.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub state: ExecState,
    pub steps_run: usize,
    /// Dependencies already installed, as `tool@version`
    pub dependencies_skipped: Vec<String>,
    /// Units installed in order, dependencies first, root last
    pub installed: Vec<InstalledUnit>,
    pub duration: Duration,
}

pub struct PlanExecutor<'a> {
    registry: &'a dyn ActionRegistry,
    downloader: &'a dyn Downloader,
    host: Platform,
    tools_dir: PathBuf,
    work_root: PathBuf,
    state: Option<&'a StateStore>,
    cancel: Option<&'a CancelToken>,
}

/// Mutable bookkeeping for one run.
struct Run<'p> {
    plan: &'p InstallationPlan,
    state: ExecState,
    steps_run: usize,
    search_path: Vec<PathBuf>,
}

impl<'a> PlanExecutor<'a> {
    pub fn new(
        registry: &'a dyn ActionRegistry,
        downloader: &'a dyn Downloader,
        host: Platform,
        tools_dir: impl Into<PathBuf>,
        work_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            registry,
            downloader,
            host,
            tools_dir: tools_dir.into(),
            work_root: work_root.into(),
            state: None,
            cancel: None,
        }
    }

    /// Skip installed dependencies and write the event log under the store.
    pub fn with_state(mut self, state: &'a StateStore) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_cancel(mut self, cancel: &'a CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn host(&self) -> &Platform {
        &self.host
    }

    pub fn install_dir(&self, tool: &str, version: &str) -> PathBuf {
        self.tools_dir.join(format!("{}-{}", tool, version))
    }

    fn log(&self, tool: &str, event: InstallEvent) {
        if let Some(store) = self.state {
            if let Err(e) = eventlog::append_event(store.dir(), tool, event) {
                warn!(tool, error = %e, "cannot append install event");
            }
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.is_some_and(CancelToken::is_cancelled)
    }

    /// Execute `plan`. Validation failures abort before any side effect.
    pub fn execute(&self, plan: &InstallationPlan) -> Result<ExecutionReport, ExecutionError> {
        validate_plan(plan, &self.host, self.registry)?;
        let start = Instant::now();
        let mut run = Run {
            plan,
            state: ExecState::Pending,
            steps_run: 0,
            search_path: Vec::new(),
        };
        let mut skipped = Vec::new();
        let mut installed = Vec::new();

        self.log(
            &plan.tool,
            InstallEvent::InstallStarted {
                tool: plan.tool.clone(),
                version: plan.version.clone(),
                platform: plan.platform.to_string(),
                run_id: eventlog::generate_run_id(),
                kiln_version: env!("CARGO_PKG_VERSION").to_string(),
            },
        );
        info!(tool = %plan.tool, version = %plan.version, "executing plan");

        for node in &plan.dependencies {
            if self.cancelled() {
                return Err(ExecutionError::Cancelled {
                    completed: run.steps_run,
                });
            }
            let install_dir = self.install_dir(&node.tool, &node.version);
            if self
                .state
                .is_some_and(|s| s.is_installed(&node.tool, &node.version))
            {
                info!(tool = %node.tool, version = %node.version, "dependency already installed");
                self.log(
                    &plan.tool,
                    InstallEvent::DependencySkipped {
                        tool: node.tool.clone(),
                        version: node.version.clone(),
                    },
                );
                skipped.push(format!("{}@{}", node.tool, node.version));
                run.search_path.push(install_dir.join("bin"));
                continue;
            }
            self.run_unit(&mut run, &node.tool, &node.version, &node.steps, &install_dir)?;
            run.search_path.push(install_dir.join("bin"));
            installed.push(InstalledUnit {
                tool: node.tool.clone(),
                version: node.version.clone(),
                install_dir,
            });
        }

        let install_dir = self.install_dir(&plan.tool, &plan.version);
        self.run_unit(&mut run, &plan.tool, &plan.version, &plan.steps, &install_dir)?;
        installed.push(InstalledUnit {
            tool: plan.tool.clone(),
            version: plan.version.clone(),
            install_dir,
        });

        run.state = ExecState::Succeeded;
        let duration = start.elapsed();
        self.log(
            &plan.tool,
            InstallEvent::InstallCompleted {
                tool: plan.tool.clone(),
                version: plan.version.clone(),
                steps_run: run.steps_run,
                total_seconds: duration.as_secs_f64(),
            },
        );
        info!(tool = %plan.tool, steps = run.steps_run, ?duration, "plan executed");

        Ok(ExecutionReport {
            state: run.state,
            steps_run: run.steps_run,
            dependencies_skipped: skipped,
            installed,
            duration,
        })
    }

    fn run_unit(
        &self,
        run: &mut Run,
        unit: &str,
        version: &str,
        steps: &[ResolvedStep],
        install_dir: &Path,
    ) -> Result<(), ExecutionError> {
        let io = |context: String| move |source| ExecutionError::Io { context, source };
        std::fs::create_dir_all(&self.work_root)
            .map_err(io(format!("create {}", self.work_root.display())))?;
        std::fs::create_dir_all(install_dir)
            .map_err(io(format!("create {}", install_dir.display())))?;
        // tempdir is created 0700 and removed on drop
        let work = tempfile::Builder::new()
            .prefix(&format!("{}-", unit))
            .tempdir_in(&self.work_root)
            .map_err(io(format!("create work dir in {}", self.work_root.display())))?;

        let ctx = ExecContext {
            tool: unit.to_string(),
            version: version.to_string(),
            platform: self.host.clone(),
            work_dir: work.path().to_path_buf(),
            install_dir: install_dir.to_path_buf(),
            search_path: run.search_path.clone(),
        };

        for (index, step) in steps.iter().enumerate() {
            if self.cancelled() {
                info!(unit, step = index, "execution cancelled");
                return Err(ExecutionError::Cancelled {
                    completed: run.steps_run,
                });
            }
            run.state = ExecState::Running {
                unit: unit.to_string(),
                step: index,
            };
            debug!(state = %run.state, action = %step.action, "step started");
            self.log(
                &run.plan.tool,
                InstallEvent::StepStarted {
                    unit: unit.to_string(),
                    step: index,
                    action: step.action.clone(),
                },
            );

            let started = Instant::now();
            match self.run_step(run.plan, &ctx, index, step) {
                Ok(()) => {
                    run.steps_run += 1;
                    self.log(
                        &run.plan.tool,
                        InstallEvent::StepCompleted {
                            unit: unit.to_string(),
                            step: index,
                            action: step.action.clone(),
                            duration_seconds: started.elapsed().as_secs_f64(),
                        },
                    );
                }
                Err(e) => {
                    run.state = ExecState::Failed {
                        unit: unit.to_string(),
                        step: index,
                    };
                    warn!(state = %run.state, error = %e, "step failed");
                    self.log(
                        &run.plan.tool,
                        InstallEvent::StepFailed {
                            unit: unit.to_string(),
                            step: index,
                            action: step.action.clone(),
                            error: e.to_string(),
                        },
                    );
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn run_step(
        &self,
        plan: &InstallationPlan,
        ctx: &ExecContext,
        index: usize,
        step: &ResolvedStep,
    ) -> Result<(), ExecutionError> {
        let kind = ActionKind::from_name(&step.action).ok_or_else(|| {
            PlanValidationError::UnknownAction {
                unit: ctx.tool.clone(),
                step: index,
                action: step.action.clone(),
            }
        })?;
        if kind == ActionKind::DownloadFile {
            return self.download(plan, ctx, index, step);
        }
        let action = self
            .registry
            .get(kind)
            .ok_or_else(|| PlanValidationError::Unregistered {
                unit: ctx.tool.clone(),
                step: index,
                action: step.action.clone(),
            })?;
        action
            .execute(ctx, &step.params)
            .map_err(|source| ExecutionError::Step {
                unit: ctx.tool.clone(),
                step: index,
                action: step.action.clone(),
                source,
            })
    }

    /// Fetch, re-hash, compare, and place the artifact in the work dir.
    fn download(
        &self,
        plan: &InstallationPlan,
        ctx: &ExecContext,
        index: usize,
        step: &ResolvedStep,
    ) -> Result<(), ExecutionError> {
        let download_err = |source: FetchError| ExecutionError::Download {
            unit: ctx.tool.clone(),
            step: index,
            source,
        };
        let (Some(url), Some(expected)) = (download_url(step), step.checksum.as_deref()) else {
            return Err(PlanValidationError::IncompleteDownload {
                unit: ctx.tool.clone(),
                step: index,
                field: "url",
            }
            .into());
        };

        let artifact = self.downloader.fetch(url, Some(expected)).map_err(download_err)?;
        let (actual, _) = hasher::sha256_file(&artifact.path).map_err(|source| {
            ExecutionError::Io {
                context: format!("hash {}", artifact.path.display()),
                source,
            }
        })?;
        if !hasher::checksums_match(expected, &actual) {
            return Err(ChecksumMismatchError {
                tool: plan.tool.clone(),
                version: plan.version.clone(),
                url: url.to_string(),
                expected: hasher::normalize_checksum(expected),
                actual,
            }
            .into());
        }

        let dest = contained(&ctx.work_dir, download_dest(step, url), "dest").map_err(|source| {
            ExecutionError::Step {
                unit: ctx.tool.clone(),
                step: index,
                action: step.action.clone(),
                source,
            }
        })?;
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ExecutionError::Io {
                context: format!("create {}", parent.display()),
                source,
            })?;
        }
        std::fs::copy(&artifact.path, &dest).map_err(|source| ExecutionError::Io {
            context: format!("copy {} to {}", artifact.path.display(), dest.display()),
            source,
        })?;
        debug!(unit = %ctx.tool, %url, dest = %dest.display(), "artifact verified");
        self.log(
            &plan.tool,
            InstallEvent::ChecksumVerified {
                unit: ctx.tool.clone(),
                url: url.to_string(),
                checksum: actual,
            },
        );
        Ok(())
    }
}

//! Test doubles shared by unit tests: recipe fixtures, an in-memory plan
//! store, a scriptable version provider, a fake downloader, and a recording
//! action registry.

use crate::actions::{Action, ActionKind, ActionRegistry, ExecContext};
use crate::core::cache::PlanStore;
use crate::core::error::{ActionError, FetchError, StateError, VersionError};
use crate::core::recipe::{Recipe, VersionSection};
use crate::core::types::{InstallationPlan, Params, Platform, ResolvedStep, PLAN_FORMAT_VERSION};
use crate::core::version::{select_best, ResolvedVersion, VersionProvider};
use crate::fetch::{Downloader, FetchedArtifact};
use crate::tripwire::hasher::sha256_bytes;
use indexmap::IndexMap;
use std::cell::{Cell, RefCell};
use std::path::PathBuf;
use std::rc::Rc;

pub const FZF_URL: &str =
    "https://github.com/junegunn/fzf/releases/download/v0.46.0/fzf-0.46.0-linux_amd64.tar.gz";

pub const FZF_RECIPE: &str = r#"
[metadata]
name = "fzf"
description = "Command-line fuzzy finder"

[version]
source = "fake"

[[steps]]
action = "github_archive"
repo = "junegunn/fzf"
asset_pattern = "fzf-{version}-{os}_{arch}.tar.gz"
binaries = ["fzf"]

[[steps]]
action = "set_env"
vars = { FZF_DEFAULT_OPTS = "--height 40%" }
when = { os = ["darwin"] }

[verify]
command = "fzf --version"
pattern = "{version}"
"#;

pub fn recipe(toml: &str) -> Recipe {
    Recipe::from_toml_str(toml, "test.toml").expect("fixture recipe parses")
}

pub fn linux() -> Platform {
    Platform::new("linux", "amd64")
}

pub fn sample_plan(tool: &str, version: &str) -> InstallationPlan {
    let mut params = Params::new();
    params.insert("url".into(), format!("https://example.com/{}.tar.gz", tool).into());
    params.insert("dest".into(), format!("{}.tar.gz", tool).into());
    InstallationPlan {
        format_version: PLAN_FORMAT_VERSION,
        tool: tool.into(),
        version: version.into(),
        platform: linux(),
        generated_at: "2026-01-01T00:00:00Z".into(),
        recipe_hash: "blake3:0123".into(),
        recipe_source: "test.toml".into(),
        deterministic: true,
        steps: vec![ResolvedStep {
            action: "download_file".into(),
            params,
            evaluable: true,
            deterministic: true,
            url: Some(format!("https://example.com/{}.tar.gz", tool)),
            checksum: Some(sha256_bytes(tool.as_bytes())),
            size: Some(tool.len() as u64),
        }],
        dependencies: vec![],
        verify: None,
    }
}

// ============================================================================
// Plan stores
// ============================================================================

#[derive(Default)]
pub struct MemoryPlanStore {
    plans: RefCell<IndexMap<(String, String), InstallationPlan>>,
}

impl MemoryPlanStore {
    pub fn len(&self) -> usize {
        self.plans.borrow().len()
    }
}

impl PlanStore for MemoryPlanStore {
    fn load_plan(&self, tool: &str, version: &str) -> Result<Option<InstallationPlan>, StateError> {
        Ok(self
            .plans
            .borrow()
            .get(&(tool.to_string(), version.to_string()))
            .cloned())
    }

    fn store_plan(&self, plan: &InstallationPlan) -> Result<(), StateError> {
        self.plans
            .borrow_mut()
            .insert((plan.tool.clone(), plan.version.clone()), plan.clone());
        Ok(())
    }
}

pub struct FailingPlanStore;

impl PlanStore for FailingPlanStore {
    fn load_plan(&self, _: &str, _: &str) -> Result<Option<InstallationPlan>, StateError> {
        Err(StateError::Io {
            path: "/unavailable".into(),
            source: std::io::Error::other("disk unavailable"),
        })
    }

    fn store_plan(&self, _: &InstallationPlan) -> Result<(), StateError> {
        self.load_plan("", "").map(|_| ())
    }
}

// ============================================================================
// Versions
// ============================================================================

/// Provider over a shared, mutable list of upstream versions.
#[derive(Clone, Default)]
pub struct FakeVersions {
    versions: Rc<RefCell<Vec<String>>>,
    calls: Rc<Cell<usize>>,
}

impl FakeVersions {
    pub fn new(versions: &[&str]) -> Self {
        let fake = Self::default();
        fake.set(versions);
        fake
    }

    /// Simulate an upstream release change.
    pub fn set(&self, versions: &[&str]) {
        *self.versions.borrow_mut() = versions.iter().map(|v| v.to_string()).collect();
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }
}

impl VersionProvider for FakeVersions {
    fn resolve(
        &self,
        section: &VersionSection,
        tool: &str,
        constraint: &str,
    ) -> Result<ResolvedVersion, VersionError> {
        self.calls.set(self.calls.get() + 1);
        let versions = self.versions.borrow();
        let best = select_best(versions.iter().map(String::as_str), constraint).ok_or_else(|| {
            VersionError::NoMatch {
                tool: tool.to_string(),
                constraint: constraint.to_string(),
            }
        })?;
        Ok(ResolvedVersion::from_literal(best, section))
    }
}

// ============================================================================
// Downloads
// ============================================================================

/// Serves registered URLs from memory, writing each fetch to a temp dir.
#[derive(Clone)]
pub struct FakeDownloader {
    dir: Rc<tempfile::TempDir>,
    bodies: Rc<RefCell<IndexMap<String, Vec<u8>>>>,
    fetched: Rc<RefCell<Vec<String>>>,
}

impl FakeDownloader {
    pub fn new() -> Self {
        Self {
            dir: Rc::new(tempfile::tempdir().expect("tempdir")),
            bodies: Rc::default(),
            fetched: Rc::default(),
        }
    }

    pub fn serve(&self, url: &str, body: &[u8]) -> &Self {
        self.bodies.borrow_mut().insert(url.to_string(), body.to_vec());
        self
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched.borrow().clone()
    }
}

impl Downloader for FakeDownloader {
    fn fetch(&self, url: &str, _expected: Option<&str>) -> Result<FetchedArtifact, FetchError> {
        self.fetched.borrow_mut().push(url.to_string());
        let bodies = self.bodies.borrow();
        let body = bodies.get(url).ok_or_else(|| FetchError::Http {
            url: url.to_string(),
            status: 404,
        })?;
        let checksum = sha256_bytes(body);
        let path: PathBuf = self.dir.path().join(&checksum);
        std::fs::write(&path, body).map_err(|source| FetchError::Io {
            context: format!("write {}", path.display()),
            source,
        })?;
        Ok(FetchedArtifact {
            path,
            checksum,
            size: body.len() as u64,
        })
    }
}

// ============================================================================
// Actions
// ============================================================================

struct Recorder {
    kind: ActionKind,
    log: Rc<RefCell<Vec<String>>>,
    fail: bool,
}

impl Action for Recorder {
    fn execute(&self, ctx: &ExecContext, _params: &Params) -> Result<(), ActionError> {
        self.log
            .borrow_mut()
            .push(format!("{}:{}", ctx.tool, self.kind.name()));
        if self.fail {
            return Err(ActionError::Command {
                exit_code: 1,
                stderr: format!("{} failed", self.kind.name()),
            });
        }
        Ok(())
    }
}

/// Registry recording `tool:action` for every primitive it runs.
pub struct RecordingActions {
    recorders: Vec<Recorder>,
    log: Rc<RefCell<Vec<String>>>,
}

impl RecordingActions {
    pub fn new() -> Self {
        Self::failing_on(None)
    }

    pub fn failing_on(fail: Option<ActionKind>) -> Self {
        let log: Rc<RefCell<Vec<String>>> = Rc::default();
        let recorders = ActionKind::ALL
            .iter()
            .filter(|k| !k.is_composite() && **k != ActionKind::DownloadFile)
            .map(|&kind| Recorder {
                kind,
                log: Rc::clone(&log),
                fail: fail == Some(kind),
            })
            .collect();
        Self { recorders, log }
    }

    /// Leave `kind` unregistered.
    pub fn without(mut self, kind: ActionKind) -> Self {
        self.recorders.retain(|r| r.kind != kind);
        self
    }

    pub fn log(&self) -> Vec<String> {
        self.log.borrow().clone()
    }
}

impl ActionRegistry for RecordingActions {
    fn get(&self, kind: ActionKind) -> Option<&dyn Action> {
        self.recorders
            .iter()
            .find(|r| r.kind == kind)
            .map(|r| r as &dyn Action)
    }
}

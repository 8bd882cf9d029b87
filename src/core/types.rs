//! KL-001: Plan format, platform, and installed-state types.
//!
//! Everything that crosses a process boundary lives here: the serialized
//! installation plan, the per-tool state lock, and install events. All types
//! derive Serialize/Deserialize so plans roundtrip through JSON and state
//! locks through YAML.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Current plan schema version. Bump on any incompatible schema change.
pub const PLAN_FORMAT_VERSION: u32 = 3;

/// Expanded step parameters. Sorted keys keep serialized plans byte-stable.
pub type Params = BTreeMap<String, serde_json::Value>;

/// Whether a tool name or version can be used as one path component under
/// the kiln root.
pub fn is_path_safe(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains("..")
        && !name.contains(['/', '\\', '\0'])
}

// ============================================================================
// Platform
// ============================================================================

/// A target platform. Absent dimensions act as wildcards when matching.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct Platform {
    /// Operating system (`linux`, `darwin`, `windows`)
    pub os: String,

    /// CPU architecture (`amd64`, `arm64`)
    pub arch: String,

    /// Linux distribution family (`debian`, `rhel`, `alpine`, `arch`, `suse`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linux_family: Option<String>,

    /// C library flavor (`glibc`, `musl`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub libc: Option<String>,
}

impl Platform {
    pub fn new(os: &str, arch: &str) -> Self {
        Self {
            os: os.to_string(),
            arch: arch.to_string(),
            linux_family: None,
            libc: None,
        }
    }

    pub fn with_family(mut self, family: &str) -> Self {
        self.linux_family = Some(family.to_string());
        self
    }

    pub fn with_libc(mut self, libc: &str) -> Self {
        self.libc = Some(libc.to_string());
        self
    }

    /// `"os/arch"` tuple used by `when.platform` and `unsupported_platforms`.
    pub fn tuple(&self) -> String {
        format!("{}/{}", self.os, self.arch)
    }

    /// Whether a plan built for `self` can run on `host`.
    /// OS and arch must match; family and libc only when both sides know them.
    pub fn runs_on(&self, host: &Platform) -> bool {
        fn compatible(a: &Option<String>, b: &Option<String>) -> bool {
            match (a, b) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
        }
        self.os == host.os
            && self.arch == host.arch
            && compatible(&self.linux_family, &host.linux_family)
            && compatible(&self.libc, &host.libc)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.arch)?;
        if let Some(ref family) = self.linux_family {
            write!(f, "/{}", family)?;
        }
        if let Some(ref libc) = self.libc {
            write!(f, " ({})", libc)?;
        }
        Ok(())
    }
}

// ============================================================================
// Installation plan
// ============================================================================

/// A primitive action with fully expanded parameters. Never composite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ResolvedStep {
    /// Primitive action name
    pub action: String,

    /// Expanded parameters (no template placeholders remain)
    #[serde(default)]
    pub params: Params,

    /// Whether the action can be fully reproduced from the plan alone
    pub evaluable: bool,

    /// Whether the action produces identical bytes on every run
    pub deterministic: bool,

    /// Download URL (download steps only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// SHA-256 of the artifact, lowercase hex (download steps only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,

    /// Artifact size in bytes (download steps only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl ResolvedStep {
    /// String parameter accessor.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }
}

/// A resolved dependency, embedded in its parent plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DependencyNode {
    pub tool: String,
    pub version: String,
    pub recipe_hash: String,

    /// Primitive steps for this dependency
    pub steps: Vec<ResolvedStep>,

    /// Direct dependencies of this node (names of earlier entries)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,
}

/// Post-install verification metadata carried from the recipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PlanVerify {
    pub command: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

/// The immutable, authoritative installation spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct InstallationPlan {
    /// Plan schema version
    pub format_version: u32,

    pub tool: String,

    /// Resolved concrete version
    pub version: String,

    /// Platform the steps were decomposed for
    pub platform: Platform,

    /// ISO 8601 generation timestamp
    pub generated_at: String,

    /// `"blake3:{hex}"` of the recipe content
    pub recipe_hash: String,

    /// Where the recipe came from (file path or registry name)
    #[serde(default)]
    pub recipe_source: String,

    /// True when every step (dependencies included) is deterministic
    #[serde(default)]
    pub deterministic: bool,

    pub steps: Vec<ResolvedStep>,

    /// Dependencies, leaves first
    #[serde(default)]
    pub dependencies: Vec<DependencyNode>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify: Option<PlanVerify>,
}

impl InstallationPlan {
    /// BLAKE3 over the functional content of the plan.
    /// Excludes `generated_at` and `recipe_source`, which vary between
    /// otherwise identical generations.
    pub fn content_hash(&self) -> String {
        let mut value = match serde_json::to_value(self) {
            Ok(v) => v,
            Err(_) => return crate::tripwire::hasher::hash_string(""),
        };
        if let Some(obj) = value.as_object_mut() {
            obj.remove("generated_at");
            obj.remove("recipe_source");
        }
        crate::tripwire::hasher::hash_string(&value.to_string())
    }

    /// All steps in execution order: dependencies first, then the tool itself.
    pub fn all_steps(&self) -> impl Iterator<Item = &ResolvedStep> {
        self.dependencies
            .iter()
            .flat_map(|d| d.steps.iter())
            .chain(self.steps.iter())
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

// ============================================================================
// Installed state
// ============================================================================

/// State lock for one installed `(tool, version)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolState {
    /// Schema version (must be "1.0")
    pub schema: String,

    pub tool: String,
    pub version: String,

    /// When the installation completed
    pub installed_at: String,

    /// Generator version string
    pub generator: String,

    /// Where the tool was installed
    pub install_dir: String,

    /// The plan that produced this installation
    pub plan: InstallationPlan,
}

// ============================================================================
// Execution state machine
// ============================================================================

/// Executor state. `Pending → Running(i) → {Running(i+1) | Failed(i) | Succeeded}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecState {
    Pending,
    Running { unit: String, step: usize },
    Failed { unit: String, step: usize },
    Succeeded,
}

impl fmt::Display for ExecState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecState::Pending => write!(f, "pending"),
            ExecState::Running { unit, step } => write!(f, "running {} step {}", unit, step + 1),
            ExecState::Failed { unit, step } => write!(f, "failed {} step {}", unit, step + 1),
            ExecState::Succeeded => write!(f, "succeeded"),
        }
    }
}

// ============================================================================
// Install events
// ============================================================================

/// Install event for the JSONL event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum InstallEvent {
    InstallStarted {
        tool: String,
        version: String,
        platform: String,
        run_id: String,
        kiln_version: String,
    },
    StepStarted {
        unit: String,
        step: usize,
        action: String,
    },
    StepCompleted {
        unit: String,
        step: usize,
        action: String,
        duration_seconds: f64,
    },
    StepFailed {
        unit: String,
        step: usize,
        action: String,
        error: String,
    },
    ChecksumVerified {
        unit: String,
        url: String,
        checksum: String,
    },
    DependencySkipped {
        tool: String,
        version: String,
    },
    InstallCompleted {
        tool: String,
        version: String,
        steps_run: usize,
        total_seconds: f64,
    },
}

/// Timestamped wrapper for events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub ts: String,
    #[serde(flatten)]
    pub event: InstallEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_plan() -> InstallationPlan {
        let mut params = Params::new();
        params.insert("url".into(), "https://example.com/t.tar.gz".into());
        params.insert("dest".into(), "t.tar.gz".into());
        InstallationPlan {
            format_version: PLAN_FORMAT_VERSION,
            tool: "t".into(),
            version: "1.0.0".into(),
            platform: Platform::new("linux", "amd64").with_family("debian"),
            generated_at: "2026-03-01T10:00:00Z".into(),
            recipe_hash: "blake3:aa".into(),
            recipe_source: "recipes/t.toml".into(),
            deterministic: true,
            steps: vec![ResolvedStep {
                action: "download_file".into(),
                params,
                evaluable: true,
                deterministic: true,
                url: Some("https://example.com/t.tar.gz".into()),
                checksum: Some("ab".repeat(32)),
                size: Some(42),
            }],
            dependencies: vec![],
            verify: Some(PlanVerify {
                command: "t --version".into(),
                pattern: Some("{version}".into()),
            }),
        }
    }

    #[test]
    fn test_kl001_plan_json_roundtrip() {
        let plan = sample_plan();
        let json = plan.to_json_pretty().unwrap();
        let parsed = InstallationPlan::from_json(&json).unwrap();
        assert_eq!(parsed, plan);
    }

    #[test]
    fn test_kl001_plan_json_keys_stable() {
        let a = serde_json::to_string(&sample_plan()).unwrap();
        let b = serde_json::to_string(&sample_plan()).unwrap();
        assert_eq!(a, b);
        assert!(a.find("\"dest\"").unwrap() < a.find("\"url\"").unwrap());
    }

    #[test]
    fn test_kl001_path_safe_names() {
        for ok in ["fzf", "0.46.0", "python-standalone", "1.2.0-rc1", "jq_1"] {
            assert!(is_path_safe(ok), "{ok}");
        }
        for bad in ["", ".", "..", "../etc", "a/b", "a\\b", ".hidden", "1..2", "x\0y"] {
            assert!(!is_path_safe(bad), "{bad:?}");
        }
    }

    #[test]
    fn test_kl001_content_hash_ignores_timestamp_and_source() {
        let a = sample_plan();
        let mut b = sample_plan();
        b.generated_at = "2030-01-01T00:00:00Z".into();
        b.recipe_source = "elsewhere".into();
        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn test_kl001_content_hash_tracks_steps() {
        let a = sample_plan();
        let mut b = sample_plan();
        b.steps[0].checksum = Some("cd".repeat(32));
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn test_kl001_platform_display() {
        assert_eq!(Platform::new("darwin", "arm64").to_string(), "darwin/arm64");
        let p = Platform::new("linux", "amd64")
            .with_family("alpine")
            .with_libc("musl");
        assert_eq!(p.to_string(), "linux/amd64/alpine (musl)");
        assert_eq!(p.tuple(), "linux/amd64");
    }

    #[test]
    fn test_kl001_platform_runs_on() {
        let plan = Platform::new("linux", "amd64").with_family("debian");
        assert!(plan.runs_on(&Platform::new("linux", "amd64").with_family("debian")));
        assert!(plan.runs_on(&Platform::new("linux", "amd64")));
        assert!(!plan.runs_on(&Platform::new("linux", "amd64").with_family("alpine")));
        assert!(!plan.runs_on(&Platform::new("linux", "arm64")));
        assert!(!plan.runs_on(&Platform::new("darwin", "amd64")));
    }

    #[test]
    fn test_kl001_platform_optional_dims_skipped() {
        let json = serde_json::to_string(&Platform::new("linux", "amd64")).unwrap();
        assert_eq!(json, r#"{"os":"linux","arch":"amd64"}"#);
    }

    #[test]
    fn test_kl001_event_serde() {
        let te = TimestampedEvent {
            ts: "2026-03-01T10:00:00Z".into(),
            event: InstallEvent::StepStarted {
                unit: "t".into(),
                step: 0,
                action: "extract".into(),
            },
        };
        let json = serde_json::to_string(&te).unwrap();
        assert!(json.contains("\"event\":\"step_started\""));
        assert!(json.contains("\"action\":\"extract\""));
    }

    #[test]
    fn test_kl001_exec_state_display() {
        let s = ExecState::Failed {
            unit: "jq".into(),
            step: 2,
        };
        assert_eq!(s.to_string(), "failed jq step 3");
    }

    #[test]
    fn test_kl001_all_steps_order() {
        let mut plan = sample_plan();
        plan.dependencies.push(DependencyNode {
            tool: "zlib".into(),
            version: "1.3".into(),
            recipe_hash: "blake3:bb".into(),
            steps: vec![ResolvedStep {
                action: "chmod".into(),
                params: Params::new(),
                evaluable: true,
                deterministic: true,
                url: None,
                checksum: None,
                size: None,
            }],
            requires: vec![],
        });
        let actions: Vec<_> = plan.all_steps().map(|s| s.action.as_str()).collect();
        assert_eq!(actions, vec!["chmod", "download_file"]);
    }
}

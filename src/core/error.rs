//! KL-002: Error taxonomy for generation, resolution, caching, and execution.
//!
//! Every category is fatal except [`CacheValidationError`], which callers
//! recover from locally by regenerating.

use thiserror::Error;

/// Errors from template substitution inside a single string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum TemplateError {
    /// A `{` was never closed.
    #[error("unterminated variable starting at byte {offset}")]
    Unterminated {
        /// Byte offset of the opening brace.
        offset: usize,
    },

    /// The variable name is not in the known set.
    #[error("unknown variable '{name}'")]
    UnknownVariable { name: String },

    /// The transform name is not in the known set.
    #[error("unknown transform '{name}'")]
    UnknownTransform { name: String },

    /// Transforms only apply to `version`.
    #[error("transform '{transform}' cannot be applied to '{variable}'")]
    TransformNotAllowed { variable: String, transform: String },

    /// The transform could not interpret the version string.
    #[error("transform '{transform}' cannot parse version '{version}'")]
    TransformFailed { transform: String, version: String },

    /// The variable is known but has no value for the target platform.
    #[error("variable '{name}' is not available for the target platform")]
    Unavailable { name: String },
}

/// Recipe loading and parsing errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RecipeError {
    #[error("recipe not found: {name}")]
    NotFound { name: String },

    #[error("cannot read recipe {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid recipe {path}: {message}")]
    Parse { path: String, message: String },

    #[error("cannot hash recipe '{name}': {message}")]
    Hash { name: String, message: String },
}

/// Fatal plan generation errors. Never yields a partial plan.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GenerationError {
    #[error("invalid recipe '{tool}': {reason}")]
    InvalidRecipe { tool: String, reason: String },

    #[error("{tool}: step {} uses unknown action '{action}'", .step + 1)]
    UnknownAction {
        tool: String,
        /// Zero-based recipe step index.
        step: usize,
        action: String,
    },

    #[error("{tool}: step {} ({action}): {source}", .step + 1)]
    Template {
        tool: String,
        step: usize,
        action: String,
        #[source]
        source: TemplateError,
    },

    #[error("{tool}: step {} ({action}) is missing required parameter '{param}'", .step + 1)]
    MissingParam {
        tool: String,
        step: usize,
        action: String,
        param: String,
    },

    #[error("{tool}: step {} ({action}) has invalid parameter '{param}': {reason}", .step + 1)]
    InvalidParam {
        tool: String,
        step: usize,
        action: String,
        param: String,
        reason: String,
    },

    /// A composite expanded back into itself.
    #[error("{tool}: step {}: composite action cycle {}", .step + 1, .chain.join(" -> "))]
    DecompositionCycle {
        tool: String,
        step: usize,
        chain: Vec<String>,
    },

    #[error("{tool} does not support platform {platform}")]
    UnsupportedPlatform { tool: String, platform: String },

    #[error("cannot fetch {url}: {source}")]
    Download {
        url: String,
        #[source]
        source: FetchError,
    },

    /// The recipe pins a checksum the upstream artifact no longer matches.
    #[error("declared checksum for {url} does not match upstream (declared {declared}, got {actual})")]
    DeclaredChecksumMismatch {
        url: String,
        declared: String,
        actual: String,
    },

    #[error("eval-time dependencies {deps:?} for {tool} were not installed: {reason}")]
    EvalDependencies {
        tool: String,
        deps: Vec<String>,
        reason: String,
    },

    #[error("plan generation cancelled")]
    Cancelled,
}

/// Dependency graph errors. Always name the offending tool.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DependencyError {
    #[error("dependency '{tool}' required by '{required_by}' has no recipe: {source}")]
    Missing {
        tool: String,
        required_by: String,
        #[source]
        source: RecipeError,
    },

    /// `tool` is the name that closed the cycle.
    #[error("dependency cycle closed by '{tool}': {}", .path.join(" -> "))]
    Cycle { tool: String, path: Vec<String> },

    #[error("dependency '{tool}' exceeds maximum depth {max}")]
    TooDeep { tool: String, max: usize },

    #[error("dependency '{tool}': invalid spec '{spec}'")]
    InvalidSpec { tool: String, spec: String },
}

/// Network failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    Timeout,
    Dns,
    Connection,
    Tls,
    RateLimit,
    Other,
}

impl std::fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NetworkErrorKind::Timeout => "timeout",
            NetworkErrorKind::Dns => "dns",
            NetworkErrorKind::Connection => "connection",
            NetworkErrorKind::Tls => "tls",
            NetworkErrorKind::RateLimit => "rate limit",
            NetworkErrorKind::Other => "network",
        };
        f.write_str(s)
    }
}

/// Version resolution errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum VersionError {
    /// Provider could not be reached. Callers may retry.
    #[error("{source_name}: {kind} error: {message}")]
    Network {
        source_name: String,
        kind: NetworkErrorKind,
        message: String,
    },

    /// Provider answered but nothing satisfies the constraint.
    #[error("{tool}: no version matches '{constraint}'")]
    NoMatch { tool: String, constraint: String },

    #[error("{tool}: unknown version source '{source_name}'")]
    UnknownSource { tool: String, source_name: String },

    #[error("{source_name}: invalid response: {message}")]
    InvalidResponse { source_name: String, message: String },

    #[error("{tool}: version source is misconfigured: {message}")]
    Misconfigured { tool: String, message: String },
}

impl VersionError {
    /// Network-class failure (as opposed to a definitive answer).
    pub fn is_network(&self) -> bool {
        matches!(self, VersionError::Network { .. })
    }
}

/// Reasons a stored plan is not reusable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum CacheValidationError {
    #[error("plan format version {found} != current {current}")]
    FormatVersion { found: u32, current: u32 },

    #[error("plan platform {found} != current {current}")]
    Platform { found: String, current: String },

    #[error("plan recipe hash {found} != current {current}")]
    RecipeHash { found: String, current: String },
}

/// A downloaded artifact does not match the checksum recorded in the plan.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "checksum mismatch for {url}\n\n\
     Expected: {expected}\n\
     Got:      {actual}\n\n\
     The upstream artifact has changed since the installation plan was generated.\n\
     This could indicate:\n  \
     - a legitimate re-tagged release\n  \
     - a supply chain attack (malicious modification)\n\n\
     To accept the new artifact, regenerate the plan:\n    \
     kiln install {tool}@{version} --refresh"
)]
pub struct ChecksumMismatchError {
    pub tool: String,
    pub version: String,
    pub url: String,
    pub expected: String,
    pub actual: String,
}

/// Artifact fetch errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FetchError {
    #[error("{url}: HTTP {status}")]
    Http { url: String, status: u16 },

    #[error("{url}: {kind} error: {message}")]
    Network {
        url: String,
        kind: NetworkErrorKind,
        message: String,
    },

    #[error("unsupported URL scheme: {url}")]
    UnsupportedScheme { url: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from a primitive action's execution contract.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ActionError {
    #[error("missing parameter '{param}'")]
    MissingParam { param: String },

    #[error("invalid parameter '{param}': {reason}")]
    InvalidParam { param: String, reason: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command exited with {exit_code}: {stderr}")]
    Command { exit_code: i32, stderr: String },

    #[error("{0}")]
    Unsupported(String),
}

impl ActionError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        ActionError::Io {
            context: context.into(),
            source,
        }
    }
}

/// Plan validation failures detected before any side effect.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum PlanValidationError {
    #[error("unsupported plan format version {found} (supported: {supported})")]
    FormatVersion { found: u32, supported: u32 },

    #[error("plan targets {plan} but host is {host}")]
    PlatformMismatch { plan: String, host: String },

    #[error("{unit}: step {} uses unknown action '{action}'", .step + 1)]
    UnknownAction {
        unit: String,
        step: usize,
        action: String,
    },

    #[error("{unit}: step {} uses composite action '{action}'", .step + 1)]
    CompositeAction {
        unit: String,
        step: usize,
        action: String,
    },

    #[error("{unit}: step {} ({action}) has no registered implementation", .step + 1)]
    Unregistered {
        unit: String,
        step: usize,
        action: String,
    },

    #[error("{unit}: download step {} has no {field}", .step + 1)]
    IncompleteDownload {
        unit: String,
        step: usize,
        field: &'static str,
    },

    /// Tool names and versions become directory names.
    #[error("plan {field} '{value}' is not a plain file name")]
    UnsafeName { field: &'static str, value: String },

    #[error("plan has {count} dependencies (max {max})")]
    TooManyDependencies { count: usize, max: usize },

    #[error("dependency '{tool}' requires '{missing}', which is not installed earlier in the plan")]
    DependencyOrder { tool: String, missing: String },
}

/// Execution errors. Abort all remaining steps.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExecutionError {
    #[error("invalid plan: {0}")]
    InvalidPlan(#[from] PlanValidationError),

    #[error(transparent)]
    ChecksumMismatch(#[from] ChecksumMismatchError),

    #[error("{unit}: step {} ({action}) failed: {source}", .step + 1)]
    Step {
        unit: String,
        step: usize,
        action: String,
        #[source]
        source: ActionError,
    },

    #[error("{unit}: step {} download failed: {source}", .step + 1)]
    Download {
        unit: String,
        step: usize,
        #[source]
        source: FetchError,
    },

    #[error("execution cancelled after {completed} steps")]
    Cancelled { completed: usize },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// State store errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StateError {
    #[error("cannot access {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid state file {path}: {message}")]
    Corrupt { path: String, message: String },
}

/// Top-level error for the public entry points.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KilnError {
    #[error(transparent)]
    Recipe(#[from] RecipeError),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Dependency(#[from] DependencyError),

    #[error(transparent)]
    Version(#[from] VersionError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("cannot access {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid plan {path}: {source}")]
    PlanFile {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{path}: {source}")]
    PlanCheck {
        path: String,
        #[source]
        source: PlanValidationError,
    },

    #[error("invalid {path}: {source}")]
    ConfigFile {
        path: String,
        #[source]
        source: serde_yaml_ng::Error,
    },

    #[error("cannot serialize output: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Usage and environment problems with no underlying cause.
    #[error("{0}")]
    Config(String),
}

impl KilnError {
    pub fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        KilnError::Io {
            path: path.display().to_string(),
            source,
        }
    }

    /// The checksum mismatch carried by this error, if any.
    pub fn checksum_mismatch(&self) -> Option<&ChecksumMismatchError> {
        match self {
            KilnError::Execution(ExecutionError::ChecksumMismatch(e)) => Some(e),
            _ => None,
        }
    }
}

//! KL-040: Version constraints and resolution.
//!
//! A constraint is Exact (a pinned literal, optionally `v`-prefixed) or
//! Dynamic (empty, `latest`, wildcards, ranges). Exact constraints are what
//! make a plan cacheable. Resolution delegates to a [`VersionProvider`]
//! selected by the recipe's declared version source.

use super::error::VersionError;
use super::recipe::{Recipe, VersionSection};
use indexmap::IndexMap;
use std::cmp::Ordering;
use tracing::{debug, warn};

/// Fallback version for sourceless recipes with a dynamic constraint.
pub const DEV_VERSION: &str = "dev";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    Exact,
    Dynamic,
}

const RANGE_CHARS: &[char] = &['*', '^', '~', '<', '>', '=', ',', '|', ' '];

/// Classify a user-supplied constraint.
pub fn classify_constraint(constraint: &str) -> ConstraintKind {
    let c = constraint.trim();
    if c.is_empty() || c.eq_ignore_ascii_case("latest") || c.contains(RANGE_CHARS) {
        return ConstraintKind::Dynamic;
    }
    if strip_v(c).split('.').any(|seg| seg.eq_ignore_ascii_case("x")) {
        return ConstraintKind::Dynamic;
    }
    ConstraintKind::Exact
}

/// Strip one leading `v`/`V` when followed by a digit.
pub fn strip_v(s: &str) -> &str {
    match s.strip_prefix(['v', 'V']) {
        Some(rest) if rest.starts_with(|c: char| c.is_ascii_digit()) => rest,
        _ => s,
    }
}

/// Spellings under which an Exact constraint may have been stored: the
/// literal without `v`, then a plain numeric literal zero-padded to three
/// components.
pub fn exact_forms(constraint: &str) -> Vec<String> {
    let literal = strip_v(constraint.trim());
    let mut forms = vec![literal.to_string()];
    let parts: Option<Vec<u64>> = literal.split('.').map(|seg| seg.parse().ok()).collect();
    if let Some(mut parts) = parts.filter(|p| p.len() < 3) {
        parts.resize(3, 0);
        let padded: Vec<String> = parts.iter().map(u64::to_string).collect();
        forms.push(padded.join("."));
    }
    forms
}

// ============================================================================
// Versions
// ============================================================================

/// A parsed dotted version with an optional pre-release tag.
#[derive(Debug, Clone, Eq)]
pub struct Version {
    parts: Vec<u64>,
    pre: Option<String>,
}

impl Version {
    pub fn parse(s: &str) -> Option<Self> {
        let s = strip_v(s.trim());
        let s = s.split('+').next().unwrap_or(s);
        let (core, pre) = match s.split_once('-') {
            Some((c, p)) => (c, Some(p.to_string())),
            None => (s, None),
        };
        let parts = core
            .split('.')
            .map(|seg| seg.parse::<u64>().ok())
            .collect::<Option<Vec<_>>>()?;
        if parts.is_empty() {
            return None;
        }
        Some(Self { parts, pre })
    }

    pub fn is_prerelease(&self) -> bool {
        self.pre.is_some()
    }

    fn part(&self, i: usize) -> u64 {
        self.parts.get(i).copied().unwrap_or(0)
    }

    fn from_parts(parts: Vec<u64>) -> Self {
        Self { parts, pre: None }
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.parts.len().max(other.parts.len());
        for i in 0..len {
            match self.part(i).cmp(&other.part(i)) {
                Ordering::Equal => {}
                ord => return ord,
            }
        }
        match (&self.pre, &other.pre) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

/// Compare two version strings; unparsable strings sort lowest.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    match (Version::parse(a), Version::parse(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => a.cmp(b),
    }
}

// ============================================================================
// Constraint matching
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Comparator {
    Any,
    Eq(Version),
    Gt(Version),
    Ge(Version),
    Lt(Version),
    Le(Version),
    /// Leading segments that must match exactly (`1.2.*`, `1.x`)
    Prefix(Vec<u64>),
}

impl Comparator {
    fn matches(&self, v: &Version) -> bool {
        match self {
            Comparator::Any => true,
            Comparator::Eq(x) => v == x,
            Comparator::Gt(x) => v > x,
            Comparator::Ge(x) => v >= x,
            Comparator::Lt(x) => v < x,
            Comparator::Le(x) => v <= x,
            Comparator::Prefix(p) => p.iter().enumerate().all(|(i, n)| v.part(i) == *n),
        }
    }
}

/// Expand one token (`^1.2`, `>=1.0`, `1.2.*`) into comparators.
fn parse_token(token: &str) -> Option<Vec<Comparator>> {
    let token = token.trim();
    if token.is_empty() || token == "*" || token.eq_ignore_ascii_case("latest") {
        return Some(vec![Comparator::Any]);
    }
    let operators: [(&str, fn(Version) -> Comparator); 5] = [
        (">=", Comparator::Ge),
        ("<=", Comparator::Le),
        (">", Comparator::Gt),
        ("<", Comparator::Lt),
        ("=", Comparator::Eq),
    ];
    for (op, ctor) in operators {
        if let Some(rest) = token.strip_prefix(op) {
            return Some(vec![ctor(Version::parse(rest)?)]);
        }
    }
    if let Some(rest) = token.strip_prefix('^') {
        let base = Version::parse(rest)?;
        let upper = match (base.part(0), base.part(1)) {
            (0, 0) if base.parts.len() >= 3 => vec![0, 0, base.part(2).saturating_add(1)],
            (0, minor) if base.parts.len() >= 2 => vec![0, minor.saturating_add(1)],
            (major, _) => vec![major.saturating_add(1)],
        };
        return Some(vec![
            Comparator::Ge(base),
            Comparator::Lt(Version::from_parts(upper)),
        ]);
    }
    if let Some(rest) = token.strip_prefix('~') {
        let base = Version::parse(rest)?;
        let upper = if base.parts.len() >= 2 {
            vec![base.part(0), base.part(1).saturating_add(1)]
        } else {
            vec![base.part(0).saturating_add(1)]
        };
        return Some(vec![
            Comparator::Ge(base),
            Comparator::Lt(Version::from_parts(upper)),
        ]);
    }

    let body = strip_v(token);
    if body.split('.').any(|s| s == "*" || s.eq_ignore_ascii_case("x")) {
        let mut prefix = Vec::new();
        for seg in body.split('.') {
            if seg == "*" || seg.eq_ignore_ascii_case("x") {
                break;
            }
            prefix.push(seg.parse().ok()?);
        }
        return Some(vec![Comparator::Prefix(prefix)]);
    }
    Some(vec![Comparator::Eq(Version::parse(body)?)])
}

/// Parse a full constraint: `||` alternatives of comma/space-joined comparators.
fn parse_constraint(constraint: &str) -> Option<Vec<Vec<Comparator>>> {
    constraint
        .split("||")
        .map(|alt| {
            let mut comparators = Vec::new();
            for part in alt.split(',') {
                let mut pending = String::new();
                for word in part.split_whitespace() {
                    pending.push_str(word);
                    if word.chars().all(|c| "<>=^~".contains(c)) {
                        continue;
                    }
                    comparators.extend(parse_token(&pending)?);
                    pending.clear();
                }
                if !pending.is_empty() {
                    return None;
                }
            }
            if comparators.is_empty() {
                comparators.push(Comparator::Any);
            }
            Some(comparators)
        })
        .collect()
}

/// Whether a version string satisfies a constraint. Pre-releases only
/// satisfy constraints that name them exactly.
pub fn matches_constraint(version: &str, constraint: &str) -> bool {
    let Some(v) = Version::parse(version) else {
        return strip_v(version) == strip_v(constraint.trim());
    };
    let Some(alternatives) = parse_constraint(constraint) else {
        return false;
    };
    alternatives.iter().any(|all| {
        let names_prerelease = all
            .iter()
            .any(|c| matches!(c, Comparator::Eq(x) if x.is_prerelease()));
        (!v.is_prerelease() || names_prerelease) && all.iter().all(|c| c.matches(&v))
    })
}

/// Highest candidate satisfying the constraint.
pub fn select_best<'a, I>(candidates: I, constraint: &str) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    let candidates: Vec<&str> = candidates.into_iter().collect();
    if classify_constraint(constraint) == ConstraintKind::Exact {
        let wanted = strip_v(constraint.trim());
        if let Some(hit) = candidates.iter().find(|c| strip_v(c) == wanted) {
            return Some(*hit);
        }
    }
    candidates
        .into_iter()
        .filter(|c| matches_constraint(c, constraint))
        .max_by(|a, b| compare_versions(a, b))
}

// ============================================================================
// Providers
// ============================================================================

/// A concrete version and the upstream tag it was published under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedVersion {
    pub version: String,
    pub tag: String,
}

impl ResolvedVersion {
    /// Version from a tag or literal, tag rebuilt with the section's prefix.
    pub fn from_literal(literal: &str, section: &VersionSection) -> Self {
        let version = strip_v(literal.trim()).to_string();
        let prefix = section.tag_prefix.as_deref().unwrap_or("v");
        Self {
            tag: format!("{}{}", prefix, version),
            version,
        }
    }

    fn dev() -> Self {
        Self {
            version: DEV_VERSION.to_string(),
            tag: DEV_VERSION.to_string(),
        }
    }
}

/// One upstream ecosystem's version lookup.
pub trait VersionProvider {
    fn resolve(
        &self,
        section: &VersionSection,
        tool: &str,
        constraint: &str,
    ) -> Result<ResolvedVersion, VersionError>;
}

/// Registry of providers keyed by source name.
#[derive(Default)]
pub struct VersionResolver {
    providers: IndexMap<String, Box<dyn VersionProvider>>,
}

impl VersionResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(mut self, name: &str, provider: Box<dyn VersionProvider>) -> Self {
        self.providers.insert(name.to_string(), provider);
        self
    }

    pub fn source_names(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }

    /// Declared source, or one inferred from the section's fields.
    fn source_of(section: &VersionSection) -> Option<&str> {
        if let Some(ref s) = section.source {
            return Some(s);
        }
        if section.github_repo.is_some() {
            Some("github_releases")
        } else if !section.versions.is_empty() {
            Some("static")
        } else {
            None
        }
    }

    /// Resolve `constraint` for a recipe.
    pub fn resolve(&self, recipe: &Recipe, constraint: &str) -> Result<ResolvedVersion, VersionError> {
        let tool = recipe.name();
        let section = &recipe.version;
        let Some(source) = Self::source_of(section) else {
            return Ok(match classify_constraint(constraint) {
                ConstraintKind::Exact => ResolvedVersion::from_literal(constraint, section),
                ConstraintKind::Dynamic => {
                    warn!(tool, constraint, "recipe has no version source; using '{}'", DEV_VERSION);
                    ResolvedVersion::dev()
                }
            });
        };
        let provider = self
            .providers
            .get(source)
            .ok_or_else(|| VersionError::UnknownSource {
                tool: tool.to_string(),
                source_name: source.to_string(),
            })?;
        let resolved = provider.resolve(section, tool, constraint)?;
        debug!(tool, constraint, source, version = %resolved.version, "resolved version");
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_kl040_classify() {
        for c in ["0.46.0", "v0.46.0", "1.2", "2024.01.15", "1.0.0-rc1"] {
            assert_eq!(classify_constraint(c), ConstraintKind::Exact, "{c}");
        }
        for c in ["", "latest", "LATEST", "1.2.*", "1.x", "^1.2", "~1.2", ">=1.0, <2.0", "1 || 2"] {
            assert_eq!(classify_constraint(c), ConstraintKind::Dynamic, "{c}");
        }
    }

    #[test]
    fn test_kl040_version_ordering() {
        assert_eq!(compare_versions("1.10.0", "1.9.9"), Ordering::Greater);
        assert_eq!(compare_versions("v1.2", "1.2.0"), Ordering::Equal);
        assert_eq!(compare_versions("1.0.0-rc1", "1.0.0"), Ordering::Less);
        assert_eq!(compare_versions("garbage", "0.0.1"), Ordering::Less);
    }

    #[test]
    fn test_kl040_matches() {
        assert!(matches_constraint("1.2.3", "1.2.3"));
        assert!(matches_constraint("1.2.3", "v1.2.3"));
        assert!(matches_constraint("1.2.7", "1.2.*"));
        assert!(!matches_constraint("1.3.0", "1.2.*"));
        assert!(matches_constraint("1.9.0", "1.x"));
        assert!(matches_constraint("1.4.0", "^1.2"));
        assert!(!matches_constraint("2.0.0", "^1.2"));
        assert!(matches_constraint("0.2.9", "^0.2.1"));
        assert!(!matches_constraint("0.3.0", "^0.2.1"));
        assert!(matches_constraint("1.2.9", "~1.2.3"));
        assert!(!matches_constraint("1.3.0", "~1.2.3"));
        assert!(matches_constraint("1.5.0", ">=1.0, <2.0"));
        assert!(matches_constraint("1.5.0", ">= 1.0 < 2.0"));
        assert!(!matches_constraint("2.0.0", ">=1.0, <2.0"));
        assert!(matches_constraint("3.1.0", "^1.0 || ^3.0"));
        assert!(matches_constraint("9.9.9", "latest"));
        assert!(!matches_constraint("2.0.0-beta", "latest"));
        assert!(matches_constraint("2.0.0-beta", "2.0.0-beta"));
        assert!(!matches_constraint("1.0.0", ">= "));
    }

    #[test]
    fn test_kl040_select_best() {
        let versions = ["1.0.0", "1.2.0", "1.10.0", "2.0.0-rc1", "0.9.0"];
        assert_eq!(select_best(versions, ""), Some("1.10.0"));
        assert_eq!(select_best(versions, "1.2.*"), Some("1.2.0"));
        assert_eq!(select_best(versions, "<1.0"), Some("0.9.0"));
        assert_eq!(select_best(versions, "v1.0.0"), Some("1.0.0"));
        assert_eq!(select_best(versions, "3.0.0"), None);
        assert_eq!(select_best(["2024-01-15"], "2024-01-15"), Some("2024-01-15"));
    }

    #[test]
    fn test_kl040_exact_forms() {
        assert_eq!(exact_forms("v1.2"), vec!["1.2", "1.2.0"]);
        assert_eq!(exact_forms("3"), vec!["3", "3.0.0"]);
        assert_eq!(exact_forms("1.2-rc1"), vec!["1.2-rc1"]);
        assert_eq!(exact_forms(" 0.46.0 "), vec!["0.46.0"]);
        assert_eq!(exact_forms("2024-01-15"), vec!["2024-01-15"]);
    }

    #[test]
    fn test_kl040_bounds_saturate_at_max() {
        let max = u64::MAX;
        assert!(!matches_constraint("0.0.1", &format!("^0.0.{max}")));
        assert!(!matches_constraint("0.1.0", &format!("^0.{max}")));
        assert!(!matches_constraint("1.2.0", &format!("~1.{max}")));
        assert!(!matches_constraint("2.0.0", &format!("~{max}")));
        assert!(matches_constraint(&format!("{max}.0.0"), &format!(">={max}")));
    }

    fn recipe(version_toml: &str) -> Recipe {
        Recipe::from_toml_str(
            &format!("[metadata]\nname = \"t\"\n{}\n", version_toml),
            "t.toml",
        )
        .unwrap()
    }

    struct Fixed(&'static str);

    impl VersionProvider for Fixed {
        fn resolve(
            &self,
            section: &VersionSection,
            _tool: &str,
            _constraint: &str,
        ) -> Result<ResolvedVersion, VersionError> {
            Ok(ResolvedVersion::from_literal(self.0, section))
        }
    }

    #[test]
    fn test_kl040_resolver_no_source() {
        let r = recipe("");
        let resolver = VersionResolver::new();
        let exact = resolver.resolve(&r, "v1.4.0").unwrap();
        assert_eq!(exact.version, "1.4.0");
        assert_eq!(exact.tag, "v1.4.0");
        assert_eq!(resolver.resolve(&r, "").unwrap().version, DEV_VERSION);
    }

    #[test]
    fn test_kl040_resolver_dispatch() {
        let r = recipe("[version]\nsource = \"fixed\"\ntag_prefix = \"release-\"");
        let resolver = VersionResolver::new().with_provider("fixed", Box::new(Fixed("2.1.0")));
        let v = resolver.resolve(&r, "latest").unwrap();
        assert_eq!(v.version, "2.1.0");
        assert_eq!(v.tag, "release-2.1.0");
    }

    #[test]
    fn test_kl040_resolver_unknown_source() {
        let r = recipe("[version]\nsource = \"pypi\"");
        let err = VersionResolver::new().resolve(&r, "1.0").unwrap_err();
        assert!(matches!(err, VersionError::UnknownSource { .. }));
        assert!(!err.is_network());
    }

    #[test]
    fn test_kl040_inferred_source() {
        let r = recipe("[version]\ngithub_repo = \"a/b\"");
        let err = VersionResolver::new().resolve(&r, "1.0").unwrap_err();
        assert!(
            matches!(err, VersionError::UnknownSource { ref source_name, .. } if source_name == "github_releases")
        );
    }

    proptest! {
        #[test]
        fn prop_kl040_pinned_literals_are_exact(a in 0u32..100, b in 0u32..100, c in 0u32..100, v in any::<bool>()) {
            let s = format!("{}{}.{}.{}", if v { "v" } else { "" }, a, b, c);
            prop_assert_eq!(classify_constraint(&s), ConstraintKind::Exact);
            let plain = format!("{}.{}.{}", a, b, c);
            prop_assert!(matches_constraint(&plain, &s));
        }
    }
}

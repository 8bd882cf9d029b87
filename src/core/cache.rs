//! KL-042: Plan cache — multi-factor validation and population policy.
//!
//! A stored plan is reusable only when its format version, platform, and
//! recipe hash all match the current values. Storage problems count as a
//! miss; they never block generation.

use super::error::{CacheValidationError, StateError};
use super::state::{plan_file_path, write_atomic, StateStore};
use super::types::{InstallationPlan, Platform};
use super::version::{classify_constraint, exact_forms, ConstraintKind};
use tracing::{debug, info, warn};

/// Check a stored plan against the current recipe hash, platform, and format.
pub fn validate_cached_plan(
    plan: &InstallationPlan,
    recipe_hash: &str,
    platform: &Platform,
    format_version: u32,
) -> Result<(), CacheValidationError> {
    if plan.format_version != format_version {
        return Err(CacheValidationError::FormatVersion {
            found: plan.format_version,
            current: format_version,
        });
    }
    if plan.platform != *platform {
        return Err(CacheValidationError::Platform {
            found: plan.platform.to_string(),
            current: platform.to_string(),
        });
    }
    if plan.recipe_hash != recipe_hash {
        return Err(CacheValidationError::RecipeHash {
            found: plan.recipe_hash.clone(),
            current: recipe_hash.to_string(),
        });
    }
    Ok(())
}

/// Whether a generation may consult the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheDecision {
    Consult,
    /// Dynamic constraints always get a fresh plan
    BypassDynamic,
    BypassRefresh,
}

pub fn cache_decision(constraint: &str, force_refresh: bool) -> CacheDecision {
    if force_refresh {
        CacheDecision::BypassRefresh
    } else if classify_constraint(constraint) == ConstraintKind::Dynamic {
        CacheDecision::BypassDynamic
    } else {
        CacheDecision::Consult
    }
}

/// Persistent plan storage keyed by `(tool, version)`.
pub trait PlanStore {
    fn load_plan(&self, tool: &str, version: &str) -> Result<Option<InstallationPlan>, StateError>;

    /// Replace any prior plan for the same `(tool, version)`.
    fn store_plan(&self, plan: &InstallationPlan) -> Result<(), StateError>;
}

/// Cached plans live in `plan.json` beside the install lock. A version that
/// was installed but never cached falls back to the plan in its lock.
impl PlanStore for StateStore {
    fn load_plan(&self, tool: &str, version: &str) -> Result<Option<InstallationPlan>, StateError> {
        let path = plan_file_path(self.dir(), tool, version);
        if !path.is_file() {
            return Ok(self.load(tool, version)?.map(|s| s.plan));
        }
        let content = std::fs::read_to_string(&path).map_err(|source| StateError::Io {
            path: path.display().to_string(),
            source,
        })?;
        InstallationPlan::from_json(&content)
            .map(Some)
            .map_err(|e| StateError::Corrupt {
                path: path.display().to_string(),
                message: e.to_string(),
            })
    }

    fn store_plan(&self, plan: &InstallationPlan) -> Result<(), StateError> {
        let path = plan_file_path(self.dir(), &plan.tool, &plan.version);
        let json = plan.to_json_pretty().map_err(|e| StateError::Corrupt {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        write_atomic(&path, json.as_bytes())
    }
}

/// Fail-open view over a [`PlanStore`].
pub struct PlanCache<'a> {
    store: &'a dyn PlanStore,
}

impl<'a> PlanCache<'a> {
    pub fn new(store: &'a dyn PlanStore) -> Self {
        Self { store }
    }

    /// First valid stored plan under any spelling of an Exact constraint
    /// (`1.2` is also looked up as `1.2.0`).
    pub fn lookup_exact(
        &self,
        tool: &str,
        constraint: &str,
        recipe_hash: &str,
        platform: &Platform,
        format_version: u32,
    ) -> Option<InstallationPlan> {
        exact_forms(constraint)
            .iter()
            .find_map(|version| self.lookup(tool, version, recipe_hash, platform, format_version))
    }

    /// A valid stored plan, or None on miss, invalid entry, or storage error.
    pub fn lookup(
        &self,
        tool: &str,
        version: &str,
        recipe_hash: &str,
        platform: &Platform,
        format_version: u32,
    ) -> Option<InstallationPlan> {
        let plan = match self.store.load_plan(tool, version) {
            Ok(Some(plan)) => plan,
            Ok(None) => {
                debug!(tool, version, "plan cache miss");
                return None;
            }
            Err(e) => {
                warn!(tool, version, error = %e, "plan cache unavailable; regenerating");
                return None;
            }
        };
        match validate_cached_plan(&plan, recipe_hash, platform, format_version) {
            Ok(()) => {
                debug!(tool, version, "plan cache hit");
                Some(plan)
            }
            Err(reason) => {
                info!(tool, version, %reason, "cached plan invalid; regenerating");
                None
            }
        }
    }

    /// Store a plan. Returns false (and logs) when storage fails.
    pub fn store(&self, plan: &InstallationPlan) -> bool {
        match self.store.store_plan(plan) {
            Ok(()) => true,
            Err(e) => {
                warn!(tool = %plan.tool, version = %plan.version, error = %e, "cannot store plan");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::PLAN_FORMAT_VERSION;
    use crate::testkit::{sample_plan, FailingPlanStore, MemoryPlanStore};

    #[test]
    fn test_kl042_validate_own_plan() {
        let plan = sample_plan("fzf", "0.46.0");
        assert!(validate_cached_plan(
            &plan,
            &plan.recipe_hash,
            &plan.platform,
            PLAN_FORMAT_VERSION
        )
        .is_ok());
    }

    #[test]
    fn test_kl042_each_factor_invalidates() {
        let plan = sample_plan("fzf", "0.46.0");
        let hash = plan.recipe_hash.clone();
        let platform = plan.platform.clone();

        let err = validate_cached_plan(&plan, "blake3:other", &platform, PLAN_FORMAT_VERSION);
        assert!(matches!(err, Err(CacheValidationError::RecipeHash { .. })));

        let arm = Platform::new("linux", "arm64");
        let err = validate_cached_plan(&plan, &hash, &arm, PLAN_FORMAT_VERSION);
        assert!(matches!(err, Err(CacheValidationError::Platform { .. })));

        let debian = platform.clone().with_family("debian");
        assert!(validate_cached_plan(&plan, &hash, &debian, PLAN_FORMAT_VERSION).is_err());

        let mut old = plan.clone();
        old.format_version = PLAN_FORMAT_VERSION - 1;
        let err = validate_cached_plan(&old, &hash, &platform, PLAN_FORMAT_VERSION);
        assert_eq!(
            err,
            Err(CacheValidationError::FormatVersion {
                found: PLAN_FORMAT_VERSION - 1,
                current: PLAN_FORMAT_VERSION
            })
        );
    }

    #[test]
    fn test_kl042_decision() {
        assert_eq!(cache_decision("0.46.0", false), CacheDecision::Consult);
        assert_eq!(cache_decision("v0.46.0", false), CacheDecision::Consult);
        assert_eq!(cache_decision("", false), CacheDecision::BypassDynamic);
        assert_eq!(cache_decision("latest", false), CacheDecision::BypassDynamic);
        assert_eq!(cache_decision("^1.0", false), CacheDecision::BypassDynamic);
        assert_eq!(cache_decision("0.46.0", true), CacheDecision::BypassRefresh);
    }

    #[test]
    fn test_kl042_lookup_hit_and_invalid() {
        let store = MemoryPlanStore::default();
        let plan = sample_plan("fzf", "0.46.0");
        let cache = PlanCache::new(&store);
        assert!(cache.store(&plan));

        let hit = cache.lookup("fzf", "0.46.0", &plan.recipe_hash, &plan.platform, PLAN_FORMAT_VERSION);
        assert_eq!(hit, Some(plan.clone()));
        assert!(cache
            .lookup("fzf", "0.46.0", "blake3:changed", &plan.platform, PLAN_FORMAT_VERSION)
            .is_none());
        assert!(cache
            .lookup("fzf", "0.45.0", &plan.recipe_hash, &plan.platform, PLAN_FORMAT_VERSION)
            .is_none());
    }

    #[test]
    fn test_kl042_store_replaces() {
        let store = MemoryPlanStore::default();
        let cache = PlanCache::new(&store);
        let mut plan = sample_plan("fzf", "0.46.0");
        cache.store(&plan);
        plan.recipe_hash = "blake3:v2".into();
        cache.store(&plan);
        assert_eq!(store.len(), 1);
        let hit = cache.lookup("fzf", "0.46.0", "blake3:v2", &plan.platform, PLAN_FORMAT_VERSION);
        assert!(hit.is_some());
    }

    #[test]
    fn test_kl042_storage_errors_fail_open() {
        let cache = PlanCache::new(&FailingPlanStore);
        let plan = sample_plan("fzf", "0.46.0");
        assert!(!cache.store(&plan));
        assert!(cache
            .lookup("fzf", "0.46.0", &plan.recipe_hash, &plan.platform, PLAN_FORMAT_VERSION)
            .is_none());
    }

    #[test]
    fn test_kl042_state_store_backend() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateStore::new(dir.path());
        let plan = sample_plan("jq", "1.7.1");
        let cache = PlanCache::new(&state);
        assert!(cache.store(&plan));
        let hit = cache.lookup("jq", "1.7.1", &plan.recipe_hash, &plan.platform, PLAN_FORMAT_VERSION);
        assert_eq!(hit, Some(plan));
    }

    #[test]
    fn test_kl042_cached_plan_is_not_an_install() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateStore::new(dir.path());
        assert!(PlanCache::new(&state).store(&sample_plan("zlib", "1.3")));

        assert!(!state.is_installed("zlib", "1.3"));
        assert!(state.load("zlib", "1.3").unwrap().is_none());
        assert!(state.list_installed().unwrap().is_empty());
        assert!(state.load_plan("zlib", "1.3").unwrap().is_some());
    }

    #[test]
    fn test_kl042_installed_lock_serves_as_cache() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateStore::new(dir.path());
        let plan = sample_plan("jq", "1.7.1");
        state
            .save(&crate::core::state::new_state(&plan, std::path::Path::new("/tools/jq-1.7.1")))
            .unwrap();
        let hit = PlanCache::new(&state).lookup("jq", "1.7.1", &plan.recipe_hash, &plan.platform, PLAN_FORMAT_VERSION);
        assert_eq!(hit, Some(plan));
    }

    #[test]
    fn test_kl042_corrupt_plan_file_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateStore::new(dir.path());
        let path = plan_file_path(dir.path(), "jq", "1.7.1");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{").unwrap();
        assert!(matches!(state.load_plan("jq", "1.7.1"), Err(StateError::Corrupt { .. })));
        let plan = sample_plan("jq", "1.7.1");
        assert!(PlanCache::new(&state)
            .lookup("jq", "1.7.1", &plan.recipe_hash, &plan.platform, PLAN_FORMAT_VERSION)
            .is_none());
    }

    #[test]
    fn test_kl042_exact_lookup_normalizes_short_versions() {
        let store = MemoryPlanStore::default();
        let cache = PlanCache::new(&store);
        let plan = sample_plan("jq", "1.2.0");
        cache.store(&plan);
        for constraint in ["1.2", "v1.2", "1.2.0"] {
            let hit = cache.lookup_exact("jq", constraint, &plan.recipe_hash, &plan.platform, PLAN_FORMAT_VERSION);
            assert_eq!(hit.as_ref(), Some(&plan), "{constraint}");
        }
        assert!(cache
            .lookup_exact("jq", "1.3", &plan.recipe_hash, &plan.platform, PLAN_FORMAT_VERSION)
            .is_none());
    }
}

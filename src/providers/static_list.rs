//! `static` source: versions listed inline in the recipe.

use crate::core::error::VersionError;
use crate::core::recipe::VersionSection;
use crate::core::version::{select_best, ResolvedVersion, VersionProvider};

#[derive(Debug, Clone, Copy, Default)]
pub struct StaticProvider;

impl VersionProvider for StaticProvider {
    fn resolve(
        &self,
        section: &VersionSection,
        tool: &str,
        constraint: &str,
    ) -> Result<ResolvedVersion, VersionError> {
        if section.versions.is_empty() {
            return Err(VersionError::Misconfigured {
                tool: tool.to_string(),
                message: "static source lists no versions".into(),
            });
        }
        let best = select_best(section.versions.iter().map(String::as_str), constraint).ok_or_else(
            || VersionError::NoMatch {
                tool: tool.to_string(),
                constraint: constraint.to_string(),
            },
        )?;
        Ok(ResolvedVersion::from_literal(best, section))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(versions: &[&str]) -> VersionSection {
        VersionSection {
            source: Some("static".into()),
            versions: versions.iter().map(|v| v.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_kl041_static_latest_and_pinned() {
        let s = section(&["14.0.0", "14.1.0", "13.0.0"]);
        let latest = StaticProvider.resolve(&s, "rg", "").unwrap();
        assert_eq!(latest.version, "14.1.0");
        assert_eq!(latest.tag, "v14.1.0");
        assert_eq!(StaticProvider.resolve(&s, "rg", "14.0.0").unwrap().version, "14.0.0");
        assert_eq!(StaticProvider.resolve(&s, "rg", "^13").unwrap().version, "13.0.0");
    }

    #[test]
    fn test_kl041_static_no_match() {
        let err = StaticProvider
            .resolve(&section(&["1.0.0"]), "t", "2.0.0")
            .unwrap_err();
        assert!(matches!(err, VersionError::NoMatch { .. }));
        assert!(!err.is_network());
    }

    #[test]
    fn test_kl041_static_empty_list() {
        let err = StaticProvider.resolve(&section(&[]), "t", "").unwrap_err();
        assert!(matches!(err, VersionError::Misconfigured { .. }));
    }
}

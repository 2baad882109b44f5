//! Include/exclude selection, applied before planning.

use glob::Pattern;
use tracing::debug;

use crate::changes::{compile_pattern, path_matches};
use crate::error::Result;
use crate::package::Package;

/// Glob-based package selection.
///
/// A pattern matches a package when it matches either the root path or the
/// package name. With no include patterns every package is included.
#[derive(Debug, Clone, Default)]
pub struct PackageFilter {
    include: Vec<Pattern>,
    exclude: Vec<Pattern>,
}

impl PackageFilter {
    pub fn new<I, E, S>(include: I, exclude: E) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        E: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(Self {
            include: include
                .into_iter()
                .map(|p| compile_pattern(p.as_ref()))
                .collect::<Result<_>>()?,
            exclude: exclude
                .into_iter()
                .map(|p| compile_pattern(p.as_ref()))
                .collect::<Result<_>>()?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }

    pub fn accepts(&self, package: &Package) -> bool {
        let hit = |p: &Pattern| {
            path_matches(p, package.id.as_str()) || p.matches(&package.name)
        };
        let included = self.include.is_empty() || self.include.iter().any(hit);
        included && !self.exclude.iter().any(hit)
    }

    /// Keep accepted packages, preserving order.
    pub fn apply(&self, packages: Vec<Package>) -> Vec<Package> {
        if self.is_empty() {
            return packages;
        }
        let before = packages.len();
        let kept: Vec<Package> = packages.into_iter().filter(|p| self.accepts(p)).collect();
        debug!(before, after = kept.len(), "Include/exclude filter applied");
        kept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::Ecosystem;

    fn pkg(root: &str, name: &str) -> Package {
        Package::new(root, format!("/repo/{root}"), name, Ecosystem::Npm)
    }

    fn roots(packages: &[Package]) -> Vec<&str> {
        packages.iter().map(|p| p.id.as_str()).collect()
    }

    fn sample() -> Vec<Package> {
        vec![
            pkg("services/api", "api"),
            pkg("services/web", "web-frontend"),
            pkg("libs/core", "core"),
        ]
    }

    #[test]
    fn test_empty_filter_keeps_everything() {
        let filter = PackageFilter::new(Vec::<&str>::new(), Vec::new()).unwrap();
        assert_eq!(filter.apply(sample()).len(), 3);
    }

    #[test]
    fn test_include_by_path_glob() {
        let filter = PackageFilter::new(["services/*"], []).unwrap();
        assert_eq!(roots(&filter.apply(sample())), vec!["services/api", "services/web"]);
    }

    #[test]
    fn test_include_by_name() {
        let filter = PackageFilter::new(["web-*"], []).unwrap();
        assert_eq!(roots(&filter.apply(sample())), vec!["services/web"]);
    }

    #[test]
    fn test_exclude_wins_over_include() {
        let filter = PackageFilter::new(["services/**"], ["api"]).unwrap();
        assert_eq!(roots(&filter.apply(sample())), vec!["services/web"]);
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        assert!(PackageFilter::new(["[bad"], []).is_err());
    }
}

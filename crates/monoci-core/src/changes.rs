//! Change-impact analysis: which packages need re-validation.
//!
//! The analyzer is biased towards running more: a global-impact match
//! selects every package, and any failure to compute the change set falls
//! back to the full package set.

use std::collections::BTreeSet;
use std::path::PathBuf;

use glob::{MatchOptions, Pattern};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{ChangeDetectionError, MonociError, Result};
use crate::git;
use crate::package::Package;

/// Changed files that affect every package by default.
pub const DEFAULT_GLOBAL_IMPACT: &[&str] = &[
    "pyproject.toml",
    "pixi.toml",
    "pixi.lock",
    "poetry.lock",
    "requirements*.txt",
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "Cargo.lock",
    "monoci.toml",
    ".github/workflows/**",
];

/// The set of changed paths relative to a base reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeSet {
    pub base_ref: String,
    pub changed_paths: BTreeSet<String>,
}

impl ChangeSet {
    pub fn new<I, S>(base_ref: impl Into<String>, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            base_ref: base_ref.into(),
            changed_paths: paths
                .into_iter()
                .map(|p| p.into().replace('\\', "/"))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changed_paths.is_empty()
    }
}

/// Something that can compute the changed paths for a base reference.
pub trait ChangeSource {
    fn change_set(&self, base_ref: &str) -> std::result::Result<ChangeSet, ChangeDetectionError>;
}

/// Computes changes with the `git` CLI.
#[derive(Debug, Clone)]
pub struct GitChangeSource {
    repo_dir: PathBuf,
}

impl GitChangeSource {
    pub fn new(repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
        }
    }
}

impl ChangeSource for GitChangeSource {
    fn change_set(&self, base_ref: &str) -> std::result::Result<ChangeSet, ChangeDetectionError> {
        let paths = git::changed_paths(&self.repo_dir, base_ref)?;
        Ok(ChangeSet {
            base_ref: base_ref.to_string(),
            changed_paths: paths,
        })
    }
}

/// Why a set of packages was selected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImpactReason {
    /// Packages whose root prefixes a changed path.
    Matched,
    /// A changed path matched a global-impact pattern.
    GlobalImpact { path: String, pattern: String },
    /// The change set could not be computed.
    FallbackAll { error: String },
}

/// Affected packages plus the reason they were chosen.
#[derive(Debug, Clone)]
pub struct Impact {
    pub packages: Vec<Package>,
    pub reason: ImpactReason,
    pub change_set: Option<ChangeSet>,
}

/// Maps changed paths onto packages.
pub struct ChangeAnalyzer<S> {
    source: S,
    global_patterns: Vec<Pattern>,
}

impl<S: ChangeSource> ChangeAnalyzer<S> {
    /// Create an analyzer with the default global-impact patterns.
    pub fn new(source: S) -> Self {
        let global_patterns = DEFAULT_GLOBAL_IMPACT
            .iter()
            .filter_map(|p| Pattern::new(p).ok())
            .collect();
        Self {
            source,
            global_patterns,
        }
    }

    /// Replace the global-impact patterns.
    pub fn with_global_patterns<I, P>(mut self, patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<str>,
    {
        self.global_patterns = patterns
            .into_iter()
            .map(|p| compile_pattern(p.as_ref()))
            .collect::<Result<_>>()?;
        Ok(self)
    }

    /// Packages affected by changes since `base_ref`, in input order.
    ///
    /// Never fails: change detection errors select every package.
    pub fn affected_packages(&self, base_ref: &str, packages: &[Package]) -> Impact {
        match self.source.change_set(base_ref) {
            Ok(change_set) => self.map_changes(change_set, packages),
            Err(e) => {
                warn!(base_ref, error = %e, "Change detection failed; validating all packages");
                Impact {
                    packages: packages.to_vec(),
                    reason: ImpactReason::FallbackAll {
                        error: e.to_string(),
                    },
                    change_set: None,
                }
            }
        }
    }

    /// Map a known change set onto `packages`.
    pub fn map_changes(&self, change_set: ChangeSet, packages: &[Package]) -> Impact {
        for path in &change_set.changed_paths {
            if let Some(pattern) = self.global_match(path) {
                info!(path = %path, pattern = %pattern, "Global-impact change; all packages affected");
                return Impact {
                    packages: packages.to_vec(),
                    reason: ImpactReason::GlobalImpact {
                        path: path.clone(),
                        pattern: pattern.to_string(),
                    },
                    change_set: Some(change_set),
                };
            }
        }

        let affected: Vec<Package> = packages
            .iter()
            .filter(|pkg| change_set.changed_paths.iter().any(|p| pkg.id.contains(p)))
            .cloned()
            .collect();

        info!(
            changed = change_set.changed_paths.len(),
            affected = affected.len(),
            total = packages.len(),
            "Change impact computed"
        );
        Impact {
            packages: affected,
            reason: ImpactReason::Matched,
            change_set: Some(change_set),
        }
    }

    fn global_match(&self, path: &str) -> Option<&Pattern> {
        self.global_patterns
            .iter()
            .find(|pattern| path_matches(pattern, path))
    }
}

/// Compile a glob, mapping errors into the configuration taxonomy.
pub fn compile_pattern(pattern: &str) -> Result<Pattern> {
    Pattern::new(pattern).map_err(|e| MonociError::InvalidPattern {
        pattern: pattern.to_string(),
        detail: e.to_string(),
    })
}

/// Glob match where `*` stays within one path segment and `dir/**` also
/// matches everything below `dir`.
pub fn path_matches(pattern: &Pattern, path: &str) -> bool {
    let options = MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    };
    if pattern.matches_with(path, options) {
        return true;
    }
    pattern
        .as_str()
        .strip_suffix("/**")
        .is_some_and(|dir| path == dir || path.starts_with(&format!("{dir}/")))
}

//! Run configuration.
//!
//! Precedence: command line (including its environment fallbacks) over
//! `monoci.toml` over built-in defaults. Everything is validated up front so
//! that a bad flag ends the run with exit code 2 before any package executes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::changes::{compile_pattern, DEFAULT_GLOBAL_IMPACT};
use crate::error::{MonociError, Result};
use crate::filter::PackageFilter;
use crate::tier::Tier;

/// Name of the optional config file at the discovery root.
pub const CONFIG_FILE_NAME: &str = "monoci.toml";

/// Default base reference for `--changed-only`.
pub const DEFAULT_BASE_REF: &str = "origin/main";

/// Default reports directory, relative to the discovery root.
pub const DEFAULT_REPORTS_DIR: &str = "reports/local-ci";

/// Per-tier timeout overrides in seconds.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct TierTimeouts {
    pub essential: Option<u64>,
    pub extended: Option<u64>,
    pub full: Option<u64>,
}

impl TierTimeouts {
    fn get(&self, tier: Tier) -> Option<u64> {
        match tier {
            Tier::Essential => self.essential,
            Tier::Extended => self.extended,
            Tier::Full => self.full,
        }
    }
}

/// Contents of `monoci.toml`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub tier: Option<String>,
    pub jobs: Option<usize>,
    /// Replaces the default global-impact patterns when set.
    pub global_impact: Option<Vec<String>>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub skip_dirs: Vec<String>,
    pub reports_dir: Option<PathBuf>,
    pub timeouts: TierTimeouts,
}

impl FileConfig {
    /// Load `monoci.toml` from `root` if it exists.
    pub fn load(root: &Path) -> Result<Option<Self>> {
        let path = root.join(CONFIG_FILE_NAME);
        if !path.is_file() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)?;
        let config = Self::parse(&raw).map_err(|detail| MonociError::ConfigFile {
            path: path.clone(),
            detail,
        })?;
        debug!(path = %path.display(), "Loaded config file");
        Ok(Some(config))
    }

    pub fn parse(raw: &str) -> std::result::Result<Self, String> {
        toml::from_str(raw).map_err(|e| e.to_string())
    }
}

/// Values supplied on the command line. `None` means "not given".
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub tier: Option<String>,
    pub jobs: Option<usize>,
    pub dependency_order: Option<bool>,
    pub fail_fast: Option<bool>,
    pub changed_only: Option<bool>,
    pub base_ref: Option<String>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub timeout_secs: Option<u64>,
    pub total_timeout_secs: Option<u64>,
    pub reports: Option<bool>,
    pub reports_dir: Option<PathBuf>,
    pub dry_run: bool,
}

/// Fully resolved, validated settings for one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub root: PathBuf,
    pub tier: Tier,
    pub jobs: usize,
    pub dependency_order: bool,
    pub fail_fast: bool,
    pub changed_only: bool,
    pub base_ref: String,
    pub filter: PackageFilter,
    pub global_impact: Vec<String>,
    pub skip_dirs: Vec<String>,
    pub per_package_timeout: Duration,
    pub total_timeout: Option<Duration>,
    pub reports: bool,
    pub reports_dir: PathBuf,
    pub dry_run: bool,
}

impl RunConfig {
    /// Merge command line, config file and defaults.
    pub fn resolve(root: PathBuf, cli: CliOverrides, file: Option<FileConfig>) -> Result<Self> {
        let file = file.unwrap_or_default();

        let tier = match cli.tier.as_deref().or(file.tier.as_deref()) {
            Some(name) => name.parse::<Tier>()?,
            None => Tier::default(),
        };

        let jobs = match cli.jobs.or(file.jobs).unwrap_or(0) {
            0 => detect_parallelism(),
            n => n,
        };

        let timeout_secs = cli
            .timeout_secs
            .or_else(|| file.timeouts.get(tier))
            .unwrap_or_else(|| tier.default_timeout_secs());
        if timeout_secs == 0 {
            return Err(MonociError::Configuration(
                "--timeout must be greater than zero".to_string(),
            ));
        }

        let total_timeout = match cli.total_timeout_secs {
            Some(0) => {
                return Err(MonociError::Configuration(
                    "--total-timeout must be greater than zero".to_string(),
                ))
            }
            Some(secs) => Some(Duration::from_secs(secs)),
            None => None,
        };

        let base_ref = cli
            .base_ref
            .unwrap_or_else(|| DEFAULT_BASE_REF.to_string());
        if base_ref.trim().is_empty() {
            return Err(MonociError::Configuration(
                "--base-ref cannot be blank".to_string(),
            ));
        }

        let mut include = file.include;
        include.extend(cli.include);
        let mut exclude = file.exclude;
        exclude.extend(cli.exclude);
        let filter = PackageFilter::new(include, exclude)?;

        let global_impact = file.global_impact.unwrap_or_else(|| {
            DEFAULT_GLOBAL_IMPACT
                .iter()
                .map(|s| s.to_string())
                .collect()
        });
        for pattern in &global_impact {
            compile_pattern(pattern)?;
        }

        let reports_dir = cli
            .reports_dir
            .or(file.reports_dir)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_REPORTS_DIR));
        let reports_dir = if reports_dir.is_absolute() {
            reports_dir
        } else {
            root.join(reports_dir)
        };

        Ok(Self {
            root,
            tier,
            jobs,
            dependency_order: cli.dependency_order.unwrap_or(true),
            fail_fast: cli.fail_fast.unwrap_or(false),
            changed_only: cli.changed_only.unwrap_or(false),
            base_ref,
            filter,
            global_impact,
            skip_dirs: file.skip_dirs,
            per_package_timeout: Duration::from_secs(timeout_secs),
            total_timeout,
            reports: cli.reports.unwrap_or(true),
            reports_dir,
            dry_run: cli.dry_run,
        })
    }
}

/// Number of CPUs available to this process, at least 1.
pub fn detect_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

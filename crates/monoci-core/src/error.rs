//! Error taxonomy for monoci.
//!
//! Only [`MonociError::Configuration`] and [`MonociError::NoPackagesFound`]
//! abort a run before any package executes. Everything else is captured per
//! package and surfaced through the run report.

use std::path::PathBuf;

/// Errors raised while computing the change set.
///
/// These are never fatal: the change analyzer logs them and falls back to the
/// full package set.
#[derive(Debug, thiserror::Error)]
pub enum ChangeDetectionError {
    #[error("git is not available: {0}")]
    GitUnavailable(String),

    #[error("not a git work tree: {0}")]
    NotARepository(PathBuf),

    #[error("base ref '{base_ref}' cannot be resolved: {detail}")]
    UnresolvedBaseRef { base_ref: String, detail: String },

    #[error("git {command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
}

/// Errors raised by the execution planner.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("max parallelism must be at least 1")]
    ZeroParallelism,

    #[error("package '{0}' appears more than once in the plan input")]
    DuplicatePackage(String),
}

/// Top-level monoci errors.
#[derive(Debug, thiserror::Error)]
pub enum MonociError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("no packages found under {}", root.display())]
    NoPackagesFound { root: PathBuf },

    #[error("missing external tool: {tool} (needed by {needed_by})")]
    MissingTool { tool: String, needed_by: String },

    #[error("change detection error: {0}")]
    ChangeDetection(#[from] ChangeDetectionError),

    #[error("plan error: {0}")]
    Plan(#[from] PlanError),

    #[error("invalid pattern '{pattern}': {detail}")]
    InvalidPattern { pattern: String, detail: String },

    #[error("config file {}: {detail}", path.display())]
    ConfigFile { path: PathBuf, detail: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl MonociError {
    /// Process exit code for errors that end a run.
    ///
    /// Configuration, discovery and environment problems map to `2`.
    pub fn exit_code(&self) -> i32 {
        match self {
            MonociError::Configuration(_)
            | MonociError::NoPackagesFound { .. }
            | MonociError::MissingTool { .. }
            | MonociError::Plan(_)
            | MonociError::InvalidPattern { .. }
            | MonociError::ConfigFile { .. } => 2,
            MonociError::ChangeDetection(_)
            | MonociError::Serialization(_)
            | MonociError::Io(_) => 1,
        }
    }
}

/// Result type for monoci operations.
pub type Result<T> = std::result::Result<T, MonociError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_packages_found_display() {
        let err = MonociError::NoPackagesFound {
            root: PathBuf::from("/repo"),
        };
        assert!(err.to_string().contains("no packages found"));
        assert!(err.to_string().contains("/repo"));
    }

    #[test]
    fn test_fatal_errors_exit_with_two() {
        assert_eq!(MonociError::Configuration("bad tier".into()).exit_code(), 2);
        assert_eq!(
            MonociError::NoPackagesFound {
                root: PathBuf::from(".")
            }
            .exit_code(),
            2
        );
        assert_eq!(
            MonociError::MissingTool {
                tool: "pixi".into(),
                needed_by: "libs/core".into()
            }
            .exit_code(),
            2
        );
        assert_eq!(MonociError::Plan(PlanError::ZeroParallelism).exit_code(), 2);
    }

    #[test]
    fn test_unresolved_base_ref_names_the_ref() {
        let err = ChangeDetectionError::UnresolvedBaseRef {
            base_ref: "origin/nope".to_string(),
            detail: "unknown revision".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("origin/nope"));
        assert!(msg.contains("unknown revision"));
    }
}

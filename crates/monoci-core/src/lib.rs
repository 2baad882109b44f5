//! monoci core
//!
//! The stages that run before anything executes:
//! - package discovery ([`registry`])
//! - change-impact mapping ([`changes`])
//! - include/exclude selection ([`filter`])
//! - batch planning ([`plan`])
//!
//! plus the configuration and error types shared with the executor.

pub mod changes;
pub mod config;
pub mod error;
pub mod filter;
pub mod git;
pub mod package;
pub mod plan;
pub mod registry;
pub mod telemetry;
pub mod tier;

pub use changes::{
    ChangeAnalyzer, ChangeSet, ChangeSource, GitChangeSource, Impact, ImpactReason,
    DEFAULT_GLOBAL_IMPACT,
};
pub use config::{CliOverrides, FileConfig, RunConfig, CONFIG_FILE_NAME};
pub use error::{ChangeDetectionError, MonociError, PlanError, Result};
pub use filter::PackageFilter;
pub use package::{ops, Ecosystem, Invocation, Package, PackageId};
pub use plan::{plan, Batch, ExecutionPlan};
pub use registry::{discover, Discovery, PackageRegistry, UnsupportedManifest};
pub use telemetry::init_tracing;
pub use tier::Tier;

/// monoci version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

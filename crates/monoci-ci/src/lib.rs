//! monoci CI - batch execution of package validation
//!
//! Provides the execution half of a run:
//! - Runs each package's tier operations as child processes
//! - Executes batches with bounded concurrency, timeouts and cancellation
//! - Aggregates results into a complete run report and exit code

pub mod executor;
pub mod gate;
pub mod pipeline;
pub mod report;
pub mod runner;

// Re-export key types
pub use executor::{
    AbortReason, BatchExecutor, ExecutionPolicy, ExecutionSummary, PackageResult, PackageState,
    Shutdown,
};
pub use gate::{CiGate, GateVerdict, EXIT_FAILURE, EXIT_INTERRUPTED, EXIT_SUCCESS};
pub use pipeline::CiPipeline;
pub use report::{Aggregator, ReportContext, ReportDocument, RunReport};
pub use runner::{find_on_path, OperationResult, PackageRunner, ProcessRunner, RunOutcome};

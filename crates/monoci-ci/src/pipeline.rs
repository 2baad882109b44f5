//! Pipeline: plan → executor → aggregator → report.

use std::sync::Arc;

use monoci_core::{ExecutionPlan, RunConfig};
use tokio::sync::mpsc;
use tracing::info;

use crate::executor::{BatchExecutor, ExecutionPolicy, Shutdown};
use crate::report::{Aggregator, ReportContext, RunReport};
use crate::runner::PackageRunner;

/// Drives one run end to end.
pub struct CiPipeline;

impl CiPipeline {
    /// Execute `plan` and aggregate every result into a report.
    ///
    /// The executor and aggregator run concurrently over a channel; the
    /// aggregator is the only writer of the result set.
    pub async fn run(
        executor: &BatchExecutor,
        plan: &ExecutionPlan,
        policy: &ExecutionPolicy,
        shutdown: &Shutdown,
        context: ReportContext,
    ) -> RunReport {
        info!(
            tier = %context.tier,
            packages = plan.package_count(),
            batches = plan.batches.len(),
            jobs = context.parallel_jobs,
            fail_fast = policy.fail_fast,
            "Starting pipeline"
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut aggregator = Aggregator::new(plan, context);

        let collect = async {
            while let Some(result) = rx.recv().await {
                aggregator.record(result);
            }
        };
        let (summary, ()) = tokio::join!(executor.execute(plan, policy, shutdown, tx), collect);

        let report = aggregator.finish(&summary);
        info!(
            succeeded = report.succeeded,
            total = report.total_packages,
            duration_ms = report.total_duration_ms,
            "Pipeline complete"
        );
        report
    }

    /// Policy and report context derived from a resolved config.
    pub fn settings(config: &RunConfig) -> (ExecutionPolicy, ReportContext) {
        (
            ExecutionPolicy {
                per_package_timeout: config.per_package_timeout,
                total_timeout: config.total_timeout,
                fail_fast: config.fail_fast,
            },
            ReportContext {
                tier: config.tier,
                parallel_jobs: config.jobs,
                dependency_order: config.dependency_order,
                fail_fast: config.fail_fast,
            },
        )
    }

    /// Executor running the tier's operations with `runner`.
    pub fn executor(config: &RunConfig, runner: Arc<dyn PackageRunner>) -> BatchExecutor {
        let operations = config
            .tier
            .operations()
            .iter()
            .map(|op| op.to_string())
            .collect();
        BatchExecutor::new(runner, operations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::PackageState;
    use crate::runner::ProcessRunner;
    use monoci_core::{ops, plan, CliOverrides, Ecosystem, Package};
    use std::path::PathBuf;
    use std::time::Duration;

    #[test]
    fn test_settings_from_config() {
        let cli = CliOverrides {
            tier: Some("extended".into()),
            jobs: Some(3),
            fail_fast: Some(true),
            total_timeout_secs: Some(60),
            ..Default::default()
        };
        let config = RunConfig::resolve(PathBuf::from("/repo"), cli, None).unwrap();
        let (policy, context) = CiPipeline::settings(&config);
        assert_eq!(policy.per_package_timeout, Duration::from_secs(300));
        assert_eq!(policy.total_timeout, Some(Duration::from_secs(60)));
        assert!(policy.fail_fast);
        assert_eq!(context.parallel_jobs, 3);

        let executor = CiPipeline::executor(&config, Arc::new(ProcessRunner::new()));
        assert!(executor.operations().contains(&ops::SECURITY_SCAN.to_string()));
    }

    #[tokio::test]
    async fn test_pipeline_runs_real_processes() {
        let dir = tempfile::tempdir().unwrap();
        let mut packages = Vec::new();
        for (name, script) in [("ok", "exit 0"), ("bad", "exit 4")] {
            std::fs::create_dir(dir.path().join(name)).unwrap();
            packages.push(
                Package::new(name, dir.path().join(name), name, Ecosystem::Npm)
                    .without_commands()
                    .with_command(ops::TEST, vec!["sh".into(), "-c".into(), script.into()]),
            );
        }
        let plan = plan(packages, 2, true).unwrap();
        let executor =
            BatchExecutor::new(Arc::new(ProcessRunner::new()), vec![ops::TEST.to_string()]);
        let policy = ExecutionPolicy {
            per_package_timeout: Duration::from_secs(30),
            total_timeout: None,
            fail_fast: false,
        };
        let context = ReportContext {
            tier: monoci_core::Tier::Essential,
            parallel_jobs: 2,
            dependency_order: true,
            fail_fast: false,
        };

        let report = CiPipeline::run(&executor, &plan, &policy, &Shutdown::new(), context).await;

        assert_eq!(report.total_packages, 2);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);
        let bad = report.results.iter().find(|r| r.name == "bad").unwrap();
        assert_eq!(bad.state, PackageState::Failed);
        assert_eq!(bad.exit_code, Some(4));
        assert!(!report.success());
    }
}

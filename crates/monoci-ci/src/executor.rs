//! Batch execution with bounded concurrency.
//!
//! Batches run strictly one after another; packages inside a batch run
//! concurrently. Every planned package yields exactly one [`PackageResult`]
//! on the results channel, including packages that never started.

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use monoci_core::{Batch, Ecosystem, ExecutionPlan, Package, PackageId};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::runner::{OperationResult, PackageRunner, RunOutcome};

/// How long a runner gets to wind down after its token fires before the
/// executor stops waiting for it.
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(10);

/// Terminal state of a package.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PackageState {
    Succeeded,
    Failed,
    TimedOut,
    Skipped,
}

impl PackageState {
    /// Label used in reports.
    pub fn label(&self) -> &'static str {
        match self {
            PackageState::Succeeded => "success",
            PackageState::Failed => "failed",
            PackageState::TimedOut => "timeout",
            PackageState::Skipped => "skipped",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, PackageState::Succeeded)
    }
}

impl fmt::Display for PackageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Outcome of one package in one run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackageResult {
    pub package: PackageId,
    pub name: String,
    /// Root path relative to the discovery root.
    pub path: String,
    pub ecosystem: Ecosystem,
    pub state: PackageState,
    /// `None` when no process finished (timed out or skipped).
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub batch: Option<usize>,
    pub operations: Vec<OperationResult>,
}

impl PackageResult {
    fn for_package(package: &Package, batch: Option<usize>, state: PackageState) -> Self {
        Self {
            package: package.id.clone(),
            name: package.name.clone(),
            path: package.id.to_string(),
            ecosystem: package.ecosystem,
            state,
            exit_code: None,
            duration_ms: 0,
            batch,
            operations: Vec::new(),
        }
    }

    /// Result for a package that was never started.
    pub fn skipped(package: &Package, batch: Option<usize>) -> Self {
        Self::for_package(package, batch, PackageState::Skipped)
    }
}

/// Why a run stopped early.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    FailFast,
    TotalTimeout,
    Interrupted,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AbortReason::FailFast => "fail-fast",
            AbortReason::TotalTimeout => "total timeout",
            AbortReason::Interrupted => "interrupted",
        };
        f.write_str(s)
    }
}

/// Run-wide stop signal.
///
/// The first trigger wins and fixes the reason. Fail-fast only stops new
/// batches; the other reasons also cancel every in-flight package.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
    reason: Arc<OnceLock<AbortReason>>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self, reason: AbortReason) {
        if self.reason.set(reason).is_ok() {
            warn!(%reason, "Run aborting");
        }
        if reason != AbortReason::FailFast {
            self.token.cancel();
        }
    }

    pub fn reason(&self) -> Option<AbortReason> {
        self.reason.get().copied()
    }

    pub fn is_triggered(&self) -> bool {
        self.reason.get().is_some()
    }

    /// Token cancelled on total timeout or interrupt.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Timeouts and failure policy for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPolicy {
    pub per_package_timeout: Duration,
    pub total_timeout: Option<Duration>,
    pub fail_fast: bool,
}

/// What [`BatchExecutor::execute`] reports once every result is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionSummary {
    pub aborted: Option<AbortReason>,
    pub batches_started: usize,
}

/// Executes a plan batch by batch.
pub struct BatchExecutor {
    runner: Arc<dyn PackageRunner>,
    operations: Arc<Vec<String>>,
    cancel_grace: Duration,
}

impl BatchExecutor {
    pub fn new(runner: Arc<dyn PackageRunner>, operations: Vec<String>) -> Self {
        Self {
            runner,
            operations: Arc::new(operations),
            cancel_grace: DEFAULT_CANCEL_GRACE,
        }
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn operations(&self) -> &[String] {
        &self.operations
    }

    /// Run `plan`, sending one result per planned package to `results`.
    pub async fn execute(
        &self,
        plan: &ExecutionPlan,
        policy: &ExecutionPolicy,
        shutdown: &Shutdown,
        results: mpsc::UnboundedSender<PackageResult>,
    ) -> ExecutionSummary {
        let watchdog = policy.total_timeout.map(|limit| {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(limit) => {
                        warn!(limit_secs = limit.as_secs(), "Total timeout expired");
                        shutdown.trigger(AbortReason::TotalTimeout);
                    }
                    _ = shutdown.token().cancelled() => {}
                }
            })
        });

        let mut batches_started = 0;
        for batch in &plan.batches {
            if shutdown.is_triggered() {
                for package in &batch.packages {
                    let _ = results.send(PackageResult::skipped(package, Some(batch.index)));
                }
                continue;
            }

            batches_started += 1;
            let batch_failed = self.run_batch(batch, policy, shutdown, &results).await;

            if batch_failed && policy.fail_fast && !shutdown.is_triggered() {
                shutdown.trigger(AbortReason::FailFast);
            }
        }

        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }

        ExecutionSummary {
            aborted: shutdown.reason(),
            batches_started,
        }
    }

    /// Run one batch to completion. Returns whether any package failed.
    async fn run_batch(
        &self,
        batch: &Batch,
        policy: &ExecutionPolicy,
        shutdown: &Shutdown,
        results: &mpsc::UnboundedSender<PackageResult>,
    ) -> bool {
        info!(
            batch = batch.index,
            size = batch.len(),
            "Starting batch"
        );
        let start = Instant::now();

        let mut in_flight = FuturesUnordered::new();
        for package in &batch.packages {
            let task = PackageTask {
                runner: Arc::clone(&self.runner),
                operations: Arc::clone(&self.operations),
                package: package.clone(),
                batch: batch.index,
                timeout: policy.per_package_timeout,
                cancel_grace: self.cancel_grace,
                token: shutdown.token().child_token(),
            };
            let fallback = package.clone();
            let batch_index = batch.index;
            let handle = tokio::spawn(task.run());
            in_flight.push(async move {
                match handle.await {
                    Ok(result) => result,
                    Err(e) => {
                        error!(package = %fallback.id, error = %e, "Package task panicked");
                        let mut result = PackageResult::for_package(
                            &fallback,
                            Some(batch_index),
                            PackageState::Failed,
                        );
                        result.exit_code = Some(-1);
                        result
                    }
                }
            });
        }

        let mut failed = false;
        while let Some(result) = in_flight.next().await {
            failed |= !result.state.is_success();
            let _ = results.send(result);
        }

        info!(
            batch = batch.index,
            duration_ms = start.elapsed().as_millis() as u64,
            "Batch complete"
        );
        failed
    }
}

struct PackageTask {
    runner: Arc<dyn PackageRunner>,
    operations: Arc<Vec<String>>,
    package: Package,
    batch: usize,
    timeout: Duration,
    cancel_grace: Duration,
    token: CancellationToken,
}

impl PackageTask {
    async fn run(self) -> PackageResult {
        let start = Instant::now();
        info!(package = %self.package.id, "Package started");

        let run = self
            .runner
            .run(&self.package, &self.operations, self.token.clone());
        tokio::pin!(run);

        let (outcome, timed_out) = tokio::select! {
            outcome = &mut run => (Some(outcome), false),
            _ = tokio::time::sleep(self.timeout) => {
                warn!(
                    package = %self.package.id,
                    timeout_secs = self.timeout.as_secs(),
                    "Package timed out"
                );
                self.token.cancel();
                (tokio::time::timeout(self.cancel_grace, &mut run).await.ok(), true)
            }
        };

        let mut result =
            PackageResult::for_package(&self.package, Some(self.batch), PackageState::Failed);
        result.duration_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Some(RunOutcome::Completed {
                exit_code,
                operations,
            }) if !timed_out => {
                result.state = if exit_code == 0 {
                    PackageState::Succeeded
                } else {
                    PackageState::Failed
                };
                result.exit_code = Some(exit_code);
                result.operations = operations;
            }
            Some(outcome) => {
                result.state = PackageState::TimedOut;
                result.operations = outcome.operations().to_vec();
            }
            None => {
                warn!(package = %self.package.id, "Runner did not stop within grace period");
                result.state = PackageState::TimedOut;
            }
        }

        info!(
            package = %self.package.id,
            state = %result.state,
            duration_ms = result.duration_ms,
            "Package finished"
        );
        result
    }
}

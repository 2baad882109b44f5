//! Result aggregation and the run report.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use chrono::{DateTime, Utc};
use monoci_core::{ExecutionPlan, PackageId, Tier};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::executor::{AbortReason, ExecutionSummary, PackageResult, PackageState};

/// Run settings echoed into the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportContext {
    pub tier: Tier,
    pub parallel_jobs: usize,
    pub dependency_order: bool,
    pub fail_fast: bool,
}

/// Collects package results as they arrive and fills in the gaps.
///
/// Holds the planned package order so the final report lists every planned
/// package exactly once, in plan order, no matter what arrived.
pub struct Aggregator {
    context: ReportContext,
    plan_digest: String,
    planned: Vec<PackageResult>,
    received: BTreeMap<PackageId, PackageResult>,
    started: Instant,
    timestamp: DateTime<Utc>,
}

impl Aggregator {
    pub fn new(plan: &ExecutionPlan, context: ReportContext) -> Self {
        let planned = plan
            .batches
            .iter()
            .flat_map(|b| {
                b.packages
                    .iter()
                    .map(move |p| PackageResult::skipped(p, Some(b.index)))
            })
            .collect();
        Self {
            context,
            plan_digest: plan.digest(),
            planned,
            received: BTreeMap::new(),
            started: Instant::now(),
            timestamp: Utc::now(),
        }
    }

    /// Record a result. Returns `false` for unplanned or repeated packages,
    /// which are dropped.
    pub fn record(&mut self, result: PackageResult) -> bool {
        if !self.planned.iter().any(|p| p.package == result.package) {
            warn!(package = %result.package, "Result for unplanned package ignored");
            return false;
        }
        if self.received.contains_key(&result.package) {
            warn!(package = %result.package, "Duplicate result ignored");
            return false;
        }
        debug!(package = %result.package, state = %result.state, "Result recorded");
        self.received.insert(result.package.clone(), result);
        true
    }

    pub fn received(&self) -> usize {
        self.received.len()
    }

    /// Build the final report. Packages with no recorded result are `Skipped`.
    pub fn finish(mut self, summary: &ExecutionSummary) -> RunReport {
        let results: Vec<PackageResult> = self
            .planned
            .into_iter()
            .map(|placeholder| {
                self.received
                    .remove(&placeholder.package)
                    .unwrap_or(placeholder)
            })
            .collect();

        let count = |state: PackageState| results.iter().filter(|r| r.state == state).count();
        let report = RunReport {
            run_id: Uuid::new_v4(),
            timestamp: self.timestamp,
            tier: self.context.tier,
            plan_digest: self.plan_digest,
            total_packages: results.len(),
            succeeded: count(PackageState::Succeeded),
            failed: count(PackageState::Failed),
            timed_out: count(PackageState::TimedOut),
            skipped: count(PackageState::Skipped),
            total_duration_ms: self.started.elapsed().as_millis() as u64,
            parallel_jobs: self.context.parallel_jobs,
            dependency_order: self.context.dependency_order,
            fail_fast: self.context.fail_fast,
            aborted: summary.aborted,
            results,
        };
        info!(
            total = report.total_packages,
            succeeded = report.succeeded,
            failed = report.failed,
            timed_out = report.timed_out,
            skipped = report.skipped,
            "Run aggregated"
        );
        report
    }
}

/// Final account of a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunReport {
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub tier: Tier,
    pub plan_digest: String,
    pub total_packages: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub skipped: usize,
    pub total_duration_ms: u64,
    pub parallel_jobs: usize,
    pub dependency_order: bool,
    pub fail_fast: bool,
    pub aborted: Option<AbortReason>,
    pub results: Vec<PackageResult>,
}

impl RunReport {
    /// A run succeeds only when every planned package succeeded.
    pub fn success(&self) -> bool {
        self.results.iter().all(|r| r.state.is_success())
    }

    /// Percentage of succeeded packages; 0 for an empty run.
    pub fn success_rate(&self) -> f64 {
        if self.total_packages == 0 {
            return 0.0;
        }
        self.succeeded as f64 * 100.0 / self.total_packages as f64
    }

    /// Results that did not succeed, in plan order.
    pub fn unsuccessful(&self) -> impl Iterator<Item = &PackageResult> {
        self.results.iter().filter(|r| !r.state.is_success())
    }

    pub fn to_document(&self) -> ReportDocument {
        ReportDocument {
            run_id: self.run_id.to_string(),
            timestamp: self.timestamp.to_rfc3339(),
            tier: self.tier.name().to_string(),
            plan_digest: self.plan_digest.clone(),
            aborted: self.aborted.map(|r| r.to_string()),
            execution: ExecutionSection {
                total_packages: self.total_packages,
                successful_packages: self.succeeded,
                failed_packages: self.failed + self.timed_out,
                timed_out_packages: self.timed_out,
                skipped_packages: self.skipped,
                success_rate: self.success_rate(),
                total_duration: secs(self.total_duration_ms),
                parallel_jobs: self.parallel_jobs,
                dependency_order: self.dependency_order,
                fail_fast: self.fail_fast,
            },
            packages: self
                .results
                .iter()
                .map(|r| PackageEntry {
                    name: r.name.clone(),
                    path: r.path.clone(),
                    kind: r.ecosystem.name().to_string(),
                    result: r.state.label().to_string(),
                    duration: secs(r.duration_ms),
                    exit_code: r.exit_code,
                })
                .collect(),
        }
    }

    /// Write the report as `local-ci-<tier>-<timestamp>.json` and
    /// `latest.json` under `dir`. Returns the timestamped path.
    pub fn persist(&self, dir: &Path) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create reports dir {}", dir.display()))?;

        let json = serde_json::to_string_pretty(&self.to_document())
            .context("Failed to serialize run report")?;

        let file_name = format!(
            "local-ci-{}-{}.json",
            self.tier.name(),
            self.timestamp.format("%Y%m%d_%H%M%S")
        );
        let path = dir.join(file_name);
        std::fs::write(&path, &json)
            .with_context(|| format!("Failed to write report {}", path.display()))?;

        let latest = dir.join("latest.json");
        std::fs::write(&latest, &json)
            .with_context(|| format!("Failed to write report {}", latest.display()))?;

        info!(path = %path.display(), "Report written");
        Ok(path)
    }

    /// Human-readable summary for the terminal.
    pub fn render_summary(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "\nmonoci {} tier: {}/{} packages succeeded ({:.1}%) in {:.1}s\n",
            self.tier,
            self.succeeded,
            self.total_packages,
            self.success_rate(),
            secs(self.total_duration_ms)
        ));

        for result in &self.results {
            let mark = match result.state {
                PackageState::Succeeded => "✓",
                PackageState::Failed => "✗",
                PackageState::TimedOut => "⏱",
                PackageState::Skipped => "-",
            };
            out.push_str(&format!(
                "  {mark} {:<40} {:<8} {:>7.1}s\n",
                result.path,
                result.state.label(),
                secs(result.duration_ms)
            ));
        }

        if self.failed + self.timed_out + self.skipped > 0 {
            out.push_str(&format!(
                "\n  {} failed, {} timed out, {} skipped\n",
                self.failed, self.timed_out, self.skipped
            ));
        }
        if let Some(reason) = self.aborted {
            out.push_str(&format!("  run aborted: {reason}\n"));
        }
        out
    }
}

fn secs(ms: u64) -> f64 {
    ms as f64 / 1000.0
}

/// Serialized report layout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReportDocument {
    pub run_id: String,
    pub timestamp: String,
    pub tier: String,
    pub plan_digest: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
    pub execution: ExecutionSection,
    pub packages: Vec<PackageEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSection {
    pub total_packages: usize,
    pub successful_packages: usize,
    /// Failed plus timed out.
    pub failed_packages: usize,
    pub timed_out_packages: usize,
    pub skipped_packages: usize,
    pub success_rate: f64,
    /// Seconds.
    pub total_duration: f64,
    pub parallel_jobs: usize,
    pub dependency_order: bool,
    pub fail_fast: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PackageEntry {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub result: String,
    /// Seconds.
    pub duration: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use monoci_core::{plan, Ecosystem, Package};
    use std::collections::HashSet;

    fn duplicate_ids(report: &RunReport) -> Vec<&PackageId> {
        let mut seen = HashSet::new();
        report
            .results
            .iter()
            .map(|r| &r.package)
            .filter(|id| !seen.insert(*id))
            .collect()
    }

    fn pkg(root: &str) -> Package {
        Package::new(root, format!("/repo/{root}"), root, Ecosystem::Pip)
    }

    fn context() -> ReportContext {
        ReportContext {
            tier: Tier::Essential,
            parallel_jobs: 2,
            dependency_order: true,
            fail_fast: false,
        }
    }

    fn summary() -> ExecutionSummary {
        ExecutionSummary {
            aborted: None,
            batches_started: 1,
        }
    }

    fn result(package: &Package, state: PackageState, duration_ms: u64) -> PackageResult {
        let mut r = PackageResult::skipped(package, Some(0));
        r.state = state;
        r.duration_ms = duration_ms;
        r.exit_code = match state {
            PackageState::Succeeded => Some(0),
            PackageState::Failed => Some(1),
            _ => None,
        };
        r
    }

    fn sample_plan() -> ExecutionPlan {
        plan(vec![pkg("a"), pkg("b"), pkg("c")], 2, false).unwrap()
    }

    #[test]
    fn test_missing_results_become_skipped() {
        let plan = sample_plan();
        let mut agg = Aggregator::new(&plan, context());
        assert!(agg.record(result(&pkg("b"), PackageState::Succeeded, 10)));

        let report = agg.finish(&summary());
        assert_eq!(report.total_packages, 3);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.skipped, 2);
        let order: Vec<&str> = report.results.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert!(!report.success());
        assert!(duplicate_ids(&report).is_empty());
    }

    #[test]
    fn test_duplicates_and_unplanned_rejected() {
        let plan = sample_plan();
        let mut agg = Aggregator::new(&plan, context());
        assert!(agg.record(result(&pkg("a"), PackageState::Succeeded, 1)));
        assert!(!agg.record(result(&pkg("a"), PackageState::Failed, 1)));
        assert!(!agg.record(result(&pkg("zzz"), PackageState::Succeeded, 1)));
        assert_eq!(agg.received(), 1);
    }

    #[test]
    fn test_success_requires_every_package() {
        let plan = sample_plan();
        let mut agg = Aggregator::new(&plan, context());
        for name in ["a", "b", "c"] {
            agg.record(result(&pkg(name), PackageState::Succeeded, 5));
        }
        let report = agg.finish(&summary());
        assert!(report.success());
        assert_eq!(report.success_rate(), 100.0);
    }

    #[test]
    fn test_document_shape() {
        let plan = sample_plan();
        let mut agg = Aggregator::new(&plan, context());
        agg.record(result(&pkg("a"), PackageState::Succeeded, 1500));
        agg.record(result(&pkg("b"), PackageState::TimedOut, 2000));
        agg.record(result(&pkg("c"), PackageState::Failed, 250));
        let report = agg.finish(&summary());

        let value = serde_json::to_value(report.to_document()).unwrap();
        assert_eq!(value["tier"], "essential");
        assert_eq!(value["execution"]["totalPackages"], 3);
        assert_eq!(value["execution"]["successfulPackages"], 1);
        assert_eq!(value["execution"]["failedPackages"], 2);
        assert_eq!(value["execution"]["parallelJobs"], 2);
        assert_eq!(value["execution"]["dependencyOrder"], true);
        assert_eq!(value["packages"][0]["type"], "pip");
        assert_eq!(value["packages"][0]["result"], "success");
        assert_eq!(value["packages"][0]["duration"], 1.5);
        assert_eq!(value["packages"][1]["result"], "timeout");
        assert_eq!(value["planDigest"], plan.digest());
        assert!(value.get("aborted").is_none());
    }

    #[test]
    fn test_persist_writes_timestamped_and_latest() {
        let dir = tempfile::tempdir().unwrap();
        let plan = sample_plan();
        let report = Aggregator::new(&plan, context()).finish(&summary());

        let path = report.persist(&dir.path().join("reports")).unwrap();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("local-ci-essential-"));
        assert!(name.ends_with(".json"));

        let latest = std::fs::read_to_string(dir.path().join("reports/latest.json")).unwrap();
        let doc: ReportDocument = serde_json::from_str(&latest).unwrap();
        assert_eq!(doc.execution.skipped_packages, 3);
        assert_eq!(doc.run_id, report.run_id.to_string());
    }

    #[test]
    fn test_summary_names_failures() {
        let plan = sample_plan();
        let mut agg = Aggregator::new(&plan, context());
        agg.record(result(&pkg("a"), PackageState::Failed, 1200));
        let text = agg.finish(&summary()).render_summary();
        assert!(text.contains("a"));
        assert!(text.contains("failed"));
        assert!(text.contains("1.2s"));
    }
}

//! Pass/fail verdict and process exit code for a finished run.

use serde::{Deserialize, Serialize};

use crate::executor::{AbortReason, PackageState};
use crate::report::RunReport;

/// Exit code when every package succeeded.
pub const EXIT_SUCCESS: i32 = 0;
/// Exit code when any package failed, timed out or was skipped.
pub const EXIT_FAILURE: i32 = 1;
/// Exit code after an operator interrupt.
pub const EXIT_INTERRUPTED: i32 = 130;

/// Gate evaluation verdict.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GateVerdict {
    /// Whether the gate passed.
    pub passed: bool,

    /// One line per package that did not succeed (empty if passed).
    pub violations: Vec<String>,

    /// Summary message.
    pub message: String,
}

pub struct CiGate;

impl CiGate {
    /// The gate passes iff every planned package succeeded.
    pub fn evaluate(report: &RunReport) -> GateVerdict {
        let violations: Vec<String> = report
            .unsuccessful()
            .map(|r| {
                let what = match r.state {
                    PackageState::Failed => match r.exit_code {
                        Some(code) => format!("failed with exit code {code}"),
                        None => "failed".to_string(),
                    },
                    PackageState::TimedOut => "timed out".to_string(),
                    PackageState::Skipped => "was skipped".to_string(),
                    PackageState::Succeeded => "succeeded".to_string(),
                };
                format!(
                    "Package '{}' {} after {:.1}s",
                    r.path,
                    what,
                    r.duration_ms as f64 / 1000.0
                )
            })
            .collect();

        let passed = violations.is_empty();
        let message = if passed {
            format!("All {} packages passed", report.total_packages)
        } else {
            format!(
                "{} of {} packages did not pass",
                violations.len(),
                report.total_packages
            )
        };

        GateVerdict {
            passed,
            violations,
            message,
        }
    }

    /// Process exit code for a finished run.
    pub fn exit_code(report: &RunReport) -> i32 {
        if report.aborted == Some(AbortReason::Interrupted) {
            return EXIT_INTERRUPTED;
        }
        if Self::evaluate(report).passed {
            EXIT_SUCCESS
        } else {
            EXIT_FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecutionSummary, PackageResult};
    use crate::report::{Aggregator, ReportContext};
    use monoci_core::{plan, Ecosystem, Package, Tier};

    fn report_with(states: &[(&str, PackageState)], aborted: Option<AbortReason>) -> RunReport {
        let packages: Vec<Package> = states
            .iter()
            .map(|(n, _)| Package::new(*n, format!("/r/{n}"), *n, Ecosystem::Cargo))
            .collect();
        let plan = plan(packages.clone(), 4, false).unwrap();
        let mut agg = Aggregator::new(
            &plan,
            ReportContext {
                tier: Tier::Essential,
                parallel_jobs: 4,
                dependency_order: false,
                fail_fast: false,
            },
        );
        for (pkg, (_, state)) in packages.iter().zip(states) {
            let mut r = PackageResult::skipped(pkg, Some(0));
            r.state = *state;
            if *state == PackageState::Failed {
                r.exit_code = Some(2);
            }
            agg.record(r);
        }
        agg.finish(&ExecutionSummary {
            aborted,
            batches_started: 1,
        })
    }

    #[test]
    fn test_gate_passes_when_all_succeed() {
        let report = report_with(
            &[("a", PackageState::Succeeded), ("b", PackageState::Succeeded)],
            None,
        );
        let verdict = CiGate::evaluate(&report);
        assert!(verdict.passed);
        assert!(verdict.violations.is_empty());
        assert_eq!(CiGate::exit_code(&report), EXIT_SUCCESS);
    }

    #[test]
    fn test_gate_names_every_unsuccessful_package() {
        let report = report_with(
            &[
                ("a", PackageState::Succeeded),
                ("b", PackageState::Failed),
                ("c", PackageState::TimedOut),
                ("d", PackageState::Skipped),
            ],
            None,
        );
        let verdict = CiGate::evaluate(&report);
        assert!(!verdict.passed);
        assert_eq!(verdict.violations.len(), 3);
        assert!(verdict.violations[0].contains("'b' failed with exit code 2"));
        assert!(verdict.violations[1].contains("'c' timed out"));
        assert!(verdict.violations[2].contains("'d' was skipped"));
        assert_eq!(CiGate::exit_code(&report), EXIT_FAILURE);
    }

    #[test]
    fn test_interrupt_exit_code() {
        let report = report_with(
            &[("a", PackageState::TimedOut)],
            Some(AbortReason::Interrupted),
        );
        assert_eq!(CiGate::exit_code(&report), EXIT_INTERRUPTED);
    }

    #[test]
    fn test_empty_report_passes() {
        let report = report_with(&[], None);
        assert!(CiGate::evaluate(&report).passed);
    }
}

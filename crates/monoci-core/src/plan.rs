//! Execution planning: ordering packages into bounded batches.
//!
//! Dependency ordering is a depth heuristic, not a dependency solver. Deeper
//! packages run first on the assumption that leaves are depended upon by
//! shallower aggregator packages; a package whose real dependencies point
//! the other way can still be misordered.

use std::collections::BTreeSet;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::PlanError;
use crate::package::{Package, PackageId};

/// A group of packages executed concurrently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Batch {
    pub index: usize,
    pub packages: Vec<Package>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

/// Ordered batches covering every input package exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionPlan {
    pub batches: Vec<Batch>,
    pub max_parallelism: usize,
    pub dependency_ordered: bool,
}

impl ExecutionPlan {
    pub fn package_count(&self) -> usize {
        self.batches.iter().map(Batch::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Every planned package, in execution order.
    pub fn packages(&self) -> impl Iterator<Item = &Package> {
        self.batches.iter().flat_map(|b| b.packages.iter())
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.iter().map(Batch::len).collect()
    }

    /// SHA-256 over the ordered batch contents.
    ///
    /// Identical plans produce identical digests.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for batch in &self.batches {
            hasher.update(batch.index.to_le_bytes());
            for pkg in &batch.packages {
                hasher.update(pkg.id.as_str().as_bytes());
                hasher.update(b"\0");
            }
            hasher.update(b"\x1e");
        }
        hex::encode(hasher.finalize())
    }
}

/// Build an execution plan.
///
/// With `dependency_ordered`, packages are sorted by depth descending and
/// then by root path; otherwise input (discovery) order is kept. The sorted
/// list is cut into batches of at most `max_parallelism`.
pub fn plan(
    packages: Vec<Package>,
    max_parallelism: usize,
    dependency_ordered: bool,
) -> Result<ExecutionPlan, PlanError> {
    if max_parallelism == 0 {
        return Err(PlanError::ZeroParallelism);
    }

    let mut seen: BTreeSet<&PackageId> = BTreeSet::new();
    for pkg in &packages {
        if !seen.insert(&pkg.id) {
            return Err(PlanError::DuplicatePackage(pkg.id.to_string()));
        }
    }

    let mut ordered = packages;
    if dependency_ordered {
        info!(
            packages = ordered.len(),
            "Dependency order uses path depth (deepest first); declared dependencies are not resolved"
        );
        ordered.sort_by(|a, b| {
            b.dependency_depth
                .cmp(&a.dependency_depth)
                .then_with(|| a.id.cmp(&b.id))
        });
    }

    let mut batches = Vec::new();
    let mut iter = ordered.into_iter().peekable();
    while iter.peek().is_some() {
        let packages: Vec<Package> = iter.by_ref().take(max_parallelism).collect();
        batches.push(Batch {
            index: batches.len(),
            packages,
        });
    }

    let plan = ExecutionPlan {
        batches,
        max_parallelism,
        dependency_ordered,
    };
    debug!(
        batches = plan.batches.len(),
        packages = plan.package_count(),
        sizes = ?plan.batch_sizes(),
        "Execution plan built"
    );
    Ok(plan)
}

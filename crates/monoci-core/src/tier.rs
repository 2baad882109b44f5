//! Validation tiers: named bundles of operations with a default time budget.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::MonociError;
use crate::package::ops;

/// Validation tiers, each a superset of the previous one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// test, lint, typecheck
    #[default]
    Essential,

    /// essential + security-scan
    Extended,

    /// extended + check-all
    Full,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Essential, Tier::Extended, Tier::Full];

    pub fn name(&self) -> &'static str {
        match self {
            Tier::Essential => "essential",
            Tier::Extended => "extended",
            Tier::Full => "full",
        }
    }

    /// Operations run for every package, in order.
    pub fn operations(&self) -> &'static [&'static str] {
        match self {
            Tier::Essential => &[ops::TEST, ops::LINT, ops::TYPECHECK],
            Tier::Extended => &[ops::TEST, ops::LINT, ops::TYPECHECK, ops::SECURITY_SCAN],
            Tier::Full => &[
                ops::TEST,
                ops::LINT,
                ops::TYPECHECK,
                ops::SECURITY_SCAN,
                ops::CHECK_ALL,
            ],
        }
    }

    /// Default per-package timeout in seconds.
    pub fn default_timeout_secs(&self) -> u64 {
        match self {
            Tier::Essential => 120,
            Tier::Extended => 300,
            Tier::Full => 900,
        }
    }
}

impl FromStr for Tier {
    type Err = MonociError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        Tier::ALL
            .into_iter()
            .find(|t| t.name() == wanted)
            .ok_or_else(|| {
                MonociError::Configuration(format!(
                    "invalid tier '{s}' (expected essential, extended or full)"
                ))
            })
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

//! Package model: one independently validated unit of the monorepo.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// Abstract operation names shared by every ecosystem.
pub mod ops {
    pub const TEST: &str = "test";
    pub const LINT: &str = "lint";
    pub const TYPECHECK: &str = "typecheck";
    pub const SECURITY_SCAN: &str = "security-scan";
    pub const CHECK_ALL: &str = "check-all";
    pub const INSTALL: &str = "install";
    pub const BUILD: &str = "build";
}

/// Package identity: the root path relative to the discovery root, with `/`
/// separators. The discovery root itself is `.`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PackageId(String);

impl PackageId {
    /// Normalize a root-relative path into an identity.
    pub fn from_relative(path: &Path) -> Self {
        let segments: Vec<String> = path
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();
        if segments.is_empty() {
            PackageId(".".to_string())
        } else {
            PackageId(segments.join("/"))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Number of path segments below the discovery root.
    pub fn depth(&self) -> usize {
        if self.0 == "." {
            0
        } else {
            self.0.split('/').count()
        }
    }

    /// Whether `path` (root-relative, `/`-separated) lies inside this package.
    pub fn contains(&self, path: &str) -> bool {
        if self.0 == "." {
            return true;
        }
        Path::new(path).starts_with(Path::new(&self.0))
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Supported package ecosystems.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Ecosystem {
    Pixi,
    Poetry,
    Cargo,
    Npm,
    Pip,
}

impl Ecosystem {
    /// All ecosystems, in the priority used when several manifests share a root.
    pub const ALL: [Ecosystem; 5] = [
        Ecosystem::Pixi,
        Ecosystem::Poetry,
        Ecosystem::Cargo,
        Ecosystem::Npm,
        Ecosystem::Pip,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Ecosystem::Pixi => "pixi",
            Ecosystem::Poetry => "poetry",
            Ecosystem::Cargo => "cargo",
            Ecosystem::Npm => "npm",
            Ecosystem::Pip => "pip",
        }
    }

    /// Parse an ecosystem name as used on the command line.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.name() == name)
    }

    /// Native invocations for the abstract operations.
    pub fn default_commands(&self) -> BTreeMap<String, Invocation> {
        let table: &[(&str, &[&str])] = match self {
            Ecosystem::Pixi => &[
                (ops::INSTALL, &["pixi", "install"]),
                (ops::TEST, &["pixi", "run", "test"]),
                (ops::LINT, &["pixi", "run", "lint"]),
                (ops::TYPECHECK, &["pixi", "run", "typecheck"]),
                (ops::SECURITY_SCAN, &["pixi", "run", "security-scan"]),
                (ops::CHECK_ALL, &["pixi", "run", "check-all"]),
            ],
            Ecosystem::Poetry => &[
                (ops::INSTALL, &["poetry", "install"]),
                (ops::TEST, &["poetry", "run", "pytest"]),
                (ops::LINT, &["poetry", "run", "ruff", "check", "."]),
                (ops::TYPECHECK, &["poetry", "run", "mypy", "."]),
                (ops::SECURITY_SCAN, &["poetry", "run", "bandit", "-r", "."]),
            ],
            Ecosystem::Cargo => &[
                (ops::BUILD, &["cargo", "build"]),
                (ops::TEST, &["cargo", "test"]),
                (
                    ops::LINT,
                    &["cargo", "clippy", "--all-targets", "--", "-D", "warnings"],
                ),
                (ops::TYPECHECK, &["cargo", "check", "--all-targets"]),
                (ops::SECURITY_SCAN, &["cargo", "audit"]),
            ],
            Ecosystem::Npm => &[
                (ops::INSTALL, &["npm", "install"]),
                (ops::TEST, &["npm", "test"]),
                (ops::LINT, &["npm", "run", "lint"]),
                (ops::BUILD, &["npm", "run", "build"]),
                (ops::SECURITY_SCAN, &["npm", "audit"]),
            ],
            Ecosystem::Pip => &[
                (ops::INSTALL, &["pip", "install", "-r", "requirements.txt"]),
                (ops::TEST, &["python", "-m", "pytest"]),
                (ops::LINT, &["python", "-m", "ruff", "check", "."]),
                (ops::TYPECHECK, &["python", "-m", "mypy", "."]),
                (ops::SECURITY_SCAN, &["python", "-m", "bandit", "-r", "."]),
            ],
        };
        table
            .iter()
            .map(|(op, argv)| (op.to_string(), Invocation::from_argv(argv)))
            .collect()
    }
}

impl fmt::Display for Ecosystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A native command line; the first element is the executable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Invocation(Vec<String>);

impl Invocation {
    pub fn new(argv: Vec<String>) -> Self {
        Self(argv)
    }

    pub fn from_argv(argv: &[&str]) -> Self {
        Self(argv.iter().map(|s| s.to_string()).collect())
    }

    pub fn program(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    pub fn args(&self) -> &[String] {
        self.0.get(1..).unwrap_or(&[])
    }

    pub fn argv(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(" "))
    }
}

/// A discovered package. Immutable once the registry hands it out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    pub id: PackageId,

    /// Declared package name, or the directory name.
    pub name: String,

    pub ecosystem: Ecosystem,

    /// Root path relative to the discovery root.
    pub root: PathBuf,

    /// Absolute root path; the working directory for every operation.
    pub abs_root: PathBuf,

    /// Manifest that identified the package, relative to the discovery root.
    pub manifest: PathBuf,

    /// Operation name to native invocation.
    pub commands: BTreeMap<String, Invocation>,

    /// Path segments between the discovery root and the package root.
    pub dependency_depth: usize,

    pub has_tests: bool,
}

impl Package {
    /// Create a package with the ecosystem's default command set.
    pub fn new(
        root: impl Into<PathBuf>,
        abs_root: impl Into<PathBuf>,
        name: impl Into<String>,
        ecosystem: Ecosystem,
    ) -> Self {
        let root = root.into();
        let id = PackageId::from_relative(&root);
        let dependency_depth = id.depth();
        Self {
            manifest: root.clone(),
            id,
            name: name.into(),
            ecosystem,
            root,
            abs_root: abs_root.into(),
            commands: ecosystem.default_commands(),
            dependency_depth,
            has_tests: false,
        }
    }

    /// Add or replace a command.
    pub fn with_command(mut self, operation: &str, argv: Vec<String>) -> Self {
        self.commands
            .insert(operation.to_string(), Invocation::new(argv));
        self
    }

    /// Drop every command, leaving an empty command set.
    pub fn without_commands(mut self) -> Self {
        self.commands.clear();
        self
    }

    pub fn with_manifest(mut self, manifest: impl Into<PathBuf>) -> Self {
        self.manifest = manifest.into();
        self
    }

    pub fn with_tests(mut self, has_tests: bool) -> Self {
        self.has_tests = has_tests;
        self
    }

    pub fn command(&self, operation: &str) -> Option<&Invocation> {
        self.commands.get(operation)
    }
}

//! Package registry: read-only discovery of packages in a directory tree.
//!
//! Each directory is checked for ecosystem manifests. A directory yields at
//! most one package; when several ecosystems claim the same root the one
//! listed first in [`Ecosystem::ALL`] wins. Nested manifests produce nested
//! packages.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

use crate::error::{MonociError, Result};
use crate::package::{Ecosystem, Invocation, Package};

/// Directories never descended into.
pub const DEFAULT_SKIP_DIRS: &[&str] = &[
    "__pycache__",
    "node_modules",
    "venv",
    "env",
    "build",
    "dist",
    "htmlcov",
    "coverage",
    "target",
];

/// Manifests of ecosystems monoci recognizes but cannot run.
const UNSUPPORTED_MANIFESTS: &[(&str, &str)] = &[
    ("go.mod", "go"),
    ("pom.xml", "maven"),
    ("build.gradle", "gradle"),
    ("build.gradle.kts", "gradle"),
    ("Gemfile", "bundler"),
    ("composer.json", "composer"),
    ("mix.exs", "mix"),
];

const PIP_MANIFESTS: &[&str] = &["requirements.txt", "requirements.in", "setup.py", "setup.cfg"];

/// A manifest found for an ecosystem monoci does not support.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnsupportedManifest {
    pub path: PathBuf,
    pub kind: String,
}

/// Outcome of a registry scan.
#[derive(Debug, Clone, Default)]
pub struct Discovery {
    /// Packages in discovery order.
    pub packages: Vec<Package>,
    pub unsupported: Vec<UnsupportedManifest>,
    /// Manifests that could not be parsed; the package was still registered.
    pub warnings: Vec<String>,
}

/// Scans a tree for package manifests.
#[derive(Debug, Clone)]
pub struct PackageRegistry {
    root: PathBuf,
    skip_dirs: BTreeSet<String>,
    ecosystems: Option<BTreeSet<Ecosystem>>,
}

/// Ecosystem claim for a single directory.
struct Candidate {
    ecosystem: Ecosystem,
    manifest: PathBuf,
    name: Option<String>,
    extra_commands: BTreeMap<String, Invocation>,
}

impl PackageRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            skip_dirs: DEFAULT_SKIP_DIRS.iter().map(|s| s.to_string()).collect(),
            ecosystems: None,
        }
    }

    /// Skip additional directory names.
    pub fn with_skip_dirs<I, S>(mut self, dirs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skip_dirs.extend(dirs.into_iter().map(Into::into));
        self
    }

    /// Only report packages of the given ecosystems.
    pub fn with_ecosystems(mut self, ecosystems: impl IntoIterator<Item = Ecosystem>) -> Self {
        self.ecosystems = Some(ecosystems.into_iter().collect());
        self
    }

    /// Walk the tree and return every package found.
    ///
    /// Fails with [`MonociError::NoPackagesFound`] when nothing is recognized.
    pub fn discover(&self) -> Result<Discovery> {
        let root = fs::canonicalize(&self.root).map_err(|e| {
            MonociError::Configuration(format!(
                "cannot open root directory {}: {e}",
                self.root.display()
            ))
        })?;

        let mut discovery = Discovery::default();
        let walker = WalkDir::new(&root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !self.should_skip(e));

        for entry in walker.filter_map(|e| e.ok()) {
            if !entry.file_type().is_dir() {
                continue;
            }
            let dir = entry.path();
            let rel = dir.strip_prefix(&root).unwrap_or(Path::new("")).to_path_buf();

            let candidates = self.candidates(dir, &rel, &mut discovery.warnings);
            let Some(chosen) = candidates.into_iter().next() else {
                for (file, kind) in UNSUPPORTED_MANIFESTS {
                    if dir.join(file).is_file() {
                        warn!(path = %rel.join(file).display(), kind, "Unsupported manifest");
                        discovery.unsupported.push(UnsupportedManifest {
                            path: rel.join(file),
                            kind: kind.to_string(),
                        });
                    }
                }
                continue;
            };

            let dir_name = dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| ".".to_string());
            let name = chosen.name.unwrap_or(dir_name);

            let mut package = Package::new(rel.clone(), dir, name, chosen.ecosystem)
                .with_manifest(chosen.manifest)
                .with_tests(has_tests(dir, &self.skip_dirs));
            package.commands.extend(chosen.extra_commands);

            debug!(
                package = %package.id,
                ecosystem = %package.ecosystem,
                commands = package.commands.len(),
                "Discovered package"
            );
            discovery.packages.push(package);
        }

        if discovery.packages.is_empty() {
            return Err(MonociError::NoPackagesFound { root });
        }

        info!(
            packages = discovery.packages.len(),
            unsupported = discovery.unsupported.len(),
            "Package discovery complete"
        );
        Ok(discovery)
    }

    fn should_skip(&self, entry: &DirEntry) -> bool {
        if entry.depth() == 0 || !entry.file_type().is_dir() {
            return false;
        }
        let name = entry.file_name().to_string_lossy();
        name.starts_with('.') || self.skip_dirs.contains(name.as_ref())
    }

    fn wants(&self, ecosystem: Ecosystem) -> bool {
        self.ecosystems
            .as_ref()
            .map_or(true, |set| set.contains(&ecosystem))
    }

    /// Ecosystem claims for `dir`, highest priority first.
    fn candidates(&self, dir: &Path, rel: &Path, warnings: &mut Vec<String>) -> Vec<Candidate> {
        let mut found = Vec::new();

        let pyproject = dir.join("pyproject.toml");
        let pyproject_doc = if pyproject.is_file() {
            read_toml(&pyproject, rel.join("pyproject.toml"), warnings)
        } else {
            None
        };

        // pixi: [tool.pixi] in pyproject.toml, or a standalone pixi.toml
        if let Some(doc) = pyproject_doc.as_ref().and_then(|d| d.doc.as_ref()) {
            if let Some(pixi) = doc.get("tool").and_then(|t| t.get("pixi")) {
                let name = str_at(pixi, &["project", "name"])
                    .or_else(|| str_at(doc, &["project", "name"]));
                found.push(Candidate {
                    ecosystem: Ecosystem::Pixi,
                    manifest: rel.join("pyproject.toml"),
                    name,
                    extra_commands: pixi_tasks(pixi.get("tasks")),
                });
            }
        } else if pyproject_doc.as_ref().is_some_and(|d| d.raw.contains("[tool.pixi")) {
            found.push(Candidate {
                ecosystem: Ecosystem::Pixi,
                manifest: rel.join("pyproject.toml"),
                name: None,
                extra_commands: BTreeMap::new(),
            });
        }
        let pixi_toml = dir.join("pixi.toml");
        if pixi_toml.is_file() {
            if let Some(parsed) = read_toml(&pixi_toml, rel.join("pixi.toml"), warnings) {
                let doc = parsed.doc.as_ref();
                found.push(Candidate {
                    ecosystem: Ecosystem::Pixi,
                    manifest: rel.join("pixi.toml"),
                    name: doc.and_then(|d| {
                        str_at(d, &["project", "name"]).or_else(|| str_at(d, &["workspace", "name"]))
                    }),
                    extra_commands: pixi_tasks(doc.and_then(|d| d.get("tasks"))),
                });
            }
        }

        // poetry: [tool.poetry] in pyproject.toml
        if let Some(parsed) = pyproject_doc.as_ref() {
            let is_poetry = match parsed.doc.as_ref() {
                Some(doc) => doc.get("tool").and_then(|t| t.get("poetry")).is_some(),
                None => parsed.raw.contains("[tool.poetry"),
            };
            if is_poetry {
                let name = parsed.doc.as_ref().and_then(|d| {
                    str_at(d, &["tool", "poetry", "name"]).or_else(|| str_at(d, &["project", "name"]))
                });
                found.push(Candidate {
                    ecosystem: Ecosystem::Poetry,
                    manifest: rel.join("pyproject.toml"),
                    name,
                    extra_commands: BTreeMap::new(),
                });
            }
        }

        // cargo: Cargo.toml with a [package] table; virtual manifests are skipped
        let cargo_toml = dir.join("Cargo.toml");
        if cargo_toml.is_file() {
            if let Some(doc) = read_toml(&cargo_toml, rel.join("Cargo.toml"), warnings)
                .and_then(|p| p.doc)
            {
                if let Some(pkg) = doc.get("package") {
                    found.push(Candidate {
                        ecosystem: Ecosystem::Cargo,
                        manifest: rel.join("Cargo.toml"),
                        name: str_at(pkg, &["name"]),
                        extra_commands: BTreeMap::new(),
                    });
                }
            }
        }

        // npm: package.json, scripts become `npm run <script>`
        let package_json = dir.join("package.json");
        if package_json.is_file() {
            let (name, scripts) = match fs::read_to_string(&package_json)
                .map_err(|e| e.to_string())
                .and_then(|s| {
                    serde_json::from_str::<serde_json::Value>(&s).map_err(|e| e.to_string())
                }) {
                Ok(value) => (
                    value.get("name").and_then(|n| n.as_str()).map(str::to_string),
                    npm_scripts(value.get("scripts")),
                ),
                Err(e) => {
                    let msg = format!("{}: {e}", rel.join("package.json").display());
                    warn!("Error analyzing {}", msg);
                    warnings.push(msg);
                    (None, BTreeMap::new())
                }
            };
            found.push(Candidate {
                ecosystem: Ecosystem::Npm,
                manifest: rel.join("package.json"),
                name,
                extra_commands: scripts,
            });
        }

        // pip: requirements / setup files, or a plain PEP 621 pyproject.toml
        let pip_manifest = PIP_MANIFESTS
            .iter()
            .find(|f| dir.join(f).is_file())
            .map(|f| rel.join(f));
        let plain_pyproject = pyproject_doc
            .as_ref()
            .and_then(|p| p.doc.as_ref())
            .filter(|d| d.get("project").is_some());
        if let Some(manifest) = pip_manifest {
            let name = setup_name(&dir.join("setup.py"))
                .or_else(|| setup_name(&dir.join("setup.cfg")))
                .or_else(|| plain_pyproject.and_then(|d| str_at(d, &["project", "name"])));
            found.push(Candidate {
                ecosystem: Ecosystem::Pip,
                manifest,
                name,
                extra_commands: BTreeMap::new(),
            });
        } else if let Some(doc) = plain_pyproject {
            found.push(Candidate {
                ecosystem: Ecosystem::Pip,
                manifest: rel.join("pyproject.toml"),
                name: str_at(doc, &["project", "name"]),
                extra_commands: BTreeMap::new(),
            });
        }

        found.retain(|c| self.wants(c.ecosystem));
        found.sort_by_key(|c| {
            Ecosystem::ALL
                .iter()
                .position(|e| *e == c.ecosystem)
                .unwrap_or(usize::MAX)
        });
        if found.len() > 1 {
            debug!(
                root = %rel.display(),
                chosen = %found[0].ecosystem,
                others = ?found[1..].iter().map(|c| c.ecosystem.name()).collect::<Vec<_>>(),
                "Several ecosystems claim the same root"
            );
        }
        found
    }
}

/// Discover packages under `root` with default settings.
pub fn discover(root: &Path) -> Result<Vec<Package>> {
    PackageRegistry::new(root).discover().map(|d| d.packages)
}

struct ParsedToml {
    raw: String,
    doc: Option<toml::Value>,
}

fn read_toml(path: &Path, rel: PathBuf, warnings: &mut Vec<String>) -> Option<ParsedToml> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            let msg = format!("{}: {e}", rel.display());
            warn!("Error reading {}", msg);
            warnings.push(msg);
            return None;
        }
    };
    let doc = match raw.parse::<toml::Value>() {
        Ok(doc) => Some(doc),
        Err(e) => {
            let msg = format!("{}: {e}", rel.display());
            warn!("Error analyzing {}", msg);
            warnings.push(msg);
            None
        }
    };
    Some(ParsedToml { raw, doc })
}

fn str_at(value: &toml::Value, path: &[&str]) -> Option<String> {
    let mut cur = value;
    for key in path {
        cur = cur.get(*key)?;
    }
    cur.as_str().map(str::to_string)
}

fn pixi_tasks(tasks: Option<&toml::Value>) -> BTreeMap<String, Invocation> {
    tasks
        .and_then(|t| t.as_table())
        .map(|table| {
            table
                .keys()
                .map(|task| {
                    (
                        task.clone(),
                        Invocation::new(vec!["pixi".into(), "run".into(), task.clone()]),
                    )
                })
                .collect()
        })
        .unwrap_or_default()
}

fn npm_scripts(scripts: Option<&serde_json::Value>) -> BTreeMap<String, Invocation> {
    scripts
        .and_then(|s| s.as_object())
        .map(|obj| {
            obj.keys()
                .map(|script| {
                    (
                        script.clone(),
                        Invocation::new(vec!["npm".into(), "run".into(), script.clone()]),
                    )
                })
                .collect()
        })
        .unwrap_or_default()
}

fn setup_name(path: &Path) -> Option<String> {
    let content = fs::read_to_string(path).ok()?;
    let quoted = Regex::new(r#"name\s*=\s*["']([^"']+)["']"#).ok()?;
    if let Some(caps) = quoted.captures(&content) {
        return Some(caps[1].to_string());
    }
    // setup.cfg style: `name = pkg` under [metadata]
    let bare = Regex::new(r"(?m)^\s*name\s*=\s*([A-Za-z0-9_.\-]+)\s*$").ok()?;
    bare.captures(&content).map(|caps| caps[1].to_string())
}

fn is_test_dir(name: &str) -> bool {
    let lower = name.to_lowercase();
    lower == "test" || lower == "tests" || lower.starts_with("test_") || lower.ends_with("_test")
}

fn has_tests(dir: &Path, skip_dirs: &BTreeSet<String>) -> bool {
    let Ok(entries) = fs::read_dir(dir) else {
        return false;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        if entry.path().is_dir() && is_test_dir(&entry.file_name().to_string_lossy()) {
            return true;
        }
    }

    WalkDir::new(dir)
        .into_iter()
        .filter_entry(|e| {
            if e.depth() == 0 || !e.file_type().is_dir() {
                return true;
            }
            let name = e.file_name().to_string_lossy();
            !name.starts_with('.') && !skip_dirs.contains(name.as_ref())
        })
        .filter_map(|e| e.ok())
        .any(|e| {
            let name = e.file_name().to_string_lossy();
            e.file_type().is_file() && name.starts_with("test_") && name.ends_with(".py")
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::ops;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_pixi_detection_from_pyproject() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "pyproject.toml",
            "[tool.pixi.project]\nname = \"test-project\"\n\n[tool.pixi.tasks]\nbench = \"pytest --bench\"\n",
        );

        let discovery = PackageRegistry::new(dir.path()).discover().unwrap();
        assert_eq!(discovery.packages.len(), 1);
        let pkg = &discovery.packages[0];
        assert_eq!(pkg.name, "test-project");
        assert_eq!(pkg.ecosystem, Ecosystem::Pixi);
        assert_eq!(pkg.id.as_str(), ".");
        assert!(pkg.command(ops::TEST).is_some());
        assert!(pkg.command(ops::LINT).is_some());
        assert_eq!(pkg.command("bench").unwrap().to_string(), "pixi run bench");
    }

    #[test]
    fn test_poetry_detection() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "svc/pyproject.toml",
            "[tool.poetry]\nname = \"test-poetry-project\"\nversion = \"0.1.0\"\n",
        );

        let packages = discover(dir.path()).unwrap();
        assert_eq!(packages.len(), 1);
        assert_eq!(packages[0].name, "test-poetry-project");
        assert_eq!(packages[0].ecosystem, Ecosystem::Poetry);
        assert!(packages[0].command(ops::INSTALL).is_some());
    }

    #[test]
    fn test_npm_scripts_become_commands() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "web/package.json",
            r#"{"name": "test-npm-project", "scripts": {"test": "jest", "typecheck": "tsc"}}"#,
        );

        let packages = discover(dir.path()).unwrap();
        let pkg = &packages[0];
        assert_eq!(pkg.name, "test-npm-project");
        assert_eq!(pkg.command(ops::TEST).unwrap().to_string(), "npm run test");
        assert_eq!(
            pkg.command(ops::TYPECHECK).unwrap().to_string(),
            "npm run typecheck"
        );
    }

    #[test]
    fn test_invalid_package_json_still_registers() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "broken/package.json", "{ not json");

        let discovery = PackageRegistry::new(dir.path()).discover().unwrap();
        assert_eq!(discovery.packages.len(), 1);
        assert_eq!(discovery.packages[0].name, "broken");
        assert_eq!(discovery.warnings.len(), 1);
    }

    #[test]
    fn test_pip_name_from_setup_py() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "tools/setup.py",
            "from setuptools import setup\nsetup(name='tooling', version='1.0')\n",
        );

        let packages = discover(dir.path()).unwrap();
        assert_eq!(packages[0].ecosystem, Ecosystem::Pip);
        assert_eq!(packages[0].name, "tooling");
    }

    #[test]
    fn test_cargo_virtual_manifest_is_not_a_package() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "Cargo.toml", "[workspace]\nmembers = [\"crates/a\"]\n");
        write(
            dir.path(),
            "crates/a/Cargo.toml",
            "[package]\nname = \"a\"\nversion = \"0.1.0\"\n",
        );

        let packages = discover(dir.path()).unwrap();
        assert_eq!(packages.len(), 1);
        assert_eq!(packages[0].id.as_str(), "crates/a");
        assert_eq!(packages[0].dependency_depth, 2);
    }

    #[test]
    fn test_nested_manifests_are_separate_packages() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "package.json", r#"{"name": "root"}"#);
        write(dir.path(), "packages/ui/package.json", r#"{"name": "ui"}"#);

        let packages = discover(dir.path()).unwrap();
        let ids: Vec<_> = packages.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec![".", "packages/ui"]);
    }

    #[test]
    fn test_same_root_is_deduplicated_by_priority() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "lib/pyproject.toml",
            "[tool.pixi.project]\nname = \"lib\"\n",
        );
        write(dir.path(), "lib/requirements.txt", "pytest\n");

        let packages = discover(dir.path()).unwrap();
        assert_eq!(packages.len(), 1);
        assert_eq!(packages[0].ecosystem, Ecosystem::Pixi);
    }

    #[test]
    fn test_ecosystem_filter_falls_through_to_lower_priority() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "lib/pyproject.toml",
            "[tool.pixi.project]\nname = \"lib\"\n",
        );
        write(dir.path(), "lib/requirements.txt", "pytest\n");

        let discovery = PackageRegistry::new(dir.path())
            .with_ecosystems([Ecosystem::Pip])
            .discover()
            .unwrap();
        assert_eq!(discovery.packages[0].ecosystem, Ecosystem::Pip);
    }

    #[test]
    fn test_skips_ignored_and_hidden_dirs() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "app/package.json", r#"{"name": "app"}"#);
        write(dir.path(), "app/node_modules/dep/package.json", r#"{"name": "dep"}"#);
        write(dir.path(), ".cache/package.json", r#"{"name": "hidden"}"#);
        write(dir.path(), "vendor/package.json", r#"{"name": "vendored"}"#);

        let discovery = PackageRegistry::new(dir.path())
            .with_skip_dirs(["vendor"])
            .discover()
            .unwrap();
        let names: Vec<_> = discovery.packages.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["app"]);
    }

    #[test]
    fn test_unsupported_manifest_reported_without_aborting() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "svc-go/go.mod", "module example.com/svc\n");
        write(dir.path(), "svc-py/requirements.txt", "flask\n");

        let discovery = PackageRegistry::new(dir.path()).discover().unwrap();
        assert_eq!(discovery.packages.len(), 1);
        assert_eq!(discovery.unsupported.len(), 1);
        assert_eq!(discovery.unsupported[0].kind, "go");
    }

    #[test]
    fn test_no_packages_found() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "README.md", "# nothing here\n");

        let err = PackageRegistry::new(dir.path()).discover().unwrap_err();
        assert!(matches!(err, MonociError::NoPackagesFound { .. }));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_has_tests_detection() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a/requirements.txt", "pytest\n");
        write(dir.path(), "a/tests/test_a.py", "def test_a(): pass\n");
        write(dir.path(), "b/requirements.txt", "pytest\n");
        write(dir.path(), "b/src/b.py", "x = 1\n");

        let packages = discover(dir.path()).unwrap();
        let a = packages.iter().find(|p| p.name == "a").unwrap();
        let b = packages.iter().find(|p| p.name == "b").unwrap();
        assert!(a.has_tests);
        assert!(!b.has_tests);
    }

    #[test]
    fn test_discovery_order_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["zeta", "alpha", "mid"] {
            write(dir.path(), &format!("{name}/package.json"), "{}");
        }

        let first: Vec<_> = discover(dir.path()).unwrap().into_iter().map(|p| p.id).collect();
        let second: Vec<_> = discover(dir.path()).unwrap().into_iter().map(|p| p.id).collect();
        assert_eq!(first, second);
        assert_eq!(first[0].as_str(), "alpha");
    }
}

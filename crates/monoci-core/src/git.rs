//! Git integration for computing changed paths.
//!
//! All paths returned here are relative to the directory git runs in
//! (`--relative`), so they line up with package roots from the registry.

use std::collections::BTreeSet;
use std::path::Path;
use std::process::Command;

use crate::error::ChangeDetectionError;

type Result<T> = std::result::Result<T, ChangeDetectionError>;

fn git(repo_dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo_dir)
        .output()
        .map_err(|e| ChangeDetectionError::GitUnavailable(format!("failed to run git: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(ChangeDetectionError::CommandFailed {
            command: args.join(" "),
            stderr,
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Split `-z` output. Paths arrive verbatim, without C-style quoting.
fn nul_separated(output: &str) -> impl Iterator<Item = String> + '_ {
    output
        .split('\0')
        .filter(|p| !p.is_empty())
        .map(str::to_string)
}

/// Check whether a directory is inside a git work tree.
pub fn is_git_repo(dir: &Path) -> bool {
    Command::new("git")
        .args(["rev-parse", "--is-inside-work-tree"])
        .current_dir(dir)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Resolve `reference` to a full commit SHA.
pub fn resolve_ref(repo_dir: &Path, reference: &str) -> Result<String> {
    let spec = format!("{reference}^{{commit}}");
    git(repo_dir, &["rev-parse", "--verify", "--quiet", &spec])
        .map(|out| out.trim().to_string())
        .and_then(|sha| {
            if sha.is_empty() {
                Err(ChangeDetectionError::UnresolvedBaseRef {
                    base_ref: reference.to_string(),
                    detail: "empty rev-parse output".to_string(),
                })
            } else {
                Ok(sha)
            }
        })
        .map_err(|e| match e {
            ChangeDetectionError::CommandFailed { stderr, .. } => {
                ChangeDetectionError::UnresolvedBaseRef {
                    base_ref: reference.to_string(),
                    detail: if stderr.is_empty() {
                        "unknown revision".to_string()
                    } else {
                        stderr
                    },
                }
            }
            other => other,
        })
}

/// Paths changed relative to `base_ref`, including the working tree.
///
/// The result is the union of:
/// - commits on `HEAD` since its merge base with `base_ref`
/// - staged and unstaged changes to tracked files
/// - untracked files not ignored by `.gitignore`
///
/// Renames are reported as a deletion plus an addition, so both the old
/// and the new location count as changed.
pub fn changed_paths(repo_dir: &Path, base_ref: &str) -> Result<BTreeSet<String>> {
    if !is_git_repo(repo_dir) {
        return Err(ChangeDetectionError::NotARepository(repo_dir.to_path_buf()));
    }
    resolve_ref(repo_dir, base_ref)?;

    let mut paths = BTreeSet::new();

    let range = format!("{base_ref}...HEAD");
    paths.extend(nul_separated(&git(
        repo_dir,
        &["diff", "-z", "--name-only", "--no-renames", "--relative", &range],
    )?));

    // A repository without commits has no HEAD; nothing tracked can differ then.
    if resolve_ref(repo_dir, "HEAD").is_ok() {
        paths.extend(nul_separated(&git(
            repo_dir,
            &["diff", "-z", "--name-only", "--no-renames", "--relative", "HEAD"],
        )?));
    }

    paths.extend(nul_separated(&git(
        repo_dir,
        &["ls-files", "-z", "--others", "--exclude-standard"],
    )?));

    Ok(paths)
}

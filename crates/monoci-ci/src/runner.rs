//! Per-package operation execution.
//!
//! A [`PackageRunner`] runs a package's operations in order, in the
//! package's own directory, stopping at the first failure. Runners must
//! observe the cancellation token: once it fires they terminate whatever
//! they started and return [`RunOutcome::Cancelled`].

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use monoci_core::{Invocation, Package};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Bytes of stdout/stderr kept per operation.
pub const DEFAULT_TAIL_BYTES: usize = 4096;

/// Time between SIGTERM and SIGKILL when terminating a process group.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

/// Result of one operation of a package.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperationResult {
    /// Operation name (`test`, `lint`, ...).
    pub operation: String,

    /// Command line that was run.
    pub command: String,

    /// Exit code; `-1` when the process could not be spawned or was killed.
    pub exit_code: i32,

    /// Duration in milliseconds.
    pub duration_ms: u64,

    /// Last bytes of captured stdout.
    pub stdout_tail: String,

    /// Last bytes of captured stderr.
    pub stderr_tail: String,
}

impl OperationResult {
    /// Whether this operation passed (exit code 0).
    pub fn passed(&self) -> bool {
        self.exit_code == 0
    }
}

/// What a runner reports back for a package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every operation ran, or one failed. `exit_code` is 0 or the first
    /// failing operation's code.
    Completed {
        exit_code: i32,
        operations: Vec<OperationResult>,
    },

    /// The token fired before the package finished.
    Cancelled { operations: Vec<OperationResult> },
}

impl RunOutcome {
    pub fn operations(&self) -> &[OperationResult] {
        match self {
            RunOutcome::Completed { operations, .. } | RunOutcome::Cancelled { operations } => {
                operations
            }
        }
    }
}

/// Executes a package's operations.
#[async_trait]
pub trait PackageRunner: Send + Sync {
    async fn run(
        &self,
        package: &Package,
        operations: &[String],
        cancel: CancellationToken,
    ) -> RunOutcome;
}

/// Runs operations as child processes.
///
/// Each child gets its own process group on unix so cancellation reaches
/// anything it spawned.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    kill_grace: Duration,
    tail_bytes: usize,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self {
            kill_grace: DEFAULT_KILL_GRACE,
            tail_bytes: DEFAULT_TAIL_BYTES,
        }
    }
}

enum Exit {
    Exited(i32),
    Cancelled,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn with_tail_bytes(mut self, bytes: usize) -> Self {
        self.tail_bytes = bytes;
        self
    }

    async fn run_operation(
        &self,
        package: &Package,
        operation: &str,
        invocation: &Invocation,
        cancel: &CancellationToken,
    ) -> (OperationResult, Exit) {
        let start = Instant::now();
        let command_line = invocation.to_string();
        let failed = |stderr: String, start: Instant| OperationResult {
            operation: operation.to_string(),
            command: command_line.clone(),
            exit_code: -1,
            duration_ms: start.elapsed().as_millis() as u64,
            stdout_tail: String::new(),
            stderr_tail: stderr,
        };

        let Some(program) = invocation.program() else {
            let msg = format!("Operation {operation} has empty command");
            return (failed(msg, start), Exit::Exited(-1));
        };

        let mut command = Command::new(program);
        command
            .args(invocation.args())
            .current_dir(&package.abs_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(package = %package.id, operation, error = %e, "Failed to spawn");
                let msg = format!("failed to spawn '{command_line}': {e}");
                return (failed(msg, start), Exit::Exited(-1));
            }
        };

        let pid = child.id();
        let stdout = tokio::spawn(read_stream(child.stdout.take()));
        let stderr = tokio::spawn(read_stream(child.stderr.take()));

        let exit = tokio::select! {
            status = child.wait() => {
                // Background jobs the command left behind would keep the pipes open.
                kill_group(pid);
                match status {
                    Ok(status) => Exit::Exited(status.code().unwrap_or(-1)),
                    Err(e) => {
                        warn!(package = %package.id, operation, error = %e, "Error waiting for process");
                        Exit::Exited(-1)
                    }
                }
            }
            _ = cancel.cancelled() => {
                debug!(package = %package.id, operation, "Cancellation requested; terminating");
                terminate(&mut child, self.kill_grace).await;
                Exit::Cancelled
            }
        };

        // Pipes close once the whole group is gone; don't hang on escapees.
        let stdout = tokio::time::timeout(self.kill_grace, stdout)
            .await
            .ok()
            .and_then(Result::ok)
            .unwrap_or_default();
        let stderr = tokio::time::timeout(self.kill_grace, stderr)
            .await
            .ok()
            .and_then(Result::ok)
            .unwrap_or_default();

        let exit_code = match exit {
            Exit::Exited(code) => code,
            Exit::Cancelled => -1,
        };
        let result = OperationResult {
            operation: operation.to_string(),
            command: command_line.clone(),
            exit_code,
            duration_ms: start.elapsed().as_millis() as u64,
            stdout_tail: tail(&stdout, self.tail_bytes),
            stderr_tail: tail(&stderr, self.tail_bytes),
        };
        (result, exit)
    }
}

#[async_trait]
impl PackageRunner for ProcessRunner {
    async fn run(
        &self,
        package: &Package,
        operations: &[String],
        cancel: CancellationToken,
    ) -> RunOutcome {
        let mut results = Vec::new();

        for operation in operations {
            let Some(invocation) = package.command(operation) else {
                debug!(package = %package.id, operation = %operation, "Operation not available; skipping");
                continue;
            };
            if cancel.is_cancelled() {
                return RunOutcome::Cancelled {
                    operations: results,
                };
            }

            debug!(package = %package.id, operation = %operation, command = %invocation, "Running operation");
            let (result, exit) = self
                .run_operation(package, operation, invocation, &cancel)
                .await;
            results.push(result);

            match exit {
                Exit::Cancelled => {
                    return RunOutcome::Cancelled {
                        operations: results,
                    }
                }
                Exit::Exited(0) => {}
                Exit::Exited(code) => {
                    return RunOutcome::Completed {
                        exit_code: code,
                        operations: results,
                    }
                }
            }
        }

        RunOutcome::Completed {
            exit_code: 0,
            operations: results,
        }
    }
}

/// Locate `program` on `PATH`. Paths containing a separator are checked
/// as given.
pub fn find_on_path(program: &str) -> Option<PathBuf> {
    let candidate = PathBuf::from(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then_some(candidate);
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|p| p.is_file())
}

async fn read_stream<R: AsyncRead + Unpin>(stream: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut stream) = stream {
        let _ = stream.read_to_end(&mut buf).await;
    }
    buf
}

/// Last `max` bytes of `bytes`, decoded lossily.
fn tail(bytes: &[u8], max: usize) -> String {
    let start = bytes.len().saturating_sub(max);
    String::from_utf8_lossy(&bytes[start..]).into_owned()
}

/// SIGKILL whatever is left in the child's process group.
fn kill_group(pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        // SAFETY: killpg only sends a signal; the group was created for this
        // child with process_group(0).
        unsafe {
            libc::killpg(pid as libc::pid_t, libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}

/// Terminate a child and its process group, then reap it.
async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        let pgid = pid as libc::pid_t;
        // SAFETY: killpg only sends a signal; pgid is the group we created
        // for this child with process_group(0).
        unsafe {
            libc::killpg(pgid, libc::SIGTERM);
        }
        let exited = tokio::time::timeout(grace, child.wait()).await.is_ok();
        // Stragglers in the group get SIGKILL either way.
        kill_group(Some(pid));
        if exited {
            return;
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    if let Err(e) = child.kill().await {
        debug!(error = %e, "kill after termination signal failed");
    }
}

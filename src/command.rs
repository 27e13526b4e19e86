//! # Command Executor
//!
//! Runs host virtualization control binaries (`docker-machine`,
//! `VBoxManage`, `powershell`, ...) as subprocesses with a bounded timeout.
//!
//! ## Execution Model
//!
//! | Step | Behavior                                                   |
//! |------|------------------------------------------------------------|
//! | 1    | Acquire a permit (at most `MAX_CONCURRENT_COMMANDS` run)    |
//! | 2    | Spawn with piped stdout/stderr, stdin closed               |
//! | 3    | Wait up to the verb's timeout, killing the child on expiry |
//! | 4    | Non-zero exit → [`Error::CommandFailed`] with the output   |
//!
//! Stdout is captured as text and trimmed; callers parse it. Nothing here
//! retries: the hypervisor recovery ladder is the only retry path.
//!
//! The subprocess boundary is the [`CommandRunner`] trait so backends can be
//! driven by a scripted runner in tests.

use crate::constants::{MAX_CONCURRENT_COMMANDS, MAX_OUTPUT_SIZE};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Captured result of one subprocess invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code (`None` if killed by a signal).
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns true if the process exited with status 0.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Subprocess boundary.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with `args`, waiting at most `limit`.
    ///
    /// Returns the captured output regardless of exit status; only spawn
    /// failures and timeouts are errors at this level.
    async fn run(&self, program: &str, args: &[String], limit: Duration) -> Result<CommandOutput>;
}

/// [`CommandRunner`] backed by real subprocesses.
pub struct SystemRunner {
    permits: Semaphore,
}

impl SystemRunner {
    /// Creates a runner allowing `MAX_CONCURRENT_COMMANDS` parallel children.
    pub fn new() -> Self {
        Self::with_concurrency(MAX_CONCURRENT_COMMANDS)
    }

    /// Creates a runner with a custom concurrency bound.
    pub fn with_concurrency(limit: usize) -> Self {
        Self {
            permits: Semaphore::new(limit.max(1)),
        }
    }
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String], limit: Duration) -> Result<CommandOutput> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| Error::Internal(format!("command semaphore closed: {e}")))?;

        debug!("Command: {} {}", program, args.join(" "));

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = timeout(limit, cmd.output())
            .await
            .map_err(|_| Error::Timeout {
                operation: format!("{program} {}", args.join(" ")),
                duration: limit,
            })?
            .map_err(|e| Error::SpawnFailed {
                program: program.to_string(),
                reason: e.to_string(),
            })?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: capture(program, &output.stdout),
            stderr: capture(program, &output.stderr),
        })
    }
}

/// Decodes captured bytes, truncating oversized output.
fn capture(program: &str, bytes: &[u8]) -> String {
    let bytes = if bytes.len() > MAX_OUTPUT_SIZE {
        warn!("{} output truncated to {} bytes", program, MAX_OUTPUT_SIZE);
        &bytes[..MAX_OUTPUT_SIZE]
    } else {
        bytes
    };
    String::from_utf8_lossy(bytes).trim().to_string()
}

/// A control binary bound to a runner.
///
/// Cheap to clone; all clones share the runner (and its concurrency bound).
#[derive(Clone)]
pub struct CommandExecutor {
    program: String,
    runner: Arc<dyn CommandRunner>,
}

impl CommandExecutor {
    /// Creates an executor for `program`.
    pub fn new(program: impl Into<String>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            program: program.into(),
            runner,
        }
    }

    /// Returns the program this executor invokes.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Runs the program and returns its stdout, failing on non-zero exit.
    pub async fn run<S: AsRef<str>>(&self, args: &[S], limit: Duration) -> Result<String> {
        let args: Vec<String> = args.iter().map(|a| a.as_ref().to_string()).collect();
        let output = self.runner.run(&self.program, &args, limit).await?;

        if !output.success() {
            let captured = if output.stderr.is_empty() {
                output.stdout
            } else if output.stdout.is_empty() {
                output.stderr
            } else {
                format!("{}\n{}", output.stdout, output.stderr)
            };
            return Err(Error::CommandFailed {
                command: format!("{} {}", self.program, args.join(" ")),
                code: output.code,
                output: captured,
            });
        }

        Ok(output.stdout)
    }

    /// Runs a read-only query; failures are logged and mapped to `None`.
    pub async fn query<S: AsRef<str>>(&self, args: &[S], limit: Duration) -> Option<String> {
        match self.run(args, limit).await {
            Ok(out) => Some(out),
            Err(e) => {
                warn!(program = %self.program, error = %e, "query failed");
                None
            }
        }
    }
}

impl std::fmt::Debug for CommandExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandExecutor")
            .field("program", &self.program)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_output_success() {
        let ok = CommandOutput {
            code: Some(0),
            ..Default::default()
        };
        assert!(ok.success());

        let killed = CommandOutput::default();
        assert!(!killed.success());
    }

    #[test]
    fn test_capture_trims_and_truncates() {
        assert_eq!(capture("x", b"  Running\n"), "Running");

        let big = vec![b'a'; MAX_OUTPUT_SIZE + 10];
        assert_eq!(capture("x", &big).len(), MAX_OUTPUT_SIZE);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_system_runner_reports_exit_code() {
        let exec = CommandExecutor::new("sh", Arc::new(SystemRunner::new()));

        let out = exec.run(&["-c", "echo hello"], Duration::from_secs(5)).await;
        assert_eq!(out.unwrap(), "hello");

        let err = exec
            .run(&["-c", "echo boom >&2; exit 3"], Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            Error::CommandFailed { code, output, .. } => {
                assert_eq!(code, Some(3));
                assert_eq!(output, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_system_runner_times_out() {
        let exec = CommandExecutor::new("sleep", Arc::new(SystemRunner::new()));
        let err = exec
            .run(&["5"], Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_failure() {
        let exec = CommandExecutor::new(
            "definitely-not-a-real-binary-name",
            Arc::new(SystemRunner::new()),
        );
        let err = exec
            .run(&["--version"], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SpawnFailed { .. }));
        assert!(exec.query(&["--version"], Duration::from_secs(1)).await.is_none());
    }
}

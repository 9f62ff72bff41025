//! External command execution with bounded timeouts.
//!
//! Every interaction with the target daemon and the host socket table goes
//! through a [`CommandRunner`]. The system implementation spawns the process
//! with `kill_on_drop`, so a timed-out command is reaped instead of being left
//! to hang the calling request.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, error, trace};

/// Captured output of a command that exited successfully.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, if the process exited normally.
    pub status_code: Option<i32>,
    /// Captured stdout (lossy UTF-8).
    pub stdout: String,
    /// Captured stderr (lossy UTF-8).
    pub stderr: String,
}

impl CommandOutput {
    /// Output of a successful command with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }
}

/// Failure modes of an external command.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The process could not be started.
    #[error("failed to start [{command}]: {source}")]
    Spawn {
        /// The command line.
        command: String,
        /// The spawn error.
        #[source]
        source: std::io::Error,
    },

    /// The process did not finish within its timeout and was killed.
    #[error("command [{command}] timed out after {timeout:?}")]
    Timeout {
        /// The command line.
        command: String,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// The process exited with a non-zero status.
    #[error("command [{command}] failed with status {status:?}: {stderr}")]
    Failed {
        /// The command line.
        command: String,
        /// Exit code, if any.
        status: Option<i32>,
        /// Captured stdout.
        stdout: String,
        /// Captured stderr.
        stderr: String,
    },
}

impl ProcessError {
    /// Combined stdout and stderr of a failed command, empty otherwise.
    pub fn output_text(&self) -> String {
        match self {
            ProcessError::Failed { stdout, stderr, .. } => format!("{}\n{}", stdout, stderr),
            _ => String::new(),
        }
    }
}

/// Runs external administration commands.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with `args`, failing if it exits non-zero or exceeds `timeout`.
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput, ProcessError>;
}

/// Renders a program and its arguments as a single display string.
pub fn command_line(program: &str, args: &[String]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

/// [`CommandRunner`] backed by real child processes.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner;

impl SystemRunner {
    /// Create a new system runner.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput, ProcessError> {
        let command = command_line(program, args);
        debug!(target: "netboot::runner", "executing {}", command);
        let start_time = Instant::now();

        let child = tokio::process::Command::new(program)
            .args(args)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(timeout, child).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => return Err(ProcessError::Spawn { command, source }),
            Err(_) => {
                error!(target: "netboot::runner", "{} timed out after {:?}", command, timeout);
                return Err(ProcessError::Timeout { command, timeout });
            }
        };

        let elapsed = start_time.elapsed();
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        debug!(target: "netboot::runner", "{} completed in {:?} with status {}", command, elapsed, output.status);
        trace!(target: "netboot::runner", "{} stdout: {}", command, stdout.trim());
        if !stderr.is_empty() {
            trace!(target: "netboot::runner", "{} stderr: {}", command, stderr.trim());
        }

        if !output.status.success() {
            error!(target: "netboot::runner", "{} failed with {} after {:?}: {}", command, output.status, elapsed, stderr.trim());
            return Err(ProcessError::Failed {
                command,
                status: output.status.code(),
                stdout,
                stderr,
            });
        }

        Ok(CommandOutput {
            status_code: output.status.code(),
            stdout,
            stderr,
        })
    }
}

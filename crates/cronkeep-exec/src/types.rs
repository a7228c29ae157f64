//! Shared data types for cronkeep-exec.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::error::{ExecError, Result};

// ---------------------------------------------------------------------------
// CommandLine
// ---------------------------------------------------------------------------

/// A program plus its argument vector.
///
/// A bare command string with no arguments that contains whitespace
/// (`"php bin/console cache:clear"`) is handed to `sh -c`; anything else is
/// executed directly with `args` passed verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// True when the command must go through the shell.
    pub fn needs_shell(&self) -> bool {
        self.args.is_empty() && self.program.trim().contains(char::is_whitespace)
    }

    pub(crate) fn to_command(&self) -> tokio::process::Command {
        if self.needs_shell() {
            let mut cmd = tokio::process::Command::new("sh");
            cmd.arg("-c").arg(&self.program);
            cmd
        } else {
            let mut cmd = tokio::process::Command::new(&self.program);
            cmd.args(&self.args);
            cmd
        }
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.args.is_empty() {
            write!(f, "{}", self.program)
        } else {
            write!(f, "{} {}", self.program, self.args.join(" "))
        }
    }
}

// ---------------------------------------------------------------------------
// ExecOptions
// ---------------------------------------------------------------------------

/// Per-invocation knobs.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Wall-clock budget. The child is killed when it is exceeded.
    pub timeout: Option<Duration>,

    /// Working directory; inherits the caller's when unset.
    pub cwd: Option<PathBuf>,
}

impl ExecOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            cwd: None,
        }
    }
}

// ---------------------------------------------------------------------------
// ExecResult
// ---------------------------------------------------------------------------

/// Captured outcome of a finished process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    /// `-1` when the process was terminated by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

// ---------------------------------------------------------------------------
// ProcessHandle
// ---------------------------------------------------------------------------

/// A started process. Await [`ProcessHandle::wait`] to collect its result.
///
/// The child keeps running when the handle is dropped; its supervising task
/// still enforces the timeout.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    task: JoinHandle<Result<ExecResult>>,
}

impl ProcessHandle {
    pub fn new(pid: Option<u32>, task: JoinHandle<Result<ExecResult>>) -> Self {
        Self { pid, task }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn wait(self) -> Result<ExecResult> {
        self.task
            .await
            .map_err(|e| ExecError::Join(e.to_string()))?
    }
}

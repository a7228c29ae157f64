//! `ProcessSpawner`: the seam between the scheduler and the operating system.
//!
//! The scheduler only ever needs two things from a process: start it and come
//! back for the result later, or run it to completion right now. Both paths
//! capture stdout/stderr and enforce the per-job timeout.

use async_trait::async_trait;
use std::process::Stdio;
use tracing::{debug, warn};

use crate::{
    error::{ExecError, Result},
    types::{CommandLine, ExecOptions, ExecResult, ProcessHandle},
};

#[async_trait]
pub trait ProcessSpawner: Send + Sync {
    /// Start `command` and return immediately with a handle.
    async fn start(&self, command: &CommandLine, options: &ExecOptions) -> Result<ProcessHandle>;

    /// Run `command` to completion.
    async fn run(&self, command: &CommandLine, options: &ExecOptions) -> Result<ExecResult> {
        self.start(command, options).await?.wait().await
    }
}

/// Production spawner on top of `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSpawner;

impl TokioSpawner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessSpawner for TokioSpawner {
    async fn start(&self, command: &CommandLine, options: &ExecOptions) -> Result<ProcessHandle> {
        debug!(command = %command, "spawning process");

        let mut cmd = command.to_command();
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            // Dropping the wait future on timeout must take the child down with it.
            .kill_on_drop(true);
        if let Some(ref cwd) = options.cwd {
            cmd.current_dir(cwd);
        }

        let child = cmd
            .spawn()
            .map_err(|e| ExecError::Spawn(format!("{command}: {e}")))?;
        let pid = child.id();
        let timeout = options.timeout;
        let command_text = command.to_string();

        let task = tokio::spawn(async move {
            let output = match timeout {
                Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                    Ok(result) => result?,
                    Err(_elapsed) => {
                        warn!(command = %command_text, timeout_ms = limit.as_millis() as u64, "process killed after timeout");
                        return Err(ExecError::Timeout {
                            ms: limit.as_millis() as u64,
                        });
                    }
                },
                None => child.wait_with_output().await?,
            };

            Ok(ExecResult {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: strip_text(&output.stdout),
                stderr: strip_text(&output.stderr),
            })
        });

        Ok(ProcessHandle::new(pid, task))
    }
}

/// Strip ANSI escape codes and convert bytes to a UTF-8 string.
fn strip_text(raw: &[u8]) -> String {
    let clean = strip_ansi_escapes::strip(raw);
    String::from_utf8_lossy(&clean).into_owned()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Host subprocess execution with timeouts and output capture.
//!
//! Commands are handed to an interpreter binary (`sh` unless configured
//! otherwise) as `interpreter -c command`, each invocation an independent
//! subprocess rooted at the caller's working directory. Nothing carries over
//! between invocations except what the caller persists.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;

use crate::limits::ResourceLimits;

const TRUNCATION_MARKER: &str = "\n... [output truncated] ...\n";

/// Errors from the low-level command runner.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The command did not finish within the configured timeout. The
    /// subprocess has been killed by the time this is returned.
    #[error("command timed out after {timeout:?}")]
    Timeout {
        /// The limit that was exceeded.
        timeout: Duration,
    },
    /// The subprocess could not be started at all, e.g. the interpreter is
    /// missing or the working directory no longer exists.
    #[error("failed to spawn command: {0}")]
    Spawn(#[source] std::io::Error),
    /// The subprocess started but its output could not be collected.
    #[error("failed to collect command output: {0}")]
    Wait(#[source] std::io::Error),
}

/// Captured outcome of one subprocess invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Process exit code; `-1` when the process died to a signal.
    pub exit_code: i32,
    /// Lossily decoded standard output.
    pub stdout: String,
    /// Lossily decoded standard error.
    pub stderr: String,
    /// Whether either stream was cut at the configured cap.
    pub truncated: bool,
}

impl CommandOutput {
    /// Whether the exit status indicates success.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs command strings through a host command interpreter.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    interpreter: String,
}

impl Default for CommandExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandExecutor {
    /// Executor using `sh`.
    pub fn new() -> Self {
        Self {
            interpreter: "sh".to_string(),
        }
    }

    /// Executor using a specific interpreter binary, e.g. `bash`.
    pub fn with_interpreter(interpreter: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
        }
    }

    /// Name of the interpreter binary this executor spawns.
    pub fn interpreter(&self) -> &str {
        &self.interpreter
    }

    /// Run `command` in `cwd`, bounded by `limits`.
    ///
    /// The command string goes to the interpreter verbatim via `-c`, so
    /// pipes, redirection, and chaining all work. Stdin is closed. On
    /// timeout the subprocess is killed and [`ExecError::Timeout`] comes
    /// back; a non-zero exit is not an error, it is a [`CommandOutput`].
    pub async fn run(
        &self,
        command: &str,
        cwd: &Path,
        limits: &ResourceLimits,
    ) -> Result<CommandOutput, ExecError> {
        tracing::debug!(
            interpreter = %self.interpreter,
            cwd = %cwd.display(),
            command,
            "spawning command"
        );

        let child = Command::new(&self.interpreter)
            .arg("-c")
            .arg(command)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(ExecError::Spawn)?;

        let output = match tokio::time::timeout(limits.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(ExecError::Wait)?,
            Err(_) => {
                // Dropping the wait future drops the child handle, and
                // kill_on_drop takes the process down with it.
                tracing::warn!(command, timeout = ?limits.timeout, "command timed out");
                return Err(ExecError::Timeout {
                    timeout: limits.timeout,
                });
            }
        };

        let exit_code = output.status.code().unwrap_or(-1);
        let (stdout, stdout_cut) = truncate_output(&output.stdout, limits.max_output_bytes);
        let (stderr, stderr_cut) = truncate_output(&output.stderr, limits.max_output_bytes);

        Ok(CommandOutput {
            exit_code,
            stdout,
            stderr,
            truncated: stdout_cut || stderr_cut,
        })
    }
}

/// Decode captured bytes, cutting them at `max_bytes` on a char boundary.
fn truncate_output(bytes: &[u8], max_bytes: u64) -> (String, bool) {
    let decoded = String::from_utf8_lossy(bytes);
    let max = max_bytes as usize;
    if decoded.len() <= max {
        return (decoded.into_owned(), false);
    }

    let mut cut = max;
    while cut > 0 && !decoded.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut truncated = decoded[..cut].to_string();
    truncated.push_str(TRUNCATION_MARKER);
    (truncated, true)
}

/// Detect a trailing directory line in command output.
///
/// The last non-empty line of `raw_output` is a candidate new working
/// directory. When it names a directory that exists, the line is consumed:
/// the returned output has it stripped and the path comes back for the
/// caller to adopt. Otherwise the output is returned untouched. This is what
/// lets `cd sub && pwd` move a tracked shell.
///
/// The check hits the real filesystem, so only commands that print paths
/// valid on this host (usually absolute, as `pwd` does) trigger it.
pub fn infer_cwd_change(raw_output: &str) -> (String, Option<PathBuf>) {
    let trimmed = raw_output.trim();
    if trimmed.is_empty() {
        return (raw_output.to_string(), None);
    }

    let (head, last) = match trimmed.rsplit_once('\n') {
        Some((head, last)) => (head, last),
        None => ("", trimmed),
    };

    let candidate = last.trim();
    if !candidate.is_empty() && Path::new(candidate).is_dir() {
        (head.to_string(), Some(PathBuf::from(candidate)))
    } else {
        (raw_output.to_string(), None)
    }
}

//! Session API tying shells, history, and execution together.
//!
//! A [`Whelk`] session gives an agent a set of named virtual shells to run
//! commands in. Each shell is a tracked working directory plus an append-only
//! command history; execution happens in independent host subprocesses that
//! are rooted at the tracked directory.
//!
//! # Example
//!
//! ```rust,ignore
//! use whelk::Whelk;
//!
//! let whelk = Whelk::builder().build();
//!
//! // Runs in the current shell, created on first use.
//! whelk.run_command("cargo test 2>&1 | tail -5", None).await?;
//!
//! // Commands that end by printing a directory move the shell there.
//! whelk.run_command("cd /tmp && pwd", None).await?;
//! assert_eq!(whelk.cwd(None).await?, PathBuf::from("/tmp"));
//!
//! // Everything that ran is on the record.
//! println!("{}", whelk.history_formatted(None).await?);
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::executor::{CommandExecutor, ExecError, infer_cwd_change};
use crate::history::{DEFAULT_HISTORY_LIMIT, HistoryEntry, HistoryLedger};
use crate::limits::ResourceLimits;
use crate::listing::long_listing;
use crate::registry::{Shell, ShellId, ShellRegistry};
use crate::store::{InMemoryStore, MemoryStore, StoreError};

/// Errors surfaced by session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Store lookup or persistence failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Subprocess-level failure, including timeouts.
    #[error(transparent)]
    Exec(#[from] ExecError),
}

impl SessionError {
    /// Whether this error is a command timeout. The timed-out attempt is
    /// already recorded in history when this is true.
    pub fn is_timeout(&self) -> bool {
        matches!(self, SessionError::Exec(ExecError::Timeout { .. }))
    }
}

/// Builder for constructing a [`Whelk`] session.
///
/// # Example
///
/// ```rust,ignore
/// let whelk = Whelk::builder()
///     .interpreter("bash")
///     .limits(ResourceLimits {
///         timeout: Duration::from_secs(120),
///         ..ResourceLimits::default()
///     })
///     .build();
/// ```
pub struct WhelkBuilder {
    store: Option<Arc<dyn MemoryStore>>,
    executor: CommandExecutor,
    limits: ResourceLimits,
}

impl std::fmt::Debug for WhelkBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WhelkBuilder")
            .field("has_store", &self.store.is_some())
            .field("executor", &self.executor)
            .field("limits", &self.limits)
            .finish()
    }
}

impl Default for WhelkBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl WhelkBuilder {
    /// Create a new session builder with default settings.
    ///
    /// Uses [`InMemoryStore`] and `sh` by default.
    pub fn new() -> Self {
        Self {
            store: None,
            executor: CommandExecutor::new(),
            limits: ResourceLimits::default(),
        }
    }

    /// Set a custom store backend.
    pub fn store(mut self, store: impl MemoryStore + 'static) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    /// Set a custom store backend from an Arc.
    pub fn store_arc(mut self, store: Arc<dyn MemoryStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the interpreter binary commands run through, e.g. `bash`.
    pub fn interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.executor = CommandExecutor::with_interpreter(interpreter);
        self
    }

    /// Set the default resource limits applied to each command.
    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Build the session with the configured settings.
    pub fn build(self) -> Whelk {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryStore::new()));

        Whelk {
            registry: ShellRegistry::new(Arc::clone(&store)),
            ledger: HistoryLedger::new(store),
            executor: self.executor,
            limits: self.limits,
        }
    }
}

/// A session of virtual shells for agent-driven command execution.
///
/// Operations that take `shell: Option<&ShellId>` target the named shell, or
/// the current shell when given `None`. The current shell is created on
/// demand, so a fresh session works without setup.
///
/// # Example
///
/// ```rust,ignore
/// let whelk = Whelk::builder().build();
///
/// let success = whelk.run_command("ls -alh", None).await?;
/// let transcript = whelk.history_formatted(None).await?;
/// ```
pub struct Whelk {
    registry: ShellRegistry,
    ledger: HistoryLedger,
    executor: CommandExecutor,
    limits: ResourceLimits,
}

impl std::fmt::Debug for Whelk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Whelk")
            .field("executor", &self.executor)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl Whelk {
    /// Create a new session builder with default settings.
    pub fn builder() -> WhelkBuilder {
        WhelkBuilder::new()
    }

    /// The default resource limits applied to each command.
    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// The current shell, created on demand if none exists.
    pub async fn current_shell(&self) -> Result<Shell, SessionError> {
        Ok(self.registry.current_shell().await?)
    }

    /// Create an additional shell rooted at the process working directory.
    /// It does not become current; see [`Whelk::set_current_shell`].
    pub async fn new_shell(&self) -> Result<Shell, SessionError> {
        Ok(self.registry.new_shell().await?)
    }

    /// Make `id` the current shell. A no-op if it already is.
    pub async fn set_current_shell(&self, id: &ShellId) -> Result<(), SessionError> {
        Ok(self.registry.set_current(id).await?)
    }

    /// Every tracked shell.
    pub async fn list_active_shells(&self) -> Result<Vec<Shell>, SessionError> {
        Ok(self.registry.list().await?)
    }

    /// Tracked working directory of a shell.
    pub async fn cwd(&self, shell: Option<&ShellId>) -> Result<PathBuf, SessionError> {
        let shell_id = self.resolve(shell).await?;
        Ok(self.registry.get_cwd(&shell_id).await?)
    }

    /// Point a shell at a different working directory. The path is stored
    /// as given; a bad path surfaces when the next command fails to spawn.
    pub async fn set_cwd(
        &self,
        shell: Option<&ShellId>,
        path: impl AsRef<Path>,
    ) -> Result<(), SessionError> {
        let shell_id = self.resolve(shell).await?;
        Ok(self.registry.set_cwd(&shell_id, path.as_ref()).await?)
    }

    /// Up to `limit` history entries for a shell, most recent first. Zero
    /// means no limit; [`DEFAULT_HISTORY_LIMIT`] is the conventional default.
    pub async fn history(
        &self,
        shell: Option<&ShellId>,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, SessionError> {
        let shell_id = self.resolve(shell).await?;
        Ok(self.ledger.get(&shell_id, limit).await?)
    }

    /// Recent history rendered as one transcript string.
    pub async fn history_formatted(&self, shell: Option<&ShellId>) -> Result<String, SessionError> {
        let shell_id = self.resolve(shell).await?;
        Ok(self.ledger.get_formatted(&shell_id).await?)
    }

    /// Record an entry without executing anything. This is how results from
    /// commands run elsewhere (or synthesized by the caller) join the record.
    pub async fn add_history_entry(
        &self,
        shell: Option<&ShellId>,
        command: &str,
        success: bool,
        output: &str,
        error: &str,
    ) -> Result<HistoryEntry, SessionError> {
        let shell_id = self.resolve(shell).await?;
        Ok(self
            .ledger
            .append(&shell_id, command, success, output, error)
            .await?)
    }

    /// Delete a shell's history while keeping the shell.
    pub async fn clear_history(&self, shell: Option<&ShellId>) -> Result<(), SessionError> {
        let shell_id = self.resolve(shell).await?;
        Ok(self.ledger.clear(&shell_id).await?)
    }

    /// Remove a shell and everything it recorded.
    pub async fn close_shell(&self, id: &ShellId) -> Result<(), SessionError> {
        self.ledger.clear(id).await?;
        self.registry.close(id).await?;
        Ok(())
    }

    /// Remove every shell and every history entry. The next operation
    /// starts from a blank slate with a fresh current shell.
    pub async fn wipe_all(&self) -> Result<(), SessionError> {
        self.ledger.wipe().await?;
        self.registry.wipe().await?;
        tracing::debug!("wiped all session state");
        Ok(())
    }

    /// Long-format listing of a shell's working directory, header stripped.
    pub async fn list_files(&self, shell: Option<&ShellId>) -> Result<Vec<String>, SessionError> {
        let shell_id = self.resolve(shell).await?;
        let cwd = self.registry.get_cwd(&shell_id).await?;
        Ok(long_listing(&self.executor, &cwd, &self.limits).await?)
    }

    /// Execute `command` in a shell with the session's default limits.
    ///
    /// See [`Whelk::run_command_with_limits`] for the full protocol.
    pub async fn run_command(
        &self,
        command: &str,
        shell: Option<&ShellId>,
    ) -> Result<bool, SessionError> {
        let limits = self.limits.clone();
        self.run_command_with_limits(command, shell, &limits).await
    }

    /// Execute `command` in a shell, returning whether it succeeded.
    ///
    /// The command runs as a subprocess in the shell's tracked working
    /// directory. On completion:
    ///
    /// - A successful command whose output ends with an existing directory
    ///   path moves the shell there, and that line is stripped from the
    ///   recorded output.
    /// - Success or failure, one history entry is appended. Failed runs
    ///   record both streams; successful runs record stdout only.
    /// - A command that cannot even spawn (the tracked directory vanished,
    ///   the interpreter is missing) is recorded as a failure and returns
    ///   `Ok(false)` like any other failed command.
    /// - A timeout is recorded as a failure and then surfaced as an error,
    ///   so callers can tell "ran and failed" from "never finished".
    pub async fn run_command_with_limits(
        &self,
        command: &str,
        shell: Option<&ShellId>,
        limits: &ResourceLimits,
    ) -> Result<bool, SessionError> {
        let shell_id = self.resolve(shell).await?;
        let cwd = self.registry.get_cwd(&shell_id).await?;

        let output = match self.executor.run(command, &cwd, limits).await {
            Ok(output) => output,
            Err(e @ ExecError::Timeout { .. }) => {
                self.ledger
                    .append(&shell_id, command, false, "", &e.to_string())
                    .await?;
                return Err(e.into());
            }
            Err(ExecError::Spawn(e)) => {
                tracing::warn!(shell = %shell_id, command, error = %e, "command failed to spawn");
                self.ledger
                    .append(&shell_id, command, false, "", &e.to_string())
                    .await?;
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        if output.success() {
            let (display, new_cwd) = infer_cwd_change(&output.stdout);
            if let Some(dir) = new_cwd {
                self.registry.set_cwd(&shell_id, &dir).await?;
            }
            self.ledger
                .append(&shell_id, command, true, &display, "")
                .await?;
            Ok(true)
        } else {
            self.ledger
                .append(&shell_id, command, false, &output.stdout, &output.stderr)
                .await?;
            Ok(false)
        }
    }

    async fn resolve(&self, shell: Option<&ShellId>) -> Result<ShellId, SessionError> {
        match shell {
            Some(id) => Ok(id.clone()),
            None => Ok(self.registry.current_shell().await?.id),
        }
    }
}

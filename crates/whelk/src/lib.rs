//! Whelk - session-scoped shell execution for autonomous agents.
//!
//! Whelk tracks a set of *virtual shells*: each one is an identity plus a
//! working directory, persisted as records in a pluggable store. Commands
//! run as independent host subprocesses rooted at the tracked directory, and
//! every run is appended to the shell's history, so an agent keeps durable
//! memory of what it executed, what came back, and where each shell points.
//!
//! There is no long-lived shell process. Continuity comes entirely from the
//! store: a successful command that ends by printing a directory path (for
//! example `cd sub && pwd`) moves its shell there for the next command.
//!
//! # Example
//!
//! ```rust,ignore
//! use whelk::Whelk;
//!
//! let whelk = Whelk::builder().build();
//!
//! // The current shell is created on first use.
//! whelk.run_command("cd /tmp && pwd", None).await?;
//! whelk.run_command("ls -alh", None).await?;
//!
//! println!("{}", whelk.history_formatted(None).await?);
//! ```

mod executor;
mod history;
mod limits;
mod listing;
mod registry;
mod session;
mod store;


pub use executor::{CommandExecutor, CommandOutput, ExecError, infer_cwd_change};
pub use history::{DEFAULT_HISTORY_LIMIT, HistoryEntry, HistoryLedger};
pub use limits::ResourceLimits;
pub use registry::{Shell, ShellId, ShellRegistry};
pub use session::{SessionError, Whelk, WhelkBuilder};
pub use store::{InMemoryStore, MemoryStore, MetadataFilter, Record, StoreError};

//! Append-only command history scoped to shells.
//!
//! Every executed command leaves exactly one [`HistoryEntry`] behind, whether
//! it succeeded or not. Entries render as transcript blocks:
//!
//! ```text
//! Command: cargo test
//! Success: false
//! Error: error[E0308]: mismatched types
//! ---
//! ```
//!
//! The `Output:` and `Error:` lines are omitted when the captured stream was
//! empty, so quiet commands stay quiet in the transcript.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::registry::ShellId;
use crate::store::{MemoryStore, MetadataFilter, Record, StoreError};

/// Store category holding history records.
pub(crate) const HISTORY_CATEGORY: &str = "shell_history";

/// Number of entries fetched when the caller gives no limit.
pub const DEFAULT_HISTORY_LIMIT: usize = 20;

const SHELL_ID_KEY: &str = "shell_id";
const COMMAND_KEY: &str = "command";
const SUCCESS_KEY: &str = "success";
const OUTPUT_KEY: &str = "output";
const ERROR_KEY: &str = "error";
const TIMESTAMP_KEY: &str = "timestamp";

/// Record of one executed command and its outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Shell the command ran in.
    pub shell_id: ShellId,
    /// Exact command string that was executed.
    pub command: String,
    /// Whether the command exited successfully.
    pub success: bool,
    /// Captured standard output, after any directory-line stripping.
    pub output: String,
    /// Captured standard error.
    pub error: String,
    /// Creation time, whole seconds since the Unix epoch.
    pub timestamp: u64,
}

impl HistoryEntry {
    /// Render the entry as a transcript block.
    pub fn format_block(&self) -> String {
        let mut block = format!("Command: {}\nSuccess: {}\n", self.command, self.success);
        let output = self.output.trim();
        if !output.is_empty() {
            block.push_str("Output: ");
            block.push_str(output);
            block.push('\n');
        }
        let error = self.error.trim();
        if !error.is_empty() {
            block.push_str("Error: ");
            block.push_str(error);
            block.push('\n');
        }
        block.push_str("---\n");
        block
    }

    fn to_metadata(&self) -> HashMap<String, String> {
        HashMap::from([
            (SHELL_ID_KEY.to_string(), self.shell_id.to_string()),
            (COMMAND_KEY.to_string(), self.command.clone()),
            (SUCCESS_KEY.to_string(), self.success.to_string()),
            (OUTPUT_KEY.to_string(), self.output.clone()),
            (ERROR_KEY.to_string(), self.error.clone()),
            (TIMESTAMP_KEY.to_string(), self.timestamp.to_string()),
        ])
    }

    fn from_record(record: &Record) -> Self {
        let field = |key: &str| record.metadata.get(key).cloned().unwrap_or_default();
        Self {
            shell_id: ShellId::from(field(SHELL_ID_KEY)),
            command: field(COMMAND_KEY),
            success: record
                .metadata
                .get(SUCCESS_KEY)
                .is_some_and(|value| value == "true"),
            output: field(OUTPUT_KEY),
            error: field(ERROR_KEY),
            timestamp: record
                .metadata
                .get(TIMESTAMP_KEY)
                .and_then(|value| value.parse().ok())
                .unwrap_or(0),
        }
    }
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

/// Manages history records on top of a store.
pub struct HistoryLedger {
    store: Arc<dyn MemoryStore>,
}

impl std::fmt::Debug for HistoryLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryLedger").finish_non_exhaustive()
    }
}

impl HistoryLedger {
    /// Create a ledger over the given store.
    pub fn new(store: Arc<dyn MemoryStore>) -> Self {
        Self { store }
    }

    /// Record one executed command. The record body is the rendered
    /// transcript block, so raw store dumps stay readable.
    pub async fn append(
        &self,
        shell_id: &ShellId,
        command: &str,
        success: bool,
        output: &str,
        error: &str,
    ) -> Result<HistoryEntry, StoreError> {
        let entry = HistoryEntry {
            shell_id: shell_id.clone(),
            command: command.to_string(),
            success,
            output: output.to_string(),
            error: error.to_string(),
            timestamp: unix_timestamp(),
        };
        self.store
            .create(HISTORY_CATEGORY, &entry.format_block(), entry.to_metadata())
            .await?;
        tracing::debug!(shell = %shell_id, command, success, "appended history entry");
        Ok(entry)
    }

    /// Up to `limit` entries for `shell_id`, most recent first. Zero means
    /// no limit. A shell with no history yields an empty vec, not an error.
    pub async fn get(&self, shell_id: &ShellId, limit: usize) -> Result<Vec<HistoryEntry>, StoreError> {
        let filter = MetadataFilter::from([(SHELL_ID_KEY.to_string(), shell_id.to_string())]);
        let records = self.store.query(HISTORY_CATEGORY, &filter, limit).await?;
        Ok(records.iter().map(HistoryEntry::from_record).collect())
    }

    /// The most recent [`DEFAULT_HISTORY_LIMIT`] entries rendered as one
    /// transcript string.
    pub async fn get_formatted(&self, shell_id: &ShellId) -> Result<String, StoreError> {
        let entries = self.get(shell_id, DEFAULT_HISTORY_LIMIT).await?;
        Ok(entries.iter().map(HistoryEntry::format_block).collect())
    }

    /// Delete every entry belonging to `shell_id`.
    pub async fn clear(&self, shell_id: &ShellId) -> Result<(), StoreError> {
        let filter = MetadataFilter::from([(SHELL_ID_KEY.to_string(), shell_id.to_string())]);
        let removed = self.store.delete_many(HISTORY_CATEGORY, &filter).await?;
        tracing::debug!(shell = %shell_id, removed, "cleared history");
        Ok(())
    }

    /// Delete every entry for every shell.
    pub async fn wipe(&self) -> Result<(), StoreError> {
        self.store.wipe(HISTORY_CATEGORY).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn ledger() -> (Arc<InMemoryStore>, HistoryLedger) {
        let store = Arc::new(InMemoryStore::new());
        let ledger = HistoryLedger::new(Arc::clone(&store) as Arc<dyn MemoryStore>);
        (store, ledger)
    }

    fn shell() -> ShellId {
        ShellId::from("shell-1")
    }

    // ==================== Formatting Tests ====================

    #[test]
    fn test_format_block_full() {
        let entry = HistoryEntry {
            shell_id: shell(),
            command: "make check".to_string(),
            success: false,
            output: "checking...\n".to_string(),
            error: "step 3 failed\n".to_string(),
            timestamp: 1,
        };

        assert_eq!(
            entry.format_block(),
            "Command: make check\nSuccess: false\nOutput: checking...\nError: step 3 failed\n---\n"
        );
    }

    #[test]
    fn test_format_block_omits_empty_streams() {
        let entry = HistoryEntry {
            shell_id: shell(),
            command: "true".to_string(),
            success: true,
            output: String::new(),
            error: String::new(),
            timestamp: 1,
        };

        assert_eq!(entry.format_block(), "Command: true\nSuccess: true\n---\n");
    }

    #[test]
    fn test_format_block_treats_whitespace_as_empty() {
        let entry = HistoryEntry {
            shell_id: shell(),
            command: "printf '\\n'".to_string(),
            success: true,
            output: "\n\n  \n".to_string(),
            error: String::new(),
            timestamp: 1,
        };

        assert!(!entry.format_block().contains("Output:"));
    }

    // ==================== Append / Get Tests ====================

    #[tokio::test]
    async fn test_append_then_get() {
        let (_, ledger) = ledger();

        ledger
            .append(&shell(), "echo hi", true, "hi\n", "")
            .await
            .unwrap();

        let entries = ledger.get(&shell(), 0).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].command, "echo hi");
        assert!(entries[0].success);
        assert_eq!(entries[0].output, "hi\n");
        assert_eq!(entries[0].error, "");
        assert!(entries[0].timestamp > 0);
    }

    #[tokio::test]
    async fn test_append_stores_transcript_block_as_body() {
        let (store, ledger) = ledger();

        ledger.append(&shell(), "pwd", true, "/tmp", "").await.unwrap();

        let records = store
            .query(HISTORY_CATEGORY, &MetadataFilter::new(), 0)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].body, "Command: pwd\nSuccess: true\nOutput: /tmp\n---\n");
    }

    #[tokio::test]
    async fn test_get_is_scoped_to_the_shell() {
        let (_, ledger) = ledger();
        let other = ShellId::from("shell-2");

        ledger.append(&shell(), "a", true, "", "").await.unwrap();
        ledger.append(&other, "b", true, "", "").await.unwrap();

        let entries = ledger.get(&shell(), 0).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].command, "a");
    }

    #[tokio::test]
    async fn test_get_returns_newest_first_and_honors_limit() {
        let (_, ledger) = ledger();

        for command in ["first", "second", "third"] {
            ledger.append(&shell(), command, true, "", "").await.unwrap();
        }

        let entries = ledger.get(&shell(), 2).await.unwrap();
        let commands: Vec<_> = entries.iter().map(|e| e.command.as_str()).collect();
        assert_eq!(commands, vec!["third", "second"]);
    }

    #[tokio::test]
    async fn test_get_unknown_shell_is_empty() {
        let (_, ledger) = ledger();
        let entries = ledger.get(&ShellId::from("nobody"), 0).await.unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_get_formatted_joins_blocks() {
        let (_, ledger) = ledger();

        ledger.append(&shell(), "older", true, "", "").await.unwrap();
        ledger.append(&shell(), "newer", false, "", "boom").await.unwrap();

        let formatted = ledger.get_formatted(&shell()).await.unwrap();
        assert!(formatted.contains("Command: older"));
        assert!(formatted.contains("Command: newer"));
        assert!(formatted.contains("Error: boom"));
        // Newest entry leads the transcript.
        assert!(formatted.starts_with("Command: newer"));
    }

    // ==================== Clear / Wipe Tests ====================

    #[tokio::test]
    async fn test_clear_removes_only_that_shell() {
        let (_, ledger) = ledger();
        let other = ShellId::from("shell-2");

        ledger.append(&shell(), "a", true, "", "").await.unwrap();
        ledger.append(&other, "b", true, "", "").await.unwrap();

        ledger.clear(&shell()).await.unwrap();

        assert!(ledger.get(&shell(), 0).await.unwrap().is_empty());
        assert_eq!(ledger.get(&other, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_wipe_removes_everything() {
        let (_, ledger) = ledger();
        let other = ShellId::from("shell-2");

        ledger.append(&shell(), "a", true, "", "").await.unwrap();
        ledger.append(&other, "b", true, "", "").await.unwrap();

        ledger.wipe().await.unwrap();

        assert!(ledger.get(&shell(), 0).await.unwrap().is_empty());
        assert!(ledger.get(&other, 0).await.unwrap().is_empty());
    }
}

//! Shell identity and working-directory tracking.
//!
//! A shell here is not a process: it is a record pairing an identity with a
//! tracked working directory. Commands run as independent subprocesses that
//! are coupled to the shell only through that directory. The registry owns
//! the shell records in the store and enforces that at most one of them is
//! marked current at any time.

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::store::{MemoryStore, MetadataFilter, Record, StoreError};

/// Store category holding shell records.
pub(crate) const SHELL_CATEGORY: &str = "shell";

const CURRENT_KEY: &str = "current";
const CWD_KEY: &str = "cwd";

/// Identifier of a tracked shell.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShellId(String);

impl ShellId {
    /// View the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ShellId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ShellId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for ShellId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// One tracked virtual shell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shell {
    /// Store-assigned identifier.
    pub id: ShellId,
    /// Tracked working directory. Held as plain state, never validated
    /// against the filesystem.
    pub cwd: PathBuf,
    /// Whether operations that do not name a shell target this one.
    pub current: bool,
}

impl Shell {
    fn to_metadata(&self) -> HashMap<String, String> {
        HashMap::from([
            (CURRENT_KEY.to_string(), self.current.to_string()),
            (CWD_KEY.to_string(), self.cwd.to_string_lossy().into_owned()),
        ])
    }

    fn from_record(record: &Record) -> Self {
        Self {
            id: ShellId(record.id.clone()),
            cwd: PathBuf::from(
                record.metadata.get(CWD_KEY).map(String::as_str).unwrap_or_default(),
            ),
            current: record
                .metadata
                .get(CURRENT_KEY)
                .is_some_and(|value| value == "true"),
        }
    }
}

/// Cached current-shell reference, filled from the store on first use.
#[derive(Debug, Default)]
struct CurrentRef {
    hydrated: bool,
    id: Option<ShellId>,
}

/// Manages shell records and the current-shell invariant on top of a store.
///
/// The current-shell reference lives behind a mutex and every currency
/// transition holds the lock across its store reads and writes, so two
/// concurrent switches cannot leave two shells flagged current.
pub struct ShellRegistry {
    store: Arc<dyn MemoryStore>,
    current: Mutex<CurrentRef>,
}

impl std::fmt::Debug for ShellRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellRegistry").finish_non_exhaustive()
    }
}

impl ShellRegistry {
    /// Create a registry over the given store.
    pub fn new(store: Arc<dyn MemoryStore>) -> Self {
        Self {
            store,
            current: Mutex::new(CurrentRef::default()),
        }
    }

    /// Resolve the current shell, creating one if none exists.
    ///
    /// The fallback makes every entry point usable without setup: the first
    /// operation against an empty store conjures a current shell rooted at
    /// the process working directory.
    pub async fn current_shell(&self) -> Result<Shell, StoreError> {
        let mut current = self.current.lock().await;
        self.hydrate(&mut current).await?;

        if let Some(id) = &current.id {
            match self.store.get(SHELL_CATEGORY, id.as_str()).await {
                Ok(record) => return Ok(Shell::from_record(&record)),
                Err(StoreError::NotFound { .. }) => {
                    // The record was deleted out from under us; recreate below.
                    current.id = None;
                }
                Err(e) => return Err(e),
            }
        }

        let shell = self.create(true).await?;
        current.id = Some(shell.id.clone());
        tracing::debug!(shell = %shell.id, cwd = %shell.cwd.display(), "created current shell");
        Ok(shell)
    }

    /// Create a shell that is not current, rooted at the process working
    /// directory.
    pub async fn new_shell(&self) -> Result<Shell, StoreError> {
        let shell = self.create(false).await?;
        tracing::debug!(shell = %shell.id, cwd = %shell.cwd.display(), "created shell");
        Ok(shell)
    }

    /// Make `id` the current shell.
    ///
    /// A no-op when `id` is already current; otherwise the previous current
    /// shell loses its flag in the same locked transition. Fails with
    /// [`StoreError::NotFound`] before touching any flag if `id` is unknown.
    pub async fn set_current(&self, id: &ShellId) -> Result<(), StoreError> {
        let mut current = self.current.lock().await;
        self.hydrate(&mut current).await?;

        if current.id.as_ref() == Some(id) {
            return Ok(());
        }

        let record = self.store.get(SHELL_CATEGORY, id.as_str()).await?;
        let mut target = Shell::from_record(&record);

        if let Some(prev) = current.id.take() {
            match self.store.get(SHELL_CATEGORY, prev.as_str()).await {
                Ok(prev_record) => {
                    let mut prev_shell = Shell::from_record(&prev_record);
                    prev_shell.current = false;
                    self.store
                        .update(SHELL_CATEGORY, prev.as_str(), prev_shell.to_metadata())
                        .await?;
                }
                // Already deleted; nothing to demote.
                Err(StoreError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        target.current = true;
        self.store
            .update(SHELL_CATEGORY, id.as_str(), target.to_metadata())
            .await?;
        current.id = Some(id.clone());
        tracing::debug!(shell = %id, "switched current shell");
        Ok(())
    }

    /// Fetch one shell by id.
    pub async fn get(&self, id: &ShellId) -> Result<Shell, StoreError> {
        let record = self.store.get(SHELL_CATEGORY, id.as_str()).await?;
        Ok(Shell::from_record(&record))
    }

    /// Tracked working directory of `id`.
    pub async fn get_cwd(&self, id: &ShellId) -> Result<PathBuf, StoreError> {
        Ok(self.get(id).await?.cwd)
    }

    /// Overwrite the tracked working directory of `id`. The path is stored
    /// as given, without validation.
    pub async fn set_cwd(&self, id: &ShellId, path: &Path) -> Result<(), StoreError> {
        let mut shell = self.get(id).await?;
        shell.cwd = path.to_path_buf();
        self.store
            .update(SHELL_CATEGORY, id.as_str(), shell.to_metadata())
            .await?;
        tracing::debug!(shell = %id, cwd = %path.display(), "updated cwd");
        Ok(())
    }

    /// Every shell in the store, in the store's query order.
    pub async fn list(&self) -> Result<Vec<Shell>, StoreError> {
        let records = self
            .store
            .query(SHELL_CATEGORY, &MetadataFilter::new(), 0)
            .await?;
        Ok(records.iter().map(Shell::from_record).collect())
    }

    /// Delete the shell record. History entries are owned by the ledger and
    /// are not touched here.
    pub async fn close(&self, id: &ShellId) -> Result<(), StoreError> {
        let mut current = self.current.lock().await;
        self.hydrate(&mut current).await?;

        self.store.delete(SHELL_CATEGORY, id.as_str()).await?;
        if current.id.as_ref() == Some(id) {
            current.id = None;
        }
        tracing::debug!(shell = %id, "closed shell");
        Ok(())
    }

    /// Delete every shell record and forget the current reference.
    pub async fn wipe(&self) -> Result<(), StoreError> {
        let mut current = self.current.lock().await;
        self.store.wipe(SHELL_CATEGORY).await?;
        current.id = None;
        current.hydrated = true;
        Ok(())
    }

    /// Fill the current reference from the store on first use.
    ///
    /// A store written by an earlier process (or by a buggy writer) may hold
    /// several shells flagged current. The newest claim wins and the extras
    /// are demoted, so the invariant is restored before it can leak out of
    /// any read.
    async fn hydrate(&self, current: &mut CurrentRef) -> Result<(), StoreError> {
        if current.hydrated {
            return Ok(());
        }

        let filter = MetadataFilter::from([(CURRENT_KEY.to_string(), "true".to_string())]);
        let mut marked = self.store.query(SHELL_CATEGORY, &filter, 0).await?.into_iter();

        if let Some(keep) = marked.next() {
            current.id = Some(ShellId(keep.id.clone()));
            for extra in marked {
                tracing::warn!(shell = %extra.id, "demoting duplicate current-shell flag");
                let mut shell = Shell::from_record(&extra);
                shell.current = false;
                self.store
                    .update(SHELL_CATEGORY, &extra.id, shell.to_metadata())
                    .await?;
            }
        }

        current.hydrated = true;
        Ok(())
    }

    async fn create(&self, current: bool) -> Result<Shell, StoreError> {
        // The process cwd can itself be unlinked; fall back to the root.
        let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        let mut shell = Shell {
            id: ShellId(String::new()),
            cwd,
            current,
        };
        let id = self
            .store
            .create(SHELL_CATEGORY, "shell", shell.to_metadata())
            .await?;
        shell.id = ShellId(id);
        Ok(shell)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn registry() -> ShellRegistry {
        ShellRegistry::new(Arc::new(InMemoryStore::new()))
    }

    async fn current_ids(registry: &ShellRegistry) -> Vec<ShellId> {
        registry
            .list()
            .await
            .unwrap()
            .into_iter()
            .filter(|s| s.current)
            .map(|s| s.id)
            .collect()
    }

    // ==================== Current Shell Tests ====================

    #[tokio::test]
    async fn test_current_shell_created_on_demand() {
        let registry = registry();

        let shell = registry.current_shell().await.unwrap();
        assert!(shell.current);

        let shells = registry.list().await.unwrap();
        assert_eq!(shells.len(), 1);
        assert_eq!(shells[0].id, shell.id);
    }

    #[tokio::test]
    async fn test_current_shell_is_stable() {
        let registry = registry();

        let first = registry.current_shell().await.unwrap();
        let second = registry.current_shell().await.unwrap();
        assert_eq!(first.id, second.id);

        let shells = registry.list().await.unwrap();
        assert_eq!(shells.len(), 1);
    }

    #[tokio::test]
    async fn test_current_shell_recreated_after_external_delete() {
        let store = Arc::new(InMemoryStore::new());
        let registry = ShellRegistry::new(store.clone());

        let shell = registry.current_shell().await.unwrap();
        store.delete(SHELL_CATEGORY, shell.id.as_str()).await.unwrap();

        let replacement = registry.current_shell().await.unwrap();
        assert_ne!(replacement.id, shell.id);
        assert!(replacement.current);
    }

    // ==================== Switching Tests ====================

    #[tokio::test]
    async fn test_set_current_moves_the_flag() {
        let registry = registry();

        let first = registry.current_shell().await.unwrap();
        let second = registry.new_shell().await.unwrap();
        assert!(!second.current);

        registry.set_current(&second.id).await.unwrap();

        assert_eq!(current_ids(&registry).await, vec![second.id.clone()]);
        assert_eq!(registry.current_shell().await.unwrap().id, second.id);
        assert!(!registry.get(&first.id).await.unwrap().current);
    }

    #[tokio::test]
    async fn test_set_current_is_idempotent() {
        let registry = registry();

        let shell = registry.current_shell().await.unwrap();
        registry.set_current(&shell.id).await.unwrap();
        registry.set_current(&shell.id).await.unwrap();

        assert_eq!(current_ids(&registry).await, vec![shell.id]);
    }

    #[tokio::test]
    async fn test_set_current_unknown_id_leaves_state_alone() {
        let registry = registry();

        let shell = registry.current_shell().await.unwrap();
        let result = registry.set_current(&ShellId::from("missing")).await;
        assert!(matches!(result, Err(StoreError::NotFound { .. })));

        assert_eq!(current_ids(&registry).await, vec![shell.id]);
    }

    #[tokio::test]
    async fn test_at_most_one_current_after_many_switches() {
        let registry = registry();

        registry.current_shell().await.unwrap();
        let a = registry.new_shell().await.unwrap();
        let b = registry.new_shell().await.unwrap();

        registry.set_current(&a.id).await.unwrap();
        registry.set_current(&b.id).await.unwrap();
        registry.set_current(&a.id).await.unwrap();

        assert_eq!(current_ids(&registry).await, vec![a.id]);
    }

    // ==================== Hydration Tests ====================

    #[tokio::test]
    async fn test_hydrate_adopts_existing_current() {
        let store = Arc::new(InMemoryStore::new());
        let first = ShellRegistry::new(store.clone());
        let shell = first.current_shell().await.unwrap();

        // A fresh registry over the same store picks up the same shell.
        let second = ShellRegistry::new(store);
        assert_eq!(second.current_shell().await.unwrap().id, shell.id);
    }

    #[tokio::test]
    async fn test_hydrate_demotes_duplicate_current_flags() {
        let store = Arc::new(InMemoryStore::new());
        let meta = HashMap::from([
            (CURRENT_KEY.to_string(), "true".to_string()),
            (CWD_KEY.to_string(), "/tmp".to_string()),
        ]);
        store.create(SHELL_CATEGORY, "shell", meta.clone()).await.unwrap();
        store.create(SHELL_CATEGORY, "shell", meta).await.unwrap();

        let registry = ShellRegistry::new(store);
        registry.current_shell().await.unwrap();

        assert_eq!(current_ids(&registry).await.len(), 1);
    }

    // ==================== Cwd Tests ====================

    #[tokio::test]
    async fn test_cwd_round_trip() {
        let registry = registry();

        let shell = registry.current_shell().await.unwrap();
        registry.set_cwd(&shell.id, Path::new("/tmp")).await.unwrap();

        assert_eq!(registry.get_cwd(&shell.id).await.unwrap(), PathBuf::from("/tmp"));
    }

    #[tokio::test]
    async fn test_set_cwd_accepts_nonexistent_path() {
        let registry = registry();

        let shell = registry.current_shell().await.unwrap();
        let ghost = Path::new("/no/such/directory/anywhere");
        registry.set_cwd(&shell.id, ghost).await.unwrap();

        assert_eq!(registry.get_cwd(&shell.id).await.unwrap(), ghost);
    }

    #[tokio::test]
    async fn test_set_cwd_preserves_current_flag() {
        let registry = registry();

        let shell = registry.current_shell().await.unwrap();
        registry.set_cwd(&shell.id, Path::new("/tmp")).await.unwrap();

        assert!(registry.get(&shell.id).await.unwrap().current);
    }

    // ==================== Close / Wipe Tests ====================

    #[tokio::test]
    async fn test_close_removes_the_shell() {
        let registry = registry();

        registry.current_shell().await.unwrap();
        let extra = registry.new_shell().await.unwrap();
        registry.close(&extra.id).await.unwrap();

        let result = registry.get(&extra.id).await;
        assert!(matches!(result, Err(StoreError::NotFound { .. })));
        assert_eq!(registry.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_close_current_then_resolve_creates_fresh() {
        let registry = registry();

        let shell = registry.current_shell().await.unwrap();
        registry.close(&shell.id).await.unwrap();

        let fresh = registry.current_shell().await.unwrap();
        assert_ne!(fresh.id, shell.id);
        assert_eq!(registry.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_wipe_clears_all_shells() {
        let registry = registry();

        registry.current_shell().await.unwrap();
        registry.new_shell().await.unwrap();
        registry.wipe().await.unwrap();

        assert!(registry.list().await.unwrap().is_empty());
    }

    // ==================== Marshaling Tests ====================

    #[tokio::test]
    async fn test_new_shell_roots_at_process_cwd() {
        let registry = registry();

        let shell = registry.new_shell().await.unwrap();
        let expected = env::current_dir().unwrap();
        assert_eq!(shell.cwd, expected);
        assert_eq!(registry.get_cwd(&shell.id).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_record_round_trip() {
        let shell = Shell {
            id: ShellId::from("shell-9"),
            cwd: PathBuf::from("/var/log"),
            current: true,
        };
        let record = Record {
            id: "shell-9".to_string(),
            body: "shell".to_string(),
            metadata: shell.to_metadata(),
        };

        let parsed = Shell::from_record(&record);
        assert_eq!(parsed.id, shell.id);
        assert_eq!(parsed.cwd, shell.cwd);
        assert!(parsed.current);
    }
}

//! Record store backing shell and history state.
//!
//! Shells and history entries are persisted as flat records (a body plus
//! string-keyed metadata) grouped under named categories, so any key/value
//! backend that can filter on metadata can hold them. [`MemoryStore`] is the
//! seam embedders implement for durable storage; [`InMemoryStore`] is the
//! process-local implementation used by default and in tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

/// Errors returned by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No record with the given id exists in the category.
    #[error("record not found: {category}/{id}")]
    NotFound {
        /// Category that was searched.
        category: String,
        /// Record id that was requested.
        id: String,
    },
    /// The backend failed in an implementation-specific way.
    #[error("store backend error: {0}")]
    Backend(String),
}

/// A single stored record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    /// Store-assigned identifier, unique across the store.
    pub id: String,
    /// Free-text body.
    pub body: String,
    /// String-keyed metadata, filterable via [`MemoryStore::query`].
    pub metadata: HashMap<String, String>,
}

/// Equality filter over record metadata.
///
/// A record matches when every key in the filter is present in its metadata
/// with an equal value. The empty filter matches every record.
pub type MetadataFilter = HashMap<String, String>;

/// Categorised record store with metadata queries.
///
/// Categories are created implicitly on first write and there is no schema:
/// callers agree on metadata keys by convention. Implementations must be
/// safe to share across tasks.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Create a record in `category`, returning its store-assigned id.
    async fn create(
        &self,
        category: &str,
        body: &str,
        metadata: HashMap<String, String>,
    ) -> Result<String, StoreError>;

    /// Fetch one record by id.
    async fn get(&self, category: &str, id: &str) -> Result<Record, StoreError>;

    /// Records in `category` matching `filter`, most recently created first.
    ///
    /// At most `limit` records are returned; `limit` of zero means no limit.
    async fn query(
        &self,
        category: &str,
        filter: &MetadataFilter,
        limit: usize,
    ) -> Result<Vec<Record>, StoreError>;

    /// Replace the metadata of an existing record.
    async fn update(
        &self,
        category: &str,
        id: &str,
        metadata: HashMap<String, String>,
    ) -> Result<(), StoreError>;

    /// Delete one record by id. Deleting an unknown id is an error.
    async fn delete(&self, category: &str, id: &str) -> Result<(), StoreError>;

    /// Delete every record in `category` matching `filter`, returning the
    /// number removed. Matching nothing is not an error.
    async fn delete_many(
        &self,
        category: &str,
        filter: &MetadataFilter,
    ) -> Result<usize, StoreError>;

    /// Delete every record in `category`.
    async fn wipe(&self, category: &str) -> Result<(), StoreError>;
}

fn matches(record: &Record, filter: &MetadataFilter) -> bool {
    filter
        .iter()
        .all(|(key, value)| record.metadata.get(key) == Some(value))
}

/// In-memory [`MemoryStore`] holding records per category.
///
/// Records are kept in creation order and queries walk them newest first.
/// State lives only as long as the value; see the crate docs for plugging in
/// a durable backend instead.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    categories: RwLock<HashMap<String, Vec<Record>>>,
    next_id: AtomicU64,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn assign_id(&self, category: &str) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{category}-{n}")
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn create(
        &self,
        category: &str,
        body: &str,
        metadata: HashMap<String, String>,
    ) -> Result<String, StoreError> {
        let id = self.assign_id(category);
        let record = Record {
            id: id.clone(),
            body: body.to_string(),
            metadata,
        };
        let mut categories = self.categories.write().await;
        categories.entry(category.to_string()).or_default().push(record);
        Ok(id)
    }

    async fn get(&self, category: &str, id: &str) -> Result<Record, StoreError> {
        let categories = self.categories.read().await;
        categories
            .get(category)
            .and_then(|records| records.iter().find(|r| r.id == id))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                category: category.to_string(),
                id: id.to_string(),
            })
    }

    async fn query(
        &self,
        category: &str,
        filter: &MetadataFilter,
        limit: usize,
    ) -> Result<Vec<Record>, StoreError> {
        let categories = self.categories.read().await;
        let Some(records) = categories.get(category) else {
            return Ok(Vec::new());
        };
        let hits = records.iter().rev().filter(|r| matches(r, filter));
        Ok(if limit == 0 {
            hits.cloned().collect()
        } else {
            hits.take(limit).cloned().collect()
        })
    }

    async fn update(
        &self,
        category: &str,
        id: &str,
        metadata: HashMap<String, String>,
    ) -> Result<(), StoreError> {
        let mut categories = self.categories.write().await;
        let record = categories
            .get_mut(category)
            .and_then(|records| records.iter_mut().find(|r| r.id == id))
            .ok_or_else(|| StoreError::NotFound {
                category: category.to_string(),
                id: id.to_string(),
            })?;
        record.metadata = metadata;
        Ok(())
    }

    async fn delete(&self, category: &str, id: &str) -> Result<(), StoreError> {
        let mut categories = self.categories.write().await;
        let records = categories.get_mut(category).ok_or_else(|| StoreError::NotFound {
            category: category.to_string(),
            id: id.to_string(),
        })?;
        let before = records.len();
        records.retain(|r| r.id != id);
        if records.len() == before {
            return Err(StoreError::NotFound {
                category: category.to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn delete_many(
        &self,
        category: &str,
        filter: &MetadataFilter,
    ) -> Result<usize, StoreError> {
        let mut categories = self.categories.write().await;
        let Some(records) = categories.get_mut(category) else {
            return Ok(0);
        };
        let before = records.len();
        records.retain(|r| !matches(r, filter));
        Ok(before - records.len())
    }

    async fn wipe(&self, category: &str) -> Result<(), StoreError> {
        let mut categories = self.categories.write().await;
        categories.remove(category);
        Ok(())
    }
}

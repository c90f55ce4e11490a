//! Rule history store
//!
//! Maps canonical rule keys to the record written when the rule was added.
//! The engine only ever writes to it; entries survive deletes so the history
//! replay covers every rule ever installed.

use crate::core::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// What the store remembers about a rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub key: String,
    pub created_at: DateTime<Utc>,
}

impl HistoryRecord {
    pub fn now(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            created_at: Utc::now(),
        }
    }
}

/// Swappable persistence for rule history
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Inserts or overwrites the record for `key`.
    async fn put(&self, key: &str, record: HistoryRecord) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<HistoryRecord>>;

    /// Removes `key`, returning whether it was present.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Snapshot of every entry, ordered by key.
    async fn all(&self) -> Result<BTreeMap<String, HistoryRecord>>;
}

/// Volatile in-process history store
#[derive(Debug, Default)]
pub struct MemoryHistory {
    data: RwLock<HashMap<String, HistoryRecord>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistory {
    async fn put(&self, key: &str, record: HistoryRecord) -> Result<()> {
        self.data.write().insert(key.to_string(), record);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<HistoryRecord>> {
        Ok(self.data.read().get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.data.write().remove(key).is_some())
    }

    async fn all(&self) -> Result<BTreeMap<String, HistoryRecord>> {
        // Exclusive on purpose: the copy must not interleave with a writer.
        let data = self.data.write();
        Ok(data
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

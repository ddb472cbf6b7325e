//! Storage interface
//!
//! The core treats persistence as an opaque JSON key-value store with
//! list-by-parent queries; pipelines, runs, version history, and observer
//! tokens are collections over that interface. A real deployment plugs in a
//! database-backed implementation; the in-memory store ships for embedding
//! and tests.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde_json::Value;

use crate::error::{Error, Result};

/// Collection of stored pipelines.
pub const PIPELINES: &str = "pipelines";

/// Collection of terminated runs.
pub const RUNS: &str = "runs";

/// Collection of pipeline version history.
pub const PIPELINE_VERSIONS: &str = "pipeline_versions";

/// Collection of custom-node version history (code blob per version).
pub const NODE_VERSIONS: &str = "node_versions";

/// Collection of observer-token records.
pub const OBSERVER_TOKENS: &str = "observer_tokens";

/// Opaque JSON KV store with list-by-parent.
pub trait StorageBackend: Send + Sync {
    /// Insert or replace a record.
    fn put(&self, collection: &str, id: &str, value: &Value) -> Result<()>;

    /// Fetch a record.
    fn get(&self, collection: &str, id: &str) -> Result<Option<Value>>;

    /// Delete a record; deleting a missing record is not an error.
    fn delete(&self, collection: &str, id: &str) -> Result<()>;

    /// All records in a collection whose `parent_id` field equals `parent`.
    fn list_by_parent(&self, collection: &str, parent: &str) -> Result<Vec<Value>>;
}

/// In-memory storage backend.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    collections: Mutex<BTreeMap<String, BTreeMap<String, Value>>>,
}

impl MemoryStorage {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryStorage {
    fn put(&self, collection: &str, id: &str, value: &Value) -> Result<()> {
        let mut collections = self
            .collections
            .lock()
            .map_err(|_| Error::Storage("storage lock poisoned".to_string()))?;
        collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), value.clone());
        Ok(())
    }

    fn get(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        let collections = self
            .collections
            .lock()
            .map_err(|_| Error::Storage("storage lock poisoned".to_string()))?;
        Ok(collections
            .get(collection)
            .and_then(|records| records.get(id))
            .cloned())
    }

    fn delete(&self, collection: &str, id: &str) -> Result<()> {
        let mut collections = self
            .collections
            .lock()
            .map_err(|_| Error::Storage("storage lock poisoned".to_string()))?;
        if let Some(records) = collections.get_mut(collection) {
            records.remove(id);
        }
        Ok(())
    }

    fn list_by_parent(&self, collection: &str, parent: &str) -> Result<Vec<Value>> {
        let collections = self
            .collections
            .lock()
            .map_err(|_| Error::Storage("storage lock poisoned".to_string()))?;
        Ok(collections
            .get(collection)
            .map(|records| {
                records
                    .values()
                    .filter(|value| {
                        value.get("parent_id").and_then(Value::as_str) == Some(parent)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_put_get_delete() {
        let storage = MemoryStorage::new();
        storage
            .put(PIPELINES, "p1", &json!({"name": "crossover"}))
            .unwrap();
        assert_eq!(
            storage.get(PIPELINES, "p1").unwrap().unwrap()["name"],
            "crossover"
        );
        storage.delete(PIPELINES, "p1").unwrap();
        assert!(storage.get(PIPELINES, "p1").unwrap().is_none());
        // Deleting again is a no-op
        storage.delete(PIPELINES, "p1").unwrap();
    }

    #[test]
    fn test_put_replaces() {
        let storage = MemoryStorage::new();
        storage.put(RUNS, "r1", &json!({"status": "running"})).unwrap();
        storage.put(RUNS, "r1", &json!({"status": "completed"})).unwrap();
        assert_eq!(
            storage.get(RUNS, "r1").unwrap().unwrap()["status"],
            "completed"
        );
    }

    #[test]
    fn test_collections_are_isolated() {
        let storage = MemoryStorage::new();
        storage.put(RUNS, "x", &json!(1)).unwrap();
        assert!(storage.get(PIPELINES, "x").unwrap().is_none());
    }

    #[test]
    fn test_list_by_parent() {
        let storage = MemoryStorage::new();
        storage
            .put(
                PIPELINE_VERSIONS,
                "v1",
                &json!({"parent_id": "p1", "version": 1}),
            )
            .unwrap();
        storage
            .put(
                PIPELINE_VERSIONS,
                "v2",
                &json!({"parent_id": "p1", "version": 2}),
            )
            .unwrap();
        storage
            .put(
                PIPELINE_VERSIONS,
                "other",
                &json!({"parent_id": "p2", "version": 1}),
            )
            .unwrap();

        let versions = storage.list_by_parent(PIPELINE_VERSIONS, "p1").unwrap();
        assert_eq!(versions.len(), 2);
        assert!(versions.iter().all(|v| v["parent_id"] == "p1"));

        assert!(storage
            .list_by_parent(OBSERVER_TOKENS, "p1")
            .unwrap()
            .is_empty());
    }
}

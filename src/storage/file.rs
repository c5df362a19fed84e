//! File-based record store
//!
//! One JSON file per aggregate scope, holding an object map `id -> record`.
//! Writes go to a temp file in the same directory followed by an atomic
//! rename; a missing file reads as empty. An in-process lock serializes
//! writers.

use crate::error::{BrokerError, Result};
use crate::storage::{RecordStore, StorageRegistry, AGGREGATE_SCOPES};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

pub struct FileRecordStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileRecordStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir, write_lock: Mutex::new(()) })
    }

    fn scope_path(&self, scope: &str) -> PathBuf {
        self.dir.join(format!("{scope}.json"))
    }

    fn read_scope(path: &Path) -> Result<BTreeMap<String, Value>> {
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = std::fs::read_to_string(path)?;
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&content).map_err(|e| BrokerError::Storage {
            message: format!("corrupt record file {}", path.display()),
            transient: false,
            source: Some(Box::new(e)),
        })
    }

    fn write_scope(&self, path: &Path, records: &BTreeMap<String, Value>) -> Result<()> {
        let content = serde_json::to_string_pretty(records)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for FileRecordStore {
    async fn put(&self, scope: &str, id: &str, record: Value) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.scope_path(scope);
        let mut records = Self::read_scope(&path)?;
        records.insert(id.to_string(), record);
        self.write_scope(&path, &records)
    }

    async fn get(&self, scope: &str, id: &str) -> Result<Option<Value>> {
        let records = Self::read_scope(&self.scope_path(scope))?;
        Ok(records.get(id).cloned())
    }

    async fn all(&self, scope: &str) -> Result<Vec<Value>> {
        let records = Self::read_scope(&self.scope_path(scope))?;
        Ok(records.into_values().collect())
    }

    async fn delete(&self, scope: &str, id: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let path = self.scope_path(scope);
        let mut records = Self::read_scope(&path)?;
        let removed = records.remove(id).is_some();
        if removed {
            self.write_scope(&path, &records)?;
        }
        Ok(removed)
    }
}

pub async fn register_file_storage(registry: &StorageRegistry) -> Result<()> {
    registry
        .register(
            "file",
            AGGREGATE_SCOPES.to_vec(),
            Box::new(|config| {
                Box::pin(async move {
                    Ok(std::sync::Arc::new(FileRecordStore::new(config.file_dir)?) as _)
                })
            }),
        )
        .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn put_get_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = FileRecordStore::new(dir.path()).unwrap();

        store.put("requests", "r1", json!({"request_id": "r1", "status": "pending"})).await.unwrap();
        let loaded = store.get("requests", "r1").await.unwrap().unwrap();
        assert_eq!(loaded["status"], "pending");

        // Upsert replaces
        store.put("requests", "r1", json!({"request_id": "r1", "status": "processing"})).await.unwrap();
        let loaded = store.get("requests", "r1").await.unwrap().unwrap();
        assert_eq!(loaded["status"], "processing");
        assert_eq!(store.all("requests").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_scope_reads_empty() {
        let dir = TempDir::new().unwrap();
        let store = FileRecordStore::new(dir.path()).unwrap();
        assert!(store.get("machines", "m1").await.unwrap().is_none());
        assert!(store.all("machines").await.unwrap().is_empty());
        assert!(!store.delete("machines", "m1").await.unwrap());
    }

    #[tokio::test]
    async fn delete_removes_record() {
        let dir = TempDir::new().unwrap();
        let store = FileRecordStore::new(dir.path()).unwrap();
        store.put("templates", "t1", json!({"template_id": "t1"})).await.unwrap();
        assert!(store.delete("templates", "t1").await.unwrap());
        assert!(store.get("templates", "t1").await.unwrap().is_none());
    }
}

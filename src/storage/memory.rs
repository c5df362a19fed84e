//! In-memory record store, for tests and ephemeral runs

use crate::error::Result;
use crate::storage::{RecordStore, StorageRegistry, AGGREGATE_SCOPES};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::Mutex;

#[derive(Default)]
pub struct MemoryRecordStore {
    scopes: Mutex<HashMap<String, HashMap<String, Value>>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn put(&self, scope: &str, id: &str, record: Value) -> Result<()> {
        self.scopes
            .lock()
            .await
            .entry(scope.to_string())
            .or_default()
            .insert(id.to_string(), record);
        Ok(())
    }

    async fn get(&self, scope: &str, id: &str) -> Result<Option<Value>> {
        Ok(self.scopes.lock().await.get(scope).and_then(|m| m.get(id).cloned()))
    }

    async fn all(&self, scope: &str) -> Result<Vec<Value>> {
        Ok(self
            .scopes
            .lock()
            .await
            .get(scope)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete(&self, scope: &str, id: &str) -> Result<bool> {
        Ok(self
            .scopes
            .lock()
            .await
            .get_mut(scope)
            .map(|m| m.remove(id).is_some())
            .unwrap_or(false))
    }
}

pub async fn register_memory_storage(registry: &StorageRegistry) -> Result<()> {
    registry
        .register(
            "memory",
            AGGREGATE_SCOPES.to_vec(),
            Box::new(|_config| {
                Box::pin(async { Ok(std::sync::Arc::new(MemoryRecordStore::new()) as _) })
            }),
        )
        .await;
    Ok(())
}

//! Durable state: record stores, repositories and the unit of work
//!
//! Storage strategies are pluggable and registered under a name. Central
//! registration tolerates partial failure: startup continues as long as at
//! least one strategy registered.

pub mod dynamo;
pub mod file;
pub mod memory;
pub mod sql;
pub mod unit_of_work;

pub use dynamo::{register_dynamodb_storage, DynamoRecordStore};
pub use file::{register_file_storage, FileRecordStore};
pub use memory::{register_memory_storage, MemoryRecordStore};
pub use sql::{register_sql_storage, SqlRecordStore};
pub use unit_of_work::{Repository, UnitOfWork, UnitOfWorkFactory};

use crate::config::StorageConfig;
use crate::error::{BrokerError, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Scopes every backend must serve.
pub const AGGREGATE_SCOPES: &[&str] = &["requests", "machines", "templates"];

/// Minimal keyed-JSON persistence port shared by all backends.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn put(&self, scope: &str, id: &str, record: Value) -> Result<()>;
    async fn get(&self, scope: &str, id: &str) -> Result<Option<Value>>;
    async fn all(&self, scope: &str) -> Result<Vec<Value>>;
    async fn delete(&self, scope: &str, id: &str) -> Result<bool>;
}

type StoreFactory =
    Box<dyn Fn(StorageConfig) -> BoxFuture<'static, Result<Arc<dyn RecordStore>>> + Send + Sync>;

struct Registration {
    factory: StoreFactory,
    repositories: Vec<&'static str>,
}

/// Named registry of storage strategies.
pub struct StorageRegistry {
    strategies: Mutex<HashMap<String, Registration>>,
}

impl StorageRegistry {
    pub fn new() -> Self {
        Self { strategies: Mutex::new(HashMap::new()) }
    }

    pub async fn register(
        &self,
        name: &str,
        repositories: Vec<&'static str>,
        factory: StoreFactory,
    ) {
        let mut strategies = self.strategies.lock().await;
        if strategies.insert(name.to_string(), Registration { factory, repositories }).is_some() {
            warn!("Replacing storage strategy '{}'", name);
        } else {
            info!("Registered storage strategy '{}'", name);
        }
    }

    pub async fn registered_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.strategies.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn repositories_of(&self, name: &str) -> Option<Vec<&'static str>> {
        self.strategies.lock().await.get(name).map(|r| r.repositories.clone())
    }

    /// Build the store configured as `config.backend`.
    pub async fn open(&self, config: &StorageConfig) -> Result<Arc<dyn RecordStore>> {
        let factory_future = {
            let strategies = self.strategies.lock().await;
            let registration =
                strategies.get(&config.backend).ok_or_else(|| BrokerError::Configuration {
                    message: format!("unknown storage backend '{}'", config.backend),
                    source: None,
                })?;
            (registration.factory)(config.clone())
        };
        factory_future.await
    }
}

impl Default for StorageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Register every built-in strategy; startup fails only when none registered.
pub async fn register_default_storage(registry: &StorageRegistry) -> Result<usize> {
    let mut registered = 0;
    for (name, result) in [
        ("file", register_file_storage(registry).await),
        ("sql", register_sql_storage(registry).await),
        ("dynamodb", register_dynamodb_storage(registry).await),
        ("memory", register_memory_storage(registry).await),
    ] {
        match result {
            Ok(()) => registered += 1,
            Err(e) => warn!("Storage strategy '{}' failed to register: {}", name, e),
        }
    }
    if registered == 0 {
        return Err(BrokerError::Configuration {
            message: "no storage strategy could be registered".to_string(),
            source: None,
        });
    }
    Ok(registered)
}

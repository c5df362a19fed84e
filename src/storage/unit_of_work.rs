//! Repositories and the unit of work
//!
//! The unit of work stages aggregate writes and buffers their domain
//! events; `commit` performs the durable writes first and only then hands
//! the drained events to the event bus, in emission order. `rollback`
//! discards both. Transitions on the same request id are serialized through
//! the factory's per-aggregate lock registry.

use crate::app::events::EventBus;
use crate::domain::events::DomainEvent;
use crate::domain::{Machine, Request, Template};
use crate::error::{BrokerError, Result};
use crate::storage::RecordStore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// An aggregate that persists as one JSON record in a named scope.
pub trait PersistedAggregate: Serialize + DeserializeOwned + Send + Sync {
    const SCOPE: &'static str;
    fn persistence_id(&self) -> &str;
}

impl PersistedAggregate for Request {
    const SCOPE: &'static str = "requests";
    fn persistence_id(&self) -> &str {
        &self.request_id
    }
}

impl PersistedAggregate for Machine {
    const SCOPE: &'static str = "machines";
    fn persistence_id(&self) -> &str {
        &self.machine_id
    }
}

impl PersistedAggregate for Template {
    const SCOPE: &'static str = "templates";
    fn persistence_id(&self) -> &str {
        &self.template_id
    }
}

/// Read/write access to one aggregate scope. `save` is an upsert.
pub struct Repository<T: PersistedAggregate> {
    store: Arc<dyn RecordStore>,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: PersistedAggregate> Repository<T> {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store, _marker: std::marker::PhantomData }
    }

    pub async fn save(&self, entity: &T) -> Result<()> {
        let record = serde_json::to_value(entity)?;
        self.store.put(T::SCOPE, entity.persistence_id(), record).await
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Option<T>> {
        match self.store.get(T::SCOPE, id).await? {
            Some(record) => Ok(Some(serde_json::from_value(record)?)),
            None => Ok(None),
        }
    }

    pub async fn find_all(&self) -> Result<Vec<T>> {
        self.store
            .all(T::SCOPE)
            .await?
            .into_iter()
            .map(|record| serde_json::from_value(record).map_err(BrokerError::from))
            .collect()
    }

    pub async fn find_by<F>(&self, predicate: F) -> Result<Vec<T>>
    where
        F: Fn(&T) -> bool,
    {
        Ok(self.find_all().await?.into_iter().filter(|e| predicate(e)).collect())
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        self.store.delete(T::SCOPE, id).await
    }
}

struct StagedWrite {
    scope: &'static str,
    id: String,
    record: serde_json::Value,
}

/// Scoped transactional context. Obtain via `UnitOfWorkFactory::begin`.
pub struct UnitOfWork {
    store: Arc<dyn RecordStore>,
    events: Arc<EventBus>,
    staged: Mutex<Vec<StagedWrite>>,
    staged_events: Mutex<Vec<DomainEvent>>,
    _aggregate_guard: Option<OwnedMutexGuard<()>>,
}

impl UnitOfWork {
    /// Stage a request write and drain its pending events into the buffer.
    pub async fn stage_request(&self, request: &mut Request) -> Result<()> {
        let record = serde_json::to_value(&*request)?;
        self.staged.lock().await.push(StagedWrite {
            scope: Request::SCOPE,
            id: request.request_id.clone(),
            record,
        });
        self.staged_events.lock().await.extend(request.take_events());
        Ok(())
    }

    pub async fn stage_machine(&self, machine: &Machine) -> Result<()> {
        let record = serde_json::to_value(machine)?;
        self.staged.lock().await.push(StagedWrite {
            scope: Machine::SCOPE,
            id: machine.machine_id.clone(),
            record,
        });
        Ok(())
    }

    pub async fn stage_template(&self, template: &Template) -> Result<()> {
        let record = serde_json::to_value(template)?;
        self.staged.lock().await.push(StagedWrite {
            scope: Template::SCOPE,
            id: template.template_id.clone(),
            record,
        });
        Ok(())
    }

    /// Flush staged writes, then publish buffered events in emission order.
    /// Events of a failed flush are never published.
    pub async fn commit(self) -> Result<()> {
        let staged = {
            let mut staged = self.staged.lock().await;
            std::mem::take(&mut *staged)
        };
        for write in staged {
            self.store.put(write.scope, &write.id, write.record).await?;
        }

        let events = {
            let mut events = self.staged_events.lock().await;
            std::mem::take(&mut *events)
        };
        debug!("Unit of work committed, publishing {} events", events.len());
        self.events.publish_all(&events).await;
        Ok(())
    }

    /// Discard staged writes and buffered events.
    pub async fn rollback(self) {
        let discarded_writes = self.staged.lock().await.len();
        let discarded_events = self.staged_events.lock().await.len();
        debug!(
            "Unit of work rolled back ({} writes, {} events discarded)",
            discarded_writes, discarded_events
        );
    }
}

/// Builds units of work and serializes them per aggregate id.
pub struct UnitOfWorkFactory {
    store: Arc<dyn RecordStore>,
    events: Arc<EventBus>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl UnitOfWorkFactory {
    pub fn new(store: Arc<dyn RecordStore>, events: Arc<EventBus>) -> Self {
        Self { store, events, locks: Mutex::new(HashMap::new()) }
    }

    pub fn store(&self) -> Arc<dyn RecordStore> {
        self.store.clone()
    }

    pub fn requests(&self) -> Repository<Request> {
        Repository::new(self.store.clone())
    }

    pub fn machines(&self) -> Repository<Machine> {
        Repository::new(self.store.clone())
    }

    pub fn templates(&self) -> Repository<Template> {
        Repository::new(self.store.clone())
    }

    /// Begin a unit of work without aggregate locking (creates, bulk loads).
    pub fn begin(&self) -> UnitOfWork {
        UnitOfWork {
            store: self.store.clone(),
            events: self.events.clone(),
            staged: Mutex::new(Vec::new()),
            staged_events: Mutex::new(Vec::new()),
            _aggregate_guard: None,
        }
    }

    /// Begin a unit of work holding the per-request lock; concurrent
    /// transitions on the same request id linearize here.
    pub async fn begin_for_request(&self, request_id: &str) -> UnitOfWork {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(request_id.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
        };
        let guard = lock.lock_owned().await;
        UnitOfWork {
            store: self.store.clone(),
            events: self.events.clone(),
            staged: Mutex::new(Vec::new()),
            staged_events: Mutex::new(Vec::new()),
            _aggregate_guard: Some(guard),
        }
    }
}

//! Event bus
//!
//! Fans domain events out to subscribed handlers in registration order.
//! Handler failures are logged and swallowed; event publication never
//! unwinds a commit.

use crate::domain::events::DomainEvent;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error};

#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Event kind this handler subscribes to, or `None` for all events.
    fn subscribed_kind(&self) -> Option<&'static str> {
        None
    }

    async fn handle(&self, event: &DomainEvent) -> Result<()>;
}

pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self { handlers: RwLock::new(Vec::new()) }
    }

    pub async fn subscribe(&self, handler: Arc<dyn EventHandler>) {
        self.handlers.write().await.push(handler);
    }

    /// Deliver one event to every matching handler, in subscription order.
    pub async fn publish(&self, event: &DomainEvent) {
        let handlers = self.handlers.read().await.clone();
        for handler in handlers {
            let interested = handler
                .subscribed_kind()
                .map(|kind| kind == event.kind_name())
                .unwrap_or(true);
            if !interested {
                continue;
            }
            if let Err(e) = handler.handle(event).await {
                error!(
                    "Event handler failed for {} on request {}: {}",
                    event.kind_name(),
                    event.request_id,
                    e
                );
            }
        }
        debug!("Published {} for request {}", event.kind_name(), event.request_id);
    }

    /// Deliver a batch preserving emission order.
    pub async fn publish_all(&self, events: &[DomainEvent]) {
        for event in events {
            self.publish(event).await;
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

//! Command and query buses
//!
//! Two independent dispatchers with typed registration: one handler per
//! command/query type, resolved by `TypeId`. Commands mutate state and
//! return the affected aggregate id; queries are side-effect free and return
//! their declared output type.

use crate::error::{BrokerError, Result};
use async_trait::async_trait;
use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

/// Marker for state-mutating messages.
pub trait Command: Send + 'static {}

#[async_trait]
pub trait CommandHandler<C: Command>: Send + Sync {
    /// Handle the command, returning the affected aggregate id.
    async fn handle(&self, command: C) -> Result<String>;
}

#[async_trait]
trait ErasedCommandHandler: Send + Sync {
    async fn handle_erased(&self, command: Box<dyn Any + Send>) -> Result<String>;
}

struct CommandAdapter<C, H> {
    handler: Arc<H>,
    _marker: std::marker::PhantomData<fn(C)>,
}

#[async_trait]
impl<C, H> ErasedCommandHandler for CommandAdapter<C, H>
where
    C: Command,
    H: CommandHandler<C>,
{
    async fn handle_erased(&self, command: Box<dyn Any + Send>) -> Result<String> {
        let command = command.downcast::<C>().map_err(|_| {
            BrokerError::infrastructure(format!(
                "command bus dispatched a mismatched type for {}",
                type_name::<C>()
            ))
        })?;
        self.handler.handle(*command).await
    }
}

pub struct CommandBus {
    handlers: RwLock<HashMap<TypeId, Arc<dyn ErasedCommandHandler>>>,
}

impl CommandBus {
    pub fn new() -> Self {
        Self { handlers: RwLock::new(HashMap::new()) }
    }

    pub async fn register<C: Command, H: CommandHandler<C> + 'static>(&self, handler: Arc<H>) {
        let previous = self.handlers.write().await.insert(
            TypeId::of::<C>(),
            Arc::new(CommandAdapter { handler, _marker: std::marker::PhantomData }),
        );
        if previous.is_some() {
            warn!("Replacing command handler for {}", type_name::<C>());
        }
    }

    pub async fn execute<C: Command>(&self, command: C) -> Result<String> {
        let handler = {
            let handlers = self.handlers.read().await;
            handlers.get(&TypeId::of::<C>()).cloned()
        };
        match handler {
            Some(h) => h.handle_erased(Box::new(command)).await,
            None => Err(BrokerError::NotFound {
                entity: "command_handler".to_string(),
                id: type_name::<C>().to_string(),
            }),
        }
    }
}

impl Default for CommandBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Marker for side-effect-free messages.
pub trait Query: Send + 'static {
    type Output: Send + 'static;
}

#[async_trait]
pub trait QueryHandler<Q: Query>: Send + Sync {
    async fn handle(&self, query: Q) -> Result<Q::Output>;
}

#[async_trait]
trait ErasedQueryHandler: Send + Sync {
    async fn handle_erased(&self, query: Box<dyn Any + Send>) -> Result<Box<dyn Any + Send>>;
}

struct QueryAdapter<Q, H> {
    handler: Arc<H>,
    _marker: std::marker::PhantomData<fn(Q)>,
}

#[async_trait]
impl<Q, H> ErasedQueryHandler for QueryAdapter<Q, H>
where
    Q: Query,
    H: QueryHandler<Q>,
{
    async fn handle_erased(&self, query: Box<dyn Any + Send>) -> Result<Box<dyn Any + Send>> {
        let query = query.downcast::<Q>().map_err(|_| {
            BrokerError::infrastructure(format!(
                "query bus dispatched a mismatched type for {}",
                type_name::<Q>()
            ))
        })?;
        let output = self.handler.handle(*query).await?;
        Ok(Box::new(output))
    }
}

pub struct QueryBus {
    handlers: RwLock<HashMap<TypeId, Arc<dyn ErasedQueryHandler>>>,
}

impl QueryBus {
    pub fn new() -> Self {
        Self { handlers: RwLock::new(HashMap::new()) }
    }

    pub async fn register<Q: Query, H: QueryHandler<Q> + 'static>(&self, handler: Arc<H>) {
        let previous = self.handlers.write().await.insert(
            TypeId::of::<Q>(),
            Arc::new(QueryAdapter { handler, _marker: std::marker::PhantomData }),
        );
        if previous.is_some() {
            warn!("Replacing query handler for {}", type_name::<Q>());
        }
    }

    pub async fn execute<Q: Query>(&self, query: Q) -> Result<Q::Output> {
        let handler = {
            let handlers = self.handlers.read().await;
            handlers.get(&TypeId::of::<Q>()).cloned()
        };
        let Some(h) = handler else {
            return Err(BrokerError::NotFound {
                entity: "query_handler".to_string(),
                id: type_name::<Q>().to_string(),
            });
        };
        let output = h.handle_erased(Box::new(query)).await?;
        output.downcast::<Q::Output>().map(|b| *b).map_err(|_| {
            BrokerError::infrastructure(format!(
                "query handler for {} returned a mismatched output type",
                type_name::<Q>()
            ))
        })
    }
}

impl Default for QueryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Ping(u32);
    impl Command for Ping {}

    struct PingHandler;

    #[async_trait]
    impl CommandHandler<Ping> for PingHandler {
        async fn handle(&self, command: Ping) -> Result<String> {
            Ok(format!("pong-{}", command.0))
        }
    }

    struct CountChars(String);
    impl Query for CountChars {
        type Output = usize;
    }

    struct CountCharsHandler;

    #[async_trait]
    impl QueryHandler<CountChars> for CountCharsHandler {
        async fn handle(&self, query: CountChars) -> Result<usize> {
            Ok(query.0.chars().count())
        }
    }

    #[tokio::test]
    async fn command_bus_routes_to_registered_handler() {
        let bus = CommandBus::new();
        bus.register::<Ping, _>(Arc::new(PingHandler)).await;
        assert_eq!(bus.execute(Ping(3)).await.unwrap(), "pong-3");
    }

    #[tokio::test]
    async fn unregistered_command_is_not_found() {
        let bus = CommandBus::new();
        let err = bus.execute(Ping(1)).await.unwrap_err();
        assert_eq!(err.error_code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn query_bus_returns_typed_output() {
        let bus = QueryBus::new();
        bus.register::<CountChars, _>(Arc::new(CountCharsHandler)).await;
        assert_eq!(bus.execute(CountChars("abcd".into())).await.unwrap(), 4);
    }
}

//! Dependency injection container
//!
//! A small typed-factory container used at wiring time. There is no
//! constructor reflection: components register explicit factories
//! (`register_factory`) or ready-made instances (`register_instance`), and
//! resolution walks factories recursively with cycle detection.
//!
//! Handlers for the CQRS buses live in registries separate from plain
//! services, so a command handler and a service of the same type never
//! collide.

use crate::error::{BrokerError, Result};
use std::any::{type_name, Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Lifetime of a registered component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// One instance per container, constructed on first resolution.
    Singleton,
    /// A fresh instance per resolution.
    Transient,
    /// One instance per `ScopeHandle`.
    Scoped,
}

type Erased = Arc<dyn Any + Send + Sync>;
type Factory = Arc<dyn Fn(&Resolver<'_>) -> Result<Erased> + Send + Sync>;

struct Registration {
    scope: Scope,
    factory: Factory,
    type_name: &'static str,
}

/// Typed-factory DI container.
pub struct Container {
    registrations: RwLock<HashMap<TypeId, Registration>>,
    singletons: RwLock<HashMap<TypeId, Erased>>,
    command_handlers: RwLock<HashMap<TypeId, Erased>>,
    query_handlers: RwLock<HashMap<TypeId, Erased>>,
    event_handlers: RwLock<HashMap<TypeId, Vec<Erased>>>,
}

impl Container {
    pub fn new() -> Self {
        Self {
            registrations: RwLock::new(HashMap::new()),
            singletons: RwLock::new(HashMap::new()),
            command_handlers: RwLock::new(HashMap::new()),
            query_handlers: RwLock::new(HashMap::new()),
            event_handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a factory for `T` under the given scope.
    pub fn register_factory<T, F>(&self, scope: Scope, factory: F)
    where
        T: Any + Send + Sync,
        F: Fn(&Resolver<'_>) -> Result<Arc<T>> + Send + Sync + 'static,
    {
        let erased: Factory = Arc::new(move |r| factory(r).map(|v| v as Erased));
        let previous = self.registrations.write().expect("di lock poisoned").insert(
            TypeId::of::<T>(),
            Registration { scope, factory: erased, type_name: type_name::<T>() },
        );
        if previous.is_some() {
            tracing::warn!("Replacing DI registration for {}", type_name::<T>());
        }
    }

    /// Register an existing instance as a singleton.
    pub fn register_instance<T: Any + Send + Sync>(&self, instance: Arc<T>) {
        self.register_factory::<T, _>(Scope::Singleton, move |_| Ok(instance.clone()));
    }

    /// Resolve `T`, constructing it (and its dependencies) as needed.
    pub fn get<T: Any + Send + Sync>(&self) -> Result<Arc<T>> {
        let resolver = Resolver { container: self, chain: RefCell::new(Vec::new()), scoped: None };
        resolver.get::<T>()
    }

    /// Resolve `T`, returning `None` instead of an error when unregistered.
    pub fn get_optional<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        match self.get::<T>() {
            Ok(v) => Some(v),
            Err(BrokerError::NotFound { .. }) => None,
            Err(e) => {
                tracing::warn!("Optional resolution of {} failed: {}", type_name::<T>(), e);
                None
            }
        }
    }

    /// Open a resolution scope: SCOPED registrations cache per handle.
    pub fn create_scope(&self) -> ScopeHandle<'_> {
        ScopeHandle { container: self, cache: RefCell::new(HashMap::new()) }
    }

    // CQRS handler registries.

    pub fn register_command_handler<C: Any>(&self, handler: Erased) {
        self.command_handlers
            .write()
            .expect("di lock poisoned")
            .insert(TypeId::of::<C>(), handler);
    }

    pub fn command_handler<C: Any>(&self) -> Option<Erased> {
        self.command_handlers.read().expect("di lock poisoned").get(&TypeId::of::<C>()).cloned()
    }

    pub fn register_query_handler<Q: Any>(&self, handler: Erased) {
        self.query_handlers
            .write()
            .expect("di lock poisoned")
            .insert(TypeId::of::<Q>(), handler);
    }

    pub fn query_handler<Q: Any>(&self) -> Option<Erased> {
        self.query_handlers.read().expect("di lock poisoned").get(&TypeId::of::<Q>()).cloned()
    }

    pub fn register_event_handler<E: Any>(&self, handler: Erased) {
        self.event_handlers
            .write()
            .expect("di lock poisoned")
            .entry(TypeId::of::<E>())
            .or_default()
            .push(handler);
    }

    pub fn event_handlers_for<E: Any>(&self) -> Vec<Erased> {
        self.event_handlers
            .read()
            .expect("di lock poisoned")
            .get(&TypeId::of::<E>())
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for Container {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolution context handed to factories; tracks the in-flight chain for
/// circular-dependency detection.
pub struct Resolver<'a> {
    container: &'a Container,
    chain: RefCell<Vec<&'static str>>,
    scoped: Option<&'a RefCell<HashMap<TypeId, Erased>>>,
}

impl<'a> Resolver<'a> {
    pub fn get<T: Any + Send + Sync>(&self) -> Result<Arc<T>> {
        let erased = self.resolve_erased(TypeId::of::<T>(), type_name::<T>())?;
        erased.downcast::<T>().map_err(|_| {
            BrokerError::infrastructure(format!(
                "DI registration for {} produced a different type",
                type_name::<T>()
            ))
        })
    }

    fn resolve_erased(&self, type_id: TypeId, name: &'static str) -> Result<Erased> {
        {
            let chain = self.chain.borrow();
            if chain.contains(&name) {
                let mut cycle: Vec<&str> = chain.clone();
                cycle.push(name);
                return Err(BrokerError::Configuration {
                    message: format!("Circular dependency detected: {}", cycle.join(" -> ")),
                    source: None,
                });
            }
        }

        let (scope, factory) = {
            let registrations = self.container.registrations.read().expect("di lock poisoned");
            match registrations.get(&type_id) {
                Some(r) => (r.scope, r.factory.clone()),
                None => {
                    return Err(BrokerError::NotFound {
                        entity: "di_registration".to_string(),
                        id: name.to_string(),
                    })
                }
            }
        };

        match scope {
            Scope::Singleton => {
                if let Some(existing) =
                    self.container.singletons.read().expect("di lock poisoned").get(&type_id)
                {
                    return Ok(existing.clone());
                }
                let instance = self.invoke(factory, name)?;
                let mut singletons =
                    self.container.singletons.write().expect("di lock poisoned");
                // A concurrent resolution may have won; keep the first.
                Ok(singletons.entry(type_id).or_insert(instance).clone())
            }
            Scope::Transient => self.invoke(factory, name),
            Scope::Scoped => match self.scoped {
                Some(cache) => {
                    if let Some(existing) = cache.borrow().get(&type_id) {
                        return Ok(existing.clone());
                    }
                    let instance = self.invoke(factory, name)?;
                    cache.borrow_mut().insert(type_id, instance.clone());
                    Ok(instance)
                }
                // Outside a scope, scoped behaves like transient.
                None => self.invoke(factory, name),
            },
        }
    }

    fn invoke(&self, factory: Factory, name: &'static str) -> Result<Erased> {
        self.chain.borrow_mut().push(name);
        let result = factory(self);
        self.chain.borrow_mut().pop();
        result
    }
}

/// Per-scope cache for SCOPED registrations.
pub struct ScopeHandle<'a> {
    container: &'a Container,
    cache: RefCell<HashMap<TypeId, Erased>>,
}

impl<'a> ScopeHandle<'a> {
    pub fn get<T: Any + Send + Sync>(&self) -> Result<Arc<T>> {
        let resolver = Resolver {
            container: self.container,
            chain: RefCell::new(Vec::new()),
            scoped: Some(&self.cache),
        };
        resolver.get::<T>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Leaf(u32);
    struct Node {
        leaf: Arc<Leaf>,
    }

    #[test]
    fn singleton_resolves_once() {
        let container = Container::new();
        container.register_factory::<Leaf, _>(Scope::Singleton, |_| Ok(Arc::new(Leaf(7))));

        let a = container.get::<Leaf>().unwrap();
        let b = container.get::<Leaf>().unwrap();
        assert_eq!(a.0, 7);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn transient_resolves_fresh() {
        let container = Container::new();
        container.register_factory::<Leaf, _>(Scope::Transient, |_| Ok(Arc::new(Leaf(1))));

        let a = container.get::<Leaf>().unwrap();
        let b = container.get::<Leaf>().unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn dependencies_resolve_recursively() {
        let container = Container::new();
        container.register_factory::<Leaf, _>(Scope::Singleton, |_| Ok(Arc::new(Leaf(3))));
        container.register_factory::<Node, _>(Scope::Transient, |r| {
            Ok(Arc::new(Node { leaf: r.get::<Leaf>()? }))
        });

        let node = container.get::<Node>().unwrap();
        assert_eq!(node.leaf.0, 3);
    }

    #[test]
    fn scoped_caches_per_scope() {
        let container = Container::new();
        container.register_factory::<Leaf, _>(Scope::Scoped, |_| Ok(Arc::new(Leaf(9))));

        let scope_a = container.create_scope();
        let a1 = scope_a.get::<Leaf>().unwrap();
        let a2 = scope_a.get::<Leaf>().unwrap();
        assert!(Arc::ptr_eq(&a1, &a2));

        let scope_b = container.create_scope();
        let b1 = scope_b.get::<Leaf>().unwrap();
        assert!(!Arc::ptr_eq(&a1, &b1));
    }

    #[test]
    fn unregistered_type_is_not_found() {
        let container = Container::new();
        assert!(container.get::<Leaf>().is_err());
        assert!(container.get_optional::<Leaf>().is_none());
    }

    #[test]
    fn cqrs_registries_do_not_collide_with_services() {
        struct CreateThing;

        let container = Container::new();
        // A service and a command handler registered under the same key type.
        container.register_factory::<Leaf, _>(Scope::Singleton, |_| Ok(Arc::new(Leaf(1))));
        container.register_command_handler::<CreateThing>(Arc::new(Leaf(2)));
        container.register_query_handler::<CreateThing>(Arc::new(Leaf(3)));
        container.register_event_handler::<CreateThing>(Arc::new(Leaf(4)));
        container.register_event_handler::<CreateThing>(Arc::new(Leaf(5)));

        assert_eq!(container.get::<Leaf>().unwrap().0, 1);
        let command = container.command_handler::<CreateThing>().unwrap();
        assert_eq!(command.downcast::<Leaf>().unwrap().0, 2);
        let query = container.query_handler::<CreateThing>().unwrap();
        assert_eq!(query.downcast::<Leaf>().unwrap().0, 3);
        // Event handlers accumulate in registration order.
        let events = container.event_handlers_for::<CreateThing>();
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn circular_dependency_names_the_cycle() {
        struct A;
        struct B;

        let container = Container::new();
        container.register_factory::<A, _>(Scope::Transient, |r| {
            r.get::<B>()?;
            Ok(Arc::new(A))
        });
        container.register_factory::<B, _>(Scope::Transient, |r| {
            r.get::<A>()?;
            Ok(Arc::new(B))
        });

        let err = container.get::<A>().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("Circular dependency"));
        assert!(message.contains("::A"));
        assert!(message.contains("::B"));
    }
}

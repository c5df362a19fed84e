//! Application layer
//!
//! Use-case orchestration over the domain: command and query buses, the
//! provider selection and capability services, the request lifecycle
//! poller and the root-object wiring.

pub mod bus;
pub mod capability;
pub mod commands;
pub mod events;
pub mod lifecycle;
pub mod queries;
pub mod selection;
pub mod wiring;

pub use bus::{Command, CommandBus, CommandHandler, Query, QueryBus, QueryHandler};
pub use capability::{CapabilityValidation, ProviderCapabilityService, ValidationLevel};
pub use events::{EventBus, EventHandler};
pub use lifecycle::RequestLifecycleService;
pub use selection::{ProviderSelectionService, SelectionResult};
pub use wiring::{App, AppCore, StrategyFactory};

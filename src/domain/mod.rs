//! Domain aggregates and events
//!
//! Aggregates reference each other by id only, never by pointer; cross-
//! aggregate lookups go through repositories. Each aggregate buffers its
//! domain events until the unit of work drains them at commit.

pub mod events;
pub mod machine;
pub mod request;
pub mod template;

pub use events::{DomainEvent, DomainEventKind};
pub use machine::{Machine, MachineResult};
pub use request::{Request, RequestStatus, RequestType};
pub use template::{
    AllocationStrategy, AwsTemplateExtensions, FleetType, PriceType, ProviderApi, Template,
};

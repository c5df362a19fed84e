//! hostbroker library
//!
//! A host-factory plugin: a long-lived control-plane component that a batch
//! scheduler drives to acquire and release pools of AWS compute on demand.
//! The scheduler speaks a narrow request/status/return protocol; the broker
//! translates each request into provisioning operations (EC2Fleet,
//! SpotFleet, Auto Scaling Groups or RunInstances), tracks requests through
//! a state machine and surfaces a normalized machine inventory back.
//!
//! ## Key Modules
//!
//! - **Domain**: `domain` — the Request, Machine and Template aggregates
//!   with their state machines and domain events
//! - **Application**: `app` — command/query buses, provider selection and
//!   capability validation, the lifecycle poller, root wiring
//! - **Provider System**: `provider` — the strategy trait, registry/router
//!   and composite (fallback, load-balancing) strategies
//! - **AWS**: `aws` — the four provisioning handlers, launch template
//!   manager, native-spec rendering, SDK adapter and instrumentation
//! - **Persistence**: `storage` — pluggable record stores (file, SQLite,
//!   DynamoDB, memory), repositories and the unit of work
//! - **Templates**: `templates` — priority-override file loading, defaults
//!   resolution and caching
//! - **Error Handling**: `error` — structured error types with stable codes
//!   and retry awareness
//!
//! ## Usage
//!
//! ```rust,no_run
//! use hostbroker::app::commands::CreateAcquisitionRequest;
//! use hostbroker::app::wiring::build_production_app;
//!
//! # async fn example() -> hostbroker::error::Result<()> {
//! let app = build_production_app(None).await?;
//! let request_id = app
//!     .commands
//!     .execute(CreateAcquisitionRequest::new("gpu-spot", 3))
//!     .await?;
//! let request = app.lifecycle.sync_request(&request_id).await?;
//! println!("{}: {}", request_id, request.status);
//! # Ok(())
//! # }
//! ```

pub mod app;
pub mod aws;
pub mod config;
pub mod di;
pub mod domain;
pub mod error;
pub mod exit_codes;
pub mod provider;
pub mod retry;
pub mod storage;
pub mod templates;

// Re-export commonly used types
pub use config::BrokerConfig;
pub use domain::{Machine, MachineResult, Request, RequestStatus, Template};
pub use error::{BrokerError, IsRetryable, Result};
pub use provider::{ProviderContext, ProviderStrategy};
pub use retry::{CircuitBreaker, ExponentialBackoffPolicy, RetryPolicy};

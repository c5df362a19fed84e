//! AWS provider implementation
//!
//! Four provisioning handlers (EC2Fleet, SpotFleet, ASG, RunInstances)
//! behind a common contract, a launch-template manager, native-spec
//! rendering, standardized operations with retry and circuit breaking, and
//! API instrumentation. The `AwsApi` port isolates everything from the SDK.

pub mod api;
pub mod handlers;
pub mod instrumentation;
pub mod launch_template;
pub mod machine_adapter;
pub mod native_spec;
pub mod operations;
pub mod sdk;
pub mod strategy;

pub use api::{AwsApi, InstanceInfo};
pub use handlers::{
    AcquireOutcome, AcquisitionLedger, AsgHandler, AwsHandler, Ec2FleetHandler, HandlerDeps,
    RunInstancesHandler, SpotFleetHandler,
};
pub use instrumentation::AwsApiMetrics;
pub use launch_template::{LaunchTemplateManager, LaunchTemplateResult};
pub use machine_adapter::MachineAdapter;
pub use native_spec::AwsNativeSpecService;
pub use operations::AwsOperations;
pub use sdk::SdkAwsApi;
pub use strategy::AwsProviderStrategy;

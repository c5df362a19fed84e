//! Narrow port over the AWS provisioning surface
//!
//! Handlers never touch the SDK directly; they speak this trait so unit
//! tests can substitute a mock. The SDK adapter in `sdk.rs` is the only
//! module that knows about typed AWS builders.

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Normalized view of an EC2 instance.
#[derive(Debug, Clone, Default)]
pub struct InstanceInfo {
    pub instance_id: String,
    pub state: String,
    pub instance_type: Option<String>,
    pub availability_zone: Option<String>,
    pub private_ip: Option<String>,
    pub public_ip: Option<String>,
    pub launch_time: Option<DateTime<Utc>>,
    /// "spot" for spot instances, absent for on-demand.
    pub lifecycle: Option<String>,
    pub tags: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct FleetCreationResult {
    pub fleet_id: String,
    /// Instance ids for `instant` fleets; empty for asynchronous types.
    pub instance_ids: Vec<String>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ReservationResult {
    pub reservation_id: String,
    pub instances: Vec<InstanceInfo>,
}

#[derive(Debug, Clone)]
pub struct AsgInfo {
    pub name: String,
    pub desired_capacity: i32,
    pub min_size: i32,
    pub max_size: i32,
    pub instance_ids: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct LaunchTemplateInfo {
    pub template_id: String,
    pub name: String,
    pub latest_version: u64,
    pub default_version: u64,
}

/// One ASG tag with its propagation and resource binding.
#[derive(Debug, Clone)]
pub struct AsgTag {
    pub key: String,
    pub value: String,
    pub propagate_at_launch: bool,
    pub resource_id: String,
}

/// The AWS calls the four provisioning handlers and the launch template
/// manager need. Payload-shaped arguments arrive as rendered JSON specs; the
/// adapter maps them onto typed SDK builders.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AwsApi: Send + Sync {
    // EC2 Fleet
    async fn create_fleet(&self, config: serde_json::Value) -> Result<FleetCreationResult>;
    async fn describe_fleet_instances(&self, fleet_id: &str) -> Result<Vec<String>>;
    async fn delete_fleet(&self, fleet_id: &str, terminate_instances: bool) -> Result<()>;

    // Spot Fleet
    async fn request_spot_fleet(&self, config: serde_json::Value) -> Result<String>;
    async fn describe_spot_fleet_instances(&self, spot_fleet_request_id: &str)
        -> Result<Vec<String>>;
    async fn cancel_spot_fleet_requests(
        &self,
        request_ids: Vec<String>,
        terminate_instances: bool,
    ) -> Result<()>;

    // Plain instances
    async fn run_instances(&self, config: serde_json::Value) -> Result<ReservationResult>;
    async fn terminate_instances(&self, instance_ids: Vec<String>) -> Result<()>;
    async fn describe_instances(&self, instance_ids: Vec<String>) -> Result<Vec<InstanceInfo>>;
    async fn create_tags(
        &self,
        resource_ids: Vec<String>,
        tags: HashMap<String, String>,
    ) -> Result<()>;

    // Auto Scaling
    async fn create_auto_scaling_group(&self, config: serde_json::Value) -> Result<()>;
    async fn describe_auto_scaling_group(&self, name: &str) -> Result<Option<AsgInfo>>;
    async fn update_auto_scaling_group(
        &self,
        name: &str,
        desired_capacity: i32,
        min_size: Option<i32>,
    ) -> Result<()>;
    async fn detach_instances(
        &self,
        name: &str,
        instance_ids: Vec<String>,
        decrement_desired_capacity: bool,
    ) -> Result<()>;
    async fn delete_auto_scaling_group(&self, name: &str, force_delete: bool) -> Result<()>;
    async fn create_or_update_asg_tags(&self, tags: Vec<AsgTag>) -> Result<()>;

    // Launch templates
    async fn create_launch_template(
        &self,
        name: &str,
        data: serde_json::Value,
        tags: HashMap<String, String>,
    ) -> Result<LaunchTemplateInfo>;
    async fn describe_launch_template_by_name(&self, name: &str)
        -> Result<Option<LaunchTemplateInfo>>;
    async fn create_launch_template_version(
        &self,
        template_id: &str,
        data: serde_json::Value,
    ) -> Result<u64>;
    async fn delete_launch_template_versions(
        &self,
        template_id: &str,
        versions: Vec<u64>,
    ) -> Result<()>;

    /// Cheap connectivity probe used by health checks.
    async fn ping(&self) -> Result<()>;
}

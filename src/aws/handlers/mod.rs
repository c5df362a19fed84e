//! AWS provisioning handlers
//!
//! Four semantically distinct provisioning paths behind one contract:
//! `acquire_hosts`, `check_hosts_status`, `release_hosts`. Acquisition is
//! idempotent at the resource-id level: a re-dispatched request returns the
//! recorded resource ids instead of creating a second fleet.

pub mod asg;
pub mod ec2_fleet;
pub mod run_instances;
pub mod spot_fleet;

pub use asg::AsgHandler;
pub use ec2_fleet::Ec2FleetHandler;
pub use run_instances::RunInstancesHandler;
pub use spot_fleet::SpotFleetHandler;

use crate::aws::api::InstanceInfo;
use crate::aws::launch_template::LaunchTemplateManager;
use crate::aws::machine_adapter::MachineAdapter;
use crate::aws::native_spec::AwsNativeSpecService;
use crate::aws::operations::AwsOperations;
use crate::domain::{Machine, PriceType, ProviderApi, Request, Template};
use crate::error::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Result of an acquisition attempt.
#[derive(Debug, Clone, Default)]
pub struct AcquireOutcome {
    pub success: bool,
    pub resource_ids: Vec<String>,
    pub instances: Vec<InstanceInfo>,
    pub error_message: Option<String>,
}

impl AcquireOutcome {
    pub fn succeeded(resource_ids: Vec<String>, instances: Vec<InstanceInfo>) -> Self {
        Self { success: true, resource_ids, instances, error_message: None }
    }
}

#[async_trait]
pub trait AwsHandler: Send + Sync {
    fn provider_api(&self) -> ProviderApi;

    /// Acquire capacity. Idempotent per `request.request_id`.
    async fn acquire_hosts(&self, request: &Request, template: &Template)
        -> Result<AcquireOutcome>;

    /// Enumerate live instances across all of the request's resource ids.
    /// Read-only.
    async fn check_hosts_status(&self, request: &Request) -> Result<Vec<Machine>>;

    /// Scale down / delete resources and terminate owned instances.
    async fn release_hosts(&self, request: &Request) -> Result<()>;
}

/// In-process record of completed acquisitions, keyed by request id.
#[derive(Default)]
pub struct AcquisitionLedger {
    entries: Mutex<HashMap<String, Vec<String>>>,
}

impl AcquisitionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn recorded(&self, request_id: &str) -> Option<Vec<String>> {
        self.entries.lock().await.get(request_id).cloned()
    }

    pub async fn record(&self, request_id: &str, resource_ids: Vec<String>) {
        self.entries.lock().await.insert(request_id.to_string(), resource_ids);
    }

    pub async fn forget(&self, request_id: &str) {
        self.entries.lock().await.remove(request_id);
    }
}

/// Dependencies shared by every handler.
#[derive(Clone)]
pub struct HandlerDeps {
    pub ops: Arc<AwsOperations>,
    pub launch_templates: Arc<LaunchTemplateManager>,
    pub native_spec: Arc<AwsNativeSpecService>,
    pub machines: Arc<MachineAdapter>,
    pub ledger: Arc<AcquisitionLedger>,
}

// -- shared payload helpers --------------------------------------------------

/// Launch-template override entries: the cross product of subnets and
/// weighted instance types, or attribute-based requirements when the
/// template declares them.
pub(crate) fn launch_template_overrides(template: &Template) -> Vec<Value> {
    let mut overrides = Vec::new();
    if let Some(requirements) = &template.aws.instance_requirements {
        for subnet in &template.subnet_ids {
            overrides.push(json!({
                "SubnetId": subnet,
                "InstanceRequirements": requirements,
            }));
        }
        return overrides;
    }
    for subnet in &template.subnet_ids {
        for (instance_type, weight) in template.weighted_instance_types() {
            overrides.push(json!({
                "InstanceType": instance_type,
                "SubnetId": subnet,
                "WeightedCapacity": weight,
            }));
        }
    }
    overrides
}

/// Tag specifications propagated to instances and to the fleet-level
/// resource.
pub(crate) fn tag_specifications(
    template: &Template,
    request: &Request,
    fleet_resource_type: &str,
) -> Value {
    let mut tags: Vec<Value> = template
        .tags
        .iter()
        .map(|(k, v)| json!({"Key": k, "Value": v}))
        .collect();
    tags.push(json!({"Key": "RequestId", "Value": request.request_id}));
    tags.push(json!({"Key": "TemplateId", "Value": template.template_id}));
    json!([
        {"ResourceType": "instance", "Tags": tags.clone()},
        {"ResourceType": fleet_resource_type, "Tags": tags},
    ])
}

/// Split requested capacity into on-demand and spot shares.
pub(crate) fn capacity_split(template: &Template, requested: u32) -> (u32, u32) {
    match (template.price_type, template.aws.percent_on_demand) {
        (PriceType::Ondemand, None) => (requested, 0),
        (PriceType::Spot, None) => (0, requested),
        (_, Some(percent)) => {
            let on_demand =
                ((u64::from(requested) * u64::from(percent) + 50) / 100) as u32;
            let on_demand = on_demand.min(requested);
            (on_demand, requested - on_demand)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(price_type: &str, percent: Option<u8>) -> Template {
        let mut v = serde_json::json!({
            "template_id": "t1",
            "provider_api": "EC2Fleet",
            "image_id": "ami-1",
            "instance_type": "t3.micro",
            "subnet_ids": ["subnet-a", "subnet-b"],
            "price_type": price_type,
        });
        if let Some(p) = percent {
            v["percent_on_demand"] = serde_json::json!(p);
        }
        Template::from_value(v).unwrap()
    }

    #[test]
    fn capacity_split_honors_percent_on_demand() {
        assert_eq!(capacity_split(&template("ondemand", None), 10), (10, 0));
        assert_eq!(capacity_split(&template("spot", None), 10), (0, 10));
        assert_eq!(capacity_split(&template("spot", Some(30)), 10), (3, 7));
        assert_eq!(capacity_split(&template("spot", Some(100)), 10), (10, 0));
        assert_eq!(capacity_split(&template("spot", Some(0)), 10), (0, 10));
    }

    #[test]
    fn overrides_cover_subnet_by_type_product() {
        let overrides = launch_template_overrides(&template("spot", None));
        assert_eq!(overrides.len(), 2);
        assert_eq!(overrides[0]["SubnetId"], "subnet-a");
        assert_eq!(overrides[1]["SubnetId"], "subnet-b");
    }

    #[tokio::test]
    async fn ledger_round_trip() {
        let ledger = AcquisitionLedger::new();
        assert!(ledger.recorded("r1").await.is_none());
        ledger.record("r1", vec!["fleet-1".into()]).await;
        assert_eq!(ledger.recorded("r1").await.unwrap(), vec!["fleet-1".to_string()]);
        ledger.forget("r1").await;
        assert!(ledger.recorded("r1").await.is_none());
    }
}

//! Shared test doubles: a scriptable in-memory `AwsApi` implementation and
//! small helpers for building configs and templates.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use hostbroker::aws::api::{
    AsgInfo, AsgTag, AwsApi, FleetCreationResult, InstanceInfo, LaunchTemplateInfo,
    ReservationResult,
};
use hostbroker::config::{BrokerConfig, ProviderInstanceConfig};
use hostbroker::error::{BrokerError, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Mutex;

/// Records every call with its payload and serves scripted responses.
pub struct FakeAwsApi {
    pub calls: Mutex<Vec<(String, Value)>>,
    /// Instance ids returned for instant fleets and fleet status checks.
    pub fleet_instances: Mutex<Vec<String>>,
    /// Instance ids an `instant` CreateFleet returns immediately.
    pub instant_instances: Mutex<Vec<String>>,
    pub asg: Mutex<Option<AsgInfo>>,
    pub existing_launch_template: Mutex<Option<LaunchTemplateInfo>>,
    /// When true, every run_instances call fails with a capacity error.
    pub run_instances_capacity_error: Mutex<bool>,
}

impl Default for FakeAwsApi {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fleet_instances: Mutex::new(Vec::new()),
            instant_instances: Mutex::new(Vec::new()),
            asg: Mutex::new(None),
            existing_launch_template: Mutex::new(None),
            run_instances_capacity_error: Mutex::new(false),
        }
    }
}

impl FakeAwsApi {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, method: &str, details: Value) {
        self.calls.lock().unwrap().push((method.to_string(), details));
    }

    pub fn call_names(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn calls_named(&self, method: &str) -> Vec<Value> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == method)
            .map(|(_, details)| details.clone())
            .collect()
    }

    fn running_instance(&self, id: &str) -> InstanceInfo {
        InstanceInfo {
            instance_id: id.to_string(),
            state: "running".to_string(),
            instance_type: Some("t3.micro".to_string()),
            availability_zone: Some("us-east-1a".to_string()),
            private_ip: Some("10.0.0.5".to_string()),
            public_ip: None,
            launch_time: Some(Utc::now()),
            lifecycle: None,
            tags: HashMap::new(),
        }
    }
}

#[async_trait]
impl AwsApi for FakeAwsApi {
    async fn create_fleet(&self, config: Value) -> Result<FleetCreationResult> {
        self.record("create_fleet", config.clone());
        Ok(FleetCreationResult {
            fleet_id: "fleet-1234567890abcdef".to_string(),
            instance_ids: self.instant_instances.lock().unwrap().clone(),
            errors: Vec::new(),
        })
    }

    async fn describe_fleet_instances(&self, fleet_id: &str) -> Result<Vec<String>> {
        self.record("describe_fleet_instances", json!({"fleet_id": fleet_id}));
        Ok(self.fleet_instances.lock().unwrap().clone())
    }

    async fn delete_fleet(&self, fleet_id: &str, terminate_instances: bool) -> Result<()> {
        self.record(
            "delete_fleet",
            json!({"fleet_id": fleet_id, "terminate_instances": terminate_instances}),
        );
        Ok(())
    }

    async fn request_spot_fleet(&self, config: Value) -> Result<String> {
        self.record("request_spot_fleet", config);
        Ok("sfr-11111111-2222-3333-4444-555555555555".to_string())
    }

    async fn describe_spot_fleet_instances(&self, id: &str) -> Result<Vec<String>> {
        self.record("describe_spot_fleet_instances", json!({"id": id}));
        Ok(self.fleet_instances.lock().unwrap().clone())
    }

    async fn cancel_spot_fleet_requests(
        &self,
        request_ids: Vec<String>,
        terminate_instances: bool,
    ) -> Result<()> {
        self.record(
            "cancel_spot_fleet_requests",
            json!({"request_ids": request_ids, "terminate_instances": terminate_instances}),
        );
        Ok(())
    }

    async fn run_instances(&self, config: Value) -> Result<ReservationResult> {
        self.record("run_instances", config.clone());
        if *self.run_instances_capacity_error.lock().unwrap() {
            return Err(BrokerError::Capacity {
                message: "InsufficientInstanceCapacity: no t3.micro in subnet-a".to_string(),
                retry_after_secs: Some(30),
            });
        }
        let count = config
            .get("MinCount")
            .and_then(|v| v.as_u64())
            .unwrap_or(1) as usize;
        let instances = (0..count).map(|i| self.running_instance(&format!("i-ri{i}"))).collect();
        Ok(ReservationResult { reservation_id: "r-0123456789abcdef0".to_string(), instances })
    }

    async fn terminate_instances(&self, instance_ids: Vec<String>) -> Result<()> {
        self.record("terminate_instances", json!({"instance_ids": instance_ids}));
        Ok(())
    }

    async fn describe_instances(&self, instance_ids: Vec<String>) -> Result<Vec<InstanceInfo>> {
        self.record("describe_instances", json!({"instance_ids": instance_ids}));
        Ok(instance_ids.iter().map(|id| self.running_instance(id)).collect())
    }

    async fn create_tags(
        &self,
        resource_ids: Vec<String>,
        tags: HashMap<String, String>,
    ) -> Result<()> {
        self.record("create_tags", json!({"resource_ids": resource_ids, "tags": tags}));
        Ok(())
    }

    async fn create_auto_scaling_group(&self, config: Value) -> Result<()> {
        self.record("create_auto_scaling_group", config);
        Ok(())
    }

    async fn describe_auto_scaling_group(&self, name: &str) -> Result<Option<AsgInfo>> {
        self.record("describe_auto_scaling_group", json!({"name": name}));
        Ok(self.asg.lock().unwrap().clone())
    }

    async fn update_auto_scaling_group(
        &self,
        name: &str,
        desired_capacity: i32,
        min_size: Option<i32>,
    ) -> Result<()> {
        self.record(
            "update_auto_scaling_group",
            json!({"name": name, "desired_capacity": desired_capacity, "min_size": min_size}),
        );
        Ok(())
    }

    async fn detach_instances(
        &self,
        name: &str,
        instance_ids: Vec<String>,
        decrement_desired_capacity: bool,
    ) -> Result<()> {
        self.record(
            "detach_instances",
            json!({
                "name": name,
                "instance_ids": instance_ids,
                "decrement_desired_capacity": decrement_desired_capacity,
            }),
        );
        Ok(())
    }

    async fn delete_auto_scaling_group(&self, name: &str, force_delete: bool) -> Result<()> {
        self.record(
            "delete_auto_scaling_group",
            json!({"name": name, "force_delete": force_delete}),
        );
        Ok(())
    }

    async fn create_or_update_asg_tags(&self, tags: Vec<AsgTag>) -> Result<()> {
        let rendered: Vec<Value> = tags
            .iter()
            .map(|t| {
                json!({
                    "key": t.key,
                    "value": t.value,
                    "propagate_at_launch": t.propagate_at_launch,
                    "resource_id": t.resource_id,
                })
            })
            .collect();
        self.record("create_or_update_asg_tags", json!(rendered));
        Ok(())
    }

    async fn create_launch_template(
        &self,
        name: &str,
        data: Value,
        tags: HashMap<String, String>,
    ) -> Result<LaunchTemplateInfo> {
        self.record(
            "create_launch_template",
            json!({"name": name, "data": data, "tags": tags}),
        );
        Ok(LaunchTemplateInfo {
            template_id: "lt-0abc".to_string(),
            name: name.to_string(),
            latest_version: 1,
            default_version: 1,
        })
    }

    async fn describe_launch_template_by_name(
        &self,
        name: &str,
    ) -> Result<Option<LaunchTemplateInfo>> {
        self.record("describe_launch_template_by_name", json!({"name": name}));
        Ok(self.existing_launch_template.lock().unwrap().clone())
    }

    async fn create_launch_template_version(
        &self,
        template_id: &str,
        data: Value,
    ) -> Result<u64> {
        self.record(
            "create_launch_template_version",
            json!({"template_id": template_id, "data": data}),
        );
        Ok(2)
    }

    async fn delete_launch_template_versions(
        &self,
        template_id: &str,
        versions: Vec<u64>,
    ) -> Result<()> {
        self.record(
            "delete_launch_template_versions",
            json!({"template_id": template_id, "versions": versions}),
        );
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.record("ping", json!({}));
        Ok(())
    }
}

pub fn test_instance_config(name: &str) -> ProviderInstanceConfig {
    ProviderInstanceConfig {
        name: name.to_string(),
        provider_type: "aws".to_string(),
        enabled: true,
        priority: 100,
        weight: 1,
        capabilities: vec![
            "EC2Fleet".to_string(),
            "SpotFleet".to_string(),
            "ASG".to_string(),
            "RunInstances".to_string(),
        ],
        config: json!({}),
        template_defaults: json!({}),
    }
}

pub fn test_config() -> BrokerConfig {
    let mut config = BrokerConfig::default();
    config.provider.providers = vec![test_instance_config("aws-default")];
    config
}

pub fn ec2_fleet_template(id: &str) -> Value {
    json!({
        "template_id": id,
        "provider_api": "EC2Fleet",
        "image_id": "ami-1",
        "instance_type": "t3.micro",
        "subnet_ids": ["subnet-a"],
        "security_group_ids": ["sg-a"],
        "max_instances": 10
    })
}

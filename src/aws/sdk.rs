//! SDK-backed implementation of the `AwsApi` port
//!
//! The only module that touches typed AWS builders. Rendered JSON specs are
//! mapped key-by-key onto the fluent builders; unknown keys are logged and
//! dropped rather than failing the call. Service clients are constructed
//! lazily from one shared SDK config and shared across handlers.

use crate::aws::api::{
    AsgInfo, AsgTag, AwsApi, FleetCreationResult, InstanceInfo, LaunchTemplateInfo,
    ReservationResult,
};
use crate::aws::instrumentation::{is_throttling_code, AwsApiMetrics};
use crate::config::AwsClientConfig;
use crate::error::{BrokerError, Result};
use async_trait::async_trait;
use aws_config::retry::RetryConfig;
use aws_config::timeout::TimeoutConfig;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_ec2::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_ec2::types as ec2;
use chrono::DateTime;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, warn};

pub struct SdkAwsApi {
    sdk_config: SdkConfig,
    ec2: OnceLock<aws_sdk_ec2::Client>,
    autoscaling: OnceLock<aws_sdk_autoscaling::Client>,
    metrics: Arc<AwsApiMetrics>,
}

impl SdkAwsApi {
    /// Build the shared SDK config with region/profile from the selected
    /// provider instance, adaptive retry and the configured timeouts.
    pub async fn connect(
        config: &AwsClientConfig,
        region: Option<String>,
        profile: Option<String>,
        metrics: Arc<AwsApiMetrics>,
    ) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .retry_config(
                RetryConfig::adaptive().with_max_attempts(config.max_retries.max(1)),
            )
            .timeout_config(
                TimeoutConfig::builder()
                    .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
                    .read_timeout(Duration::from_secs(config.read_timeout_secs))
                    .build(),
            );
        if let Some(region) = region.or_else(|| config.region.clone()) {
            loader = loader.region(Region::new(region));
        }
        if let Some(profile) = profile.or_else(|| config.profile.clone()) {
            loader = loader.profile_name(profile);
        }
        let sdk_config = loader.load().await;
        debug!(
            "AWS SDK config loaded, region: {:?}, retries: {}, timeouts: connect={}s read={}s",
            sdk_config.region(),
            config.max_retries,
            config.connect_timeout_secs,
            config.read_timeout_secs
        );
        Self { sdk_config, ec2: OnceLock::new(), autoscaling: OnceLock::new(), metrics }
    }

    fn ec2(&self) -> &aws_sdk_ec2::Client {
        self.ec2.get_or_init(|| aws_sdk_ec2::Client::new(&self.sdk_config))
    }

    fn autoscaling(&self) -> &aws_sdk_autoscaling::Client {
        self.autoscaling.get_or_init(|| aws_sdk_autoscaling::Client::new(&self.sdk_config))
    }

    /// Run one SDK call under the metrics recorder.
    async fn call<T, Fut>(
        &self,
        service: &str,
        operation: &str,
        payload_size: Option<usize>,
        fut: Fut,
    ) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let context = self.metrics.begin_call(service, operation);
        let result = fut.await;
        if let Some(context) = context {
            self.metrics.end_call(context, result.as_ref().err(), payload_size);
        }
        result
    }
}

/// Map an SDK error onto the domain taxonomy.
fn map_sdk_error<E>(context: &str, err: SdkError<E>) -> BrokerError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
            BrokerError::Network(format!("{context}: {err}"))
        }
        _ => {
            let code = err.code().unwrap_or("Unknown").to_string();
            let message = err.message().unwrap_or("no message").to_string();
            classify_aws_error(context, &code, &message, err)
        }
    }
}

fn classify_aws_error<E>(context: &str, code: &str, message: &str, source: E) -> BrokerError
where
    E: std::error::Error + Send + Sync + 'static,
{
    if is_throttling_code(code) {
        return BrokerError::Throttling(format!("{context}: {code}: {message}"));
    }
    if code.contains("InsufficientInstanceCapacity")
        || code.contains("InsufficientCapacity")
        || code == "InstanceLimitExceeded"
        || code == "MaxSpotInstanceCountExceeded"
        || code == "SpotMaxPriceTooLow"
    {
        return BrokerError::Capacity {
            message: format!("{context}: {code}: {message}"),
            retry_after_secs: Some(30),
        };
    }
    match code {
        "UnauthorizedOperation" | "AuthFailure" | "InvalidClientTokenId" | "AccessDenied"
        | "AccessDeniedException" | "OptInRequired" => {
            BrokerError::Authorization(format!("{context}: {code}: {message}"))
        }
        "RequestTimeout" | "RequestTimeoutException" => {
            BrokerError::Network(format!("{context}: {code}: {message}"))
        }
        _ => BrokerError::Infrastructure {
            message: format!("{context}: {code}: {message}"),
            source: Some(Box::new(source)),
        },
    }
}

// -- JSON helpers ------------------------------------------------------------

fn json_str(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(|v| v.as_str()).map(|s| s.to_string())
}

/// Accepts both native numbers and stringified numbers, which templated
/// specs routinely produce.
fn json_i32(value: &Value, key: &str) -> Option<i32> {
    match value.get(key) {
        Some(Value::Number(n)) => n.as_i64().map(|v| v as i32),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    }
}

fn json_f64(value: &Value, key: &str) -> Option<f64> {
    match value.get(key) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    }
}

fn json_bool(value: &Value, key: &str) -> Option<bool> {
    match value.get(key) {
        Some(Value::Bool(b)) => Some(*b),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    }
}

fn ec2_tags(tags: &Value) -> Vec<ec2::Tag> {
    tags.as_array()
        .map(|entries| {
            entries
                .iter()
                .filter_map(|t| {
                    Some(
                        ec2::Tag::builder()
                            .key(json_str(t, "Key")?)
                            .value(json_str(t, "Value")?)
                            .build(),
                    )
                })
                .collect()
        })
        .unwrap_or_default()
}

fn ec2_tag_specifications(config: &Value) -> Vec<ec2::TagSpecification> {
    config
        .get("TagSpecifications")
        .and_then(|v| v.as_array())
        .map(|specs| {
            specs
                .iter()
                .filter_map(|spec| {
                    let resource_type = json_str(spec, "ResourceType")?;
                    Some(
                        ec2::TagSpecification::builder()
                            .resource_type(ec2::ResourceType::from(resource_type.as_str()))
                            .set_tags(Some(ec2_tags(spec.get("Tags").unwrap_or(&Value::Null))))
                            .build(),
                    )
                })
                .collect()
        })
        .unwrap_or_default()
}

fn fleet_launch_template_configs(config: &Value) -> Vec<ec2::FleetLaunchTemplateConfigRequest> {
    config
        .get("LaunchTemplateConfigs")
        .and_then(|v| v.as_array())
        .map(|configs| {
            configs
                .iter()
                .map(|entry| {
                    let mut builder = ec2::FleetLaunchTemplateConfigRequest::builder();
                    if let Some(spec) = entry.get("LaunchTemplateSpecification") {
                        let mut spec_builder =
                            ec2::FleetLaunchTemplateSpecificationRequest::builder();
                        if let Some(id) = json_str(spec, "LaunchTemplateId") {
                            spec_builder = spec_builder.launch_template_id(id);
                        }
                        if let Some(name) = json_str(spec, "LaunchTemplateName") {
                            spec_builder = spec_builder.launch_template_name(name);
                        }
                        if let Some(version) = json_str(spec, "Version") {
                            spec_builder = spec_builder.version(version);
                        }
                        builder = builder.launch_template_specification(spec_builder.build());
                    }
                    if let Some(overrides) = entry.get("Overrides").and_then(|v| v.as_array()) {
                        for o in overrides {
                            let mut ob = ec2::FleetLaunchTemplateOverridesRequest::builder();
                            if let Some(instance_type) = json_str(o, "InstanceType") {
                                ob = ob
                                    .instance_type(ec2::InstanceType::from(instance_type.as_str()));
                            }
                            if let Some(subnet) = json_str(o, "SubnetId") {
                                ob = ob.subnet_id(subnet);
                            }
                            if let Some(weight) = json_f64(o, "WeightedCapacity") {
                                ob = ob.weighted_capacity(weight);
                            }
                            if let Some(requirements) = o.get("InstanceRequirements") {
                                ob = ob.instance_requirements(instance_requirements(requirements));
                            }
                            builder = builder.overrides(ob.build());
                        }
                    }
                    builder.build()
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Core attribute-based instance selection fields; uncovered attributes are
/// dropped with a warning.
fn instance_requirements(value: &Value) -> ec2::InstanceRequirementsRequest {
    let mut builder = ec2::InstanceRequirementsRequest::builder();
    if let Some(vcpu) = value.get("VCpuCount") {
        let mut vb = ec2::VCpuCountRangeRequest::builder();
        if let Some(min) = json_i32(vcpu, "Min") {
            vb = vb.min(min);
        }
        if let Some(max) = json_i32(vcpu, "Max") {
            vb = vb.max(max);
        }
        builder = builder.v_cpu_count(vb.build());
    }
    if let Some(memory) = value.get("MemoryMiB") {
        let mut mb = ec2::MemoryMiBRequest::builder();
        if let Some(min) = json_i32(memory, "Min") {
            mb = mb.min(min);
        }
        if let Some(max) = json_i32(memory, "Max") {
            mb = mb.max(max);
        }
        builder = builder.memory_mi_b(mb.build());
    }
    if let Some(other) = value.as_object() {
        for key in other.keys() {
            if key != "VCpuCount" && key != "MemoryMiB" {
                warn!("Unsupported instance requirement attribute '{}', dropping", key);
            }
        }
    }
    builder.build()
}

fn launch_template_data(data: &Value) -> ec2::RequestLaunchTemplateData {
    let mut builder = ec2::RequestLaunchTemplateData::builder();
    if let Some(image_id) = json_str(data, "ImageId") {
        builder = builder.image_id(image_id);
    }
    if let Some(instance_type) = json_str(data, "InstanceType") {
        builder = builder.instance_type(ec2::InstanceType::from(instance_type.as_str()));
    }
    if let Some(key_name) = json_str(data, "KeyName") {
        builder = builder.key_name(key_name);
    }
    if let Some(user_data) = json_str(data, "UserData") {
        builder = builder.user_data(user_data);
    }
    if let Some(groups) = data.get("SecurityGroupIds").and_then(|v| v.as_array()) {
        for group in groups.iter().filter_map(|g| g.as_str()) {
            builder = builder.security_group_ids(group);
        }
    }
    if let Some(profile) = data.get("IamInstanceProfile") {
        let mut pb = ec2::LaunchTemplateIamInstanceProfileSpecificationRequest::builder();
        if let Some(name) = json_str(profile, "Name") {
            pb = pb.name(name);
        }
        if let Some(arn) = json_str(profile, "Arn") {
            pb = pb.arn(arn);
        }
        builder = builder.iam_instance_profile(pb.build());
    }
    if let Some(monitoring) = data.get("Monitoring").and_then(|m| json_bool(m, "Enabled")) {
        builder = builder
            .monitoring(ec2::LaunchTemplatesMonitoringRequest::builder().enabled(monitoring).build());
    }
    if let Some(interfaces) = data.get("NetworkInterfaces").and_then(|v| v.as_array()) {
        for (index, iface) in interfaces.iter().enumerate() {
            let mut ib = ec2::LaunchTemplateInstanceNetworkInterfaceSpecificationRequest::builder()
                .device_index(json_i32(iface, "DeviceIndex").unwrap_or(index as i32));
            if let Some(assign) = json_bool(iface, "AssociatePublicIpAddress") {
                ib = ib.associate_public_ip_address(assign);
            }
            if let Some(subnet) = json_str(iface, "SubnetId") {
                ib = ib.subnet_id(subnet);
            }
            if let Some(groups) = iface.get("Groups").and_then(|v| v.as_array()) {
                for group in groups.iter().filter_map(|g| g.as_str()) {
                    ib = ib.groups(group);
                }
            }
            builder = builder.network_interfaces(ib.build());
        }
    }
    if let Some(mappings) = data.get("BlockDeviceMappings").and_then(|v| v.as_array()) {
        for mapping in mappings {
            let mut mb = ec2::LaunchTemplateBlockDeviceMappingRequest::builder();
            if let Some(device) = json_str(mapping, "DeviceName") {
                mb = mb.device_name(device);
            }
            if let Some(ebs) = mapping.get("Ebs") {
                let mut eb = ec2::LaunchTemplateEbsBlockDeviceRequest::builder();
                if let Some(size) = json_i32(ebs, "VolumeSize") {
                    eb = eb.volume_size(size);
                }
                if let Some(volume_type) = json_str(ebs, "VolumeType") {
                    eb = eb.volume_type(ec2::VolumeType::from(volume_type.as_str()));
                }
                if let Some(iops) = json_i32(ebs, "Iops") {
                    eb = eb.iops(iops);
                }
                if let Some(delete) = json_bool(ebs, "DeleteOnTermination") {
                    eb = eb.delete_on_termination(delete);
                }
                mb = mb.ebs(eb.build());
            }
            builder = builder.block_device_mappings(mb.build());
        }
    }
    if let Some(specs) = data.get("TagSpecifications").and_then(|v| v.as_array()) {
        for spec in specs {
            if let Some(resource_type) = json_str(spec, "ResourceType") {
                builder = builder.tag_specifications(
                    ec2::LaunchTemplateTagSpecificationRequest::builder()
                        .resource_type(ec2::ResourceType::from(resource_type.as_str()))
                        .set_tags(Some(ec2_tags(spec.get("Tags").unwrap_or(&Value::Null))))
                        .build(),
                );
            }
        }
    }
    builder.build()
}

fn instance_info(instance: &ec2::Instance) -> InstanceInfo {
    InstanceInfo {
        instance_id: instance.instance_id().unwrap_or_default().to_string(),
        state: instance
            .state()
            .and_then(|s| s.name())
            .map(|n| n.as_str().to_string())
            .unwrap_or_else(|| "unknown".to_string()),
        instance_type: instance.instance_type().map(|t| t.as_str().to_string()),
        availability_zone: instance
            .placement()
            .and_then(|p| p.availability_zone())
            .map(|z| z.to_string()),
        private_ip: instance.private_ip_address().map(|ip| ip.to_string()),
        public_ip: instance.public_ip_address().map(|ip| ip.to_string()),
        launch_time: instance
            .launch_time()
            .and_then(|t| t.to_millis().ok())
            .and_then(|ms| DateTime::from_timestamp_millis(ms)),
        lifecycle: instance.instance_lifecycle().map(|l| l.as_str().to_string()),
        tags: instance
            .tags()
            .iter()
            .filter_map(|t| {
                t.key().and_then(|k| t.value().map(|v| (k.to_string(), v.to_string())))
            })
            .collect(),
    }
}

#[async_trait]
impl AwsApi for SdkAwsApi {
    async fn create_fleet(&self, config: Value) -> Result<FleetCreationResult> {
        let payload = config.to_string().len();
        self.call("ec2", "CreateFleet", Some(payload), async {
            let mut request = self.ec2().create_fleet();
            if let Some(fleet_type) = json_str(&config, "Type") {
                request = request.r#type(ec2::FleetType::from(fleet_type.as_str()));
            }
            if let Some(capacity) = config.get("TargetCapacitySpecification") {
                let mut cb = ec2::TargetCapacitySpecificationRequest::builder();
                if let Some(total) = json_i32(capacity, "TotalTargetCapacity") {
                    cb = cb.total_target_capacity(total);
                }
                if let Some(on_demand) = json_i32(capacity, "OnDemandTargetCapacity") {
                    cb = cb.on_demand_target_capacity(on_demand);
                }
                if let Some(spot) = json_i32(capacity, "SpotTargetCapacity") {
                    cb = cb.spot_target_capacity(spot);
                }
                if let Some(default_type) = json_str(capacity, "DefaultTargetCapacityType") {
                    cb = cb.default_target_capacity_type(ec2::DefaultTargetCapacityType::from(
                        default_type.as_str(),
                    ));
                }
                request = request.target_capacity_specification(cb.build());
            }
            for ltc in fleet_launch_template_configs(&config) {
                request = request.launch_template_configs(ltc);
            }
            if let Some(spot) = config.get("SpotOptions") {
                let mut sb = ec2::SpotOptionsRequest::builder();
                if let Some(strategy) = json_str(spot, "AllocationStrategy") {
                    sb = sb.allocation_strategy(ec2::SpotAllocationStrategy::from(
                        strategy.as_str(),
                    ));
                }
                if let Some(pools) = json_i32(spot, "InstancePoolsToUseCount") {
                    sb = sb.instance_pools_to_use_count(pools);
                }
                request = request.spot_options(sb.build());
            }
            if let Some(on_demand) = config.get("OnDemandOptions") {
                let mut ob = ec2::OnDemandOptionsRequest::builder();
                if let Some(strategy) = json_str(on_demand, "AllocationStrategy") {
                    ob = ob.allocation_strategy(ec2::FleetOnDemandAllocationStrategy::from(
                        strategy.as_str(),
                    ));
                }
                request = request.on_demand_options(ob.build());
            }
            for spec in ec2_tag_specifications(&config) {
                request = request.tag_specifications(spec);
            }

            let response =
                request.send().await.map_err(|e| map_sdk_error("CreateFleet", e))?;

            let fleet_id = response
                .fleet_id()
                .ok_or_else(|| BrokerError::infrastructure("CreateFleet returned no fleet id"))?
                .to_string();
            let instance_ids = response
                .instances()
                .iter()
                .flat_map(|i| i.instance_ids().iter().map(|id| id.to_string()))
                .collect();
            let errors = response
                .errors()
                .iter()
                .map(|e| {
                    format!(
                        "{}: {}",
                        e.error_code().unwrap_or("Unknown"),
                        e.error_message().unwrap_or("no message")
                    )
                })
                .collect();
            Ok(FleetCreationResult { fleet_id, instance_ids, errors })
        })
        .await
    }

    async fn describe_fleet_instances(&self, fleet_id: &str) -> Result<Vec<String>> {
        self.call("ec2", "DescribeFleetInstances", None, async {
            let response = self
                .ec2()
                .describe_fleet_instances()
                .fleet_id(fleet_id)
                .send()
                .await
                .map_err(|e| map_sdk_error("DescribeFleetInstances", e))?;
            Ok(response
                .active_instances()
                .iter()
                .filter_map(|i| i.instance_id().map(|id| id.to_string()))
                .collect())
        })
        .await
    }

    async fn delete_fleet(&self, fleet_id: &str, terminate_instances: bool) -> Result<()> {
        self.call("ec2", "DeleteFleets", None, async {
            self.ec2()
                .delete_fleets()
                .fleet_ids(fleet_id)
                .terminate_instances(terminate_instances)
                .send()
                .await
                .map_err(|e| map_sdk_error("DeleteFleets", e))?;
            Ok(())
        })
        .await
    }

    async fn request_spot_fleet(&self, config: Value) -> Result<String> {
        let payload = config.to_string().len();
        self.call("ec2", "RequestSpotFleet", Some(payload), async {
            let mut data = ec2::SpotFleetRequestConfigData::builder();
            if let Some(role) = json_str(&config, "IamFleetRole") {
                data = data.iam_fleet_role(role);
            }
            if let Some(capacity) = json_i32(&config, "TargetCapacity") {
                data = data.target_capacity(capacity);
            }
            if let Some(strategy) = json_str(&config, "AllocationStrategy") {
                data = data.allocation_strategy(ec2::AllocationStrategy::from(strategy.as_str()));
            }
            if let Some(fleet_type) = json_str(&config, "Type") {
                data = data.set_type(Some(ec2::FleetType::from(fleet_type.as_str())));
            }
            if let Some(price) = json_str(&config, "SpotPrice") {
                data = data.spot_price(price);
            }
            if let Some(pools) = json_i32(&config, "InstancePoolsToUseCount") {
                data = data.instance_pools_to_use_count(pools);
            }
            if let Some(on_demand) = json_i32(&config, "OnDemandTargetCapacity") {
                data = data.on_demand_target_capacity(on_demand);
            }
            if let Some(configs) = config.get("LaunchTemplateConfigs").and_then(|v| v.as_array()) {
                for entry in configs {
                    let mut cb = ec2::LaunchTemplateConfig::builder();
                    if let Some(spec) = entry.get("LaunchTemplateSpecification") {
                        let mut sb = ec2::FleetLaunchTemplateSpecification::builder();
                        if let Some(id) = json_str(spec, "LaunchTemplateId") {
                            sb = sb.launch_template_id(id);
                        }
                        if let Some(version) = json_str(spec, "Version") {
                            sb = sb.version(version);
                        }
                        cb = cb.launch_template_specification(sb.build());
                    }
                    if let Some(overrides) = entry.get("Overrides").and_then(|v| v.as_array()) {
                        for o in overrides {
                            let mut ob = ec2::LaunchTemplateOverrides::builder();
                            if let Some(instance_type) = json_str(o, "InstanceType") {
                                ob = ob
                                    .instance_type(ec2::InstanceType::from(instance_type.as_str()));
                            }
                            if let Some(subnet) = json_str(o, "SubnetId") {
                                ob = ob.subnet_id(subnet);
                            }
                            if let Some(weight) = json_f64(o, "WeightedCapacity") {
                                ob = ob.weighted_capacity(weight);
                            }
                            cb = cb.overrides(ob.build());
                        }
                    }
                    data = data.launch_template_configs(cb.build());
                }
            }

            let response = self
                .ec2()
                .request_spot_fleet()
                .spot_fleet_request_config(data.build())
                .send()
                .await
                .map_err(|e| map_sdk_error("RequestSpotFleet", e))?;
            response
                .spot_fleet_request_id()
                .map(|id| id.to_string())
                .ok_or_else(|| {
                    BrokerError::infrastructure("RequestSpotFleet returned no request id")
                })
        })
        .await
    }

    async fn describe_spot_fleet_instances(
        &self,
        spot_fleet_request_id: &str,
    ) -> Result<Vec<String>> {
        self.call("ec2", "DescribeSpotFleetInstances", None, async {
            let response = self
                .ec2()
                .describe_spot_fleet_instances()
                .spot_fleet_request_id(spot_fleet_request_id)
                .send()
                .await
                .map_err(|e| map_sdk_error("DescribeSpotFleetInstances", e))?;
            Ok(response
                .active_instances()
                .iter()
                .filter_map(|i| i.instance_id().map(|id| id.to_string()))
                .collect())
        })
        .await
    }

    async fn cancel_spot_fleet_requests(
        &self,
        request_ids: Vec<String>,
        terminate_instances: bool,
    ) -> Result<()> {
        self.call("ec2", "CancelSpotFleetRequests", None, async {
            self.ec2()
                .cancel_spot_fleet_requests()
                .set_spot_fleet_request_ids(Some(request_ids))
                .terminate_instances(terminate_instances)
                .send()
                .await
                .map_err(|e| map_sdk_error("CancelSpotFleetRequests", e))?;
            Ok(())
        })
        .await
    }

    async fn run_instances(&self, config: Value) -> Result<ReservationResult> {
        let payload = config.to_string().len();
        self.call("ec2", "RunInstances", Some(payload), async {
            let mut request = self.ec2().run_instances();
            if let Some(image_id) = json_str(&config, "ImageId") {
                request = request.image_id(image_id);
            }
            if let Some(instance_type) = json_str(&config, "InstanceType") {
                request = request.instance_type(ec2::InstanceType::from(instance_type.as_str()));
            }
            if let Some(min) = json_i32(&config, "MinCount") {
                request = request.min_count(min);
            }
            if let Some(max) = json_i32(&config, "MaxCount") {
                request = request.max_count(max);
            }
            if let Some(key_name) = json_str(&config, "KeyName") {
                request = request.key_name(key_name);
            }
            if let Some(subnet) = json_str(&config, "SubnetId") {
                request = request.subnet_id(subnet);
            }
            if let Some(user_data) = json_str(&config, "UserData") {
                request = request.user_data(user_data);
            }
            if let Some(groups) = config.get("SecurityGroupIds").and_then(|v| v.as_array()) {
                for group in groups.iter().filter_map(|g| g.as_str()) {
                    request = request.security_group_ids(group);
                }
            }
            if let Some(profile) = config.get("IamInstanceProfile") {
                let mut pb = ec2::IamInstanceProfileSpecification::builder();
                if let Some(name) = json_str(profile, "Name") {
                    pb = pb.name(name);
                }
                if let Some(arn) = json_str(profile, "Arn") {
                    pb = pb.arn(arn);
                }
                request = request.iam_instance_profile(pb.build());
            }
            if let Some(market) = config.get("InstanceMarketOptions") {
                if json_str(market, "MarketType").as_deref() == Some("spot") {
                    request = request.instance_market_options(
                        ec2::InstanceMarketOptionsRequest::builder()
                            .market_type(ec2::MarketType::Spot)
                            .build(),
                    );
                }
            }
            for spec in ec2_tag_specifications(&config) {
                request = request.tag_specifications(spec);
            }

            let response =
                request.send().await.map_err(|e| map_sdk_error("RunInstances", e))?;
            let reservation_id = response
                .reservation_id()
                .ok_or_else(|| {
                    BrokerError::infrastructure("RunInstances returned no reservation id")
                })?
                .to_string();
            let instances = response.instances().iter().map(instance_info).collect();
            Ok(ReservationResult { reservation_id, instances })
        })
        .await
    }

    async fn terminate_instances(&self, instance_ids: Vec<String>) -> Result<()> {
        self.call("ec2", "TerminateInstances", None, async {
            self.ec2()
                .terminate_instances()
                .set_instance_ids(Some(instance_ids))
                .send()
                .await
                .map_err(|e| map_sdk_error("TerminateInstances", e))?;
            Ok(())
        })
        .await
    }

    async fn describe_instances(&self, instance_ids: Vec<String>) -> Result<Vec<InstanceInfo>> {
        self.call("ec2", "DescribeInstances", None, async {
            let mut paginator = self
                .ec2()
                .describe_instances()
                .set_instance_ids(Some(instance_ids))
                .into_paginator()
                .send();
            let mut instances = Vec::new();
            while let Some(page) = paginator.next().await {
                let page = page.map_err(|e| map_sdk_error("DescribeInstances", e))?;
                for reservation in page.reservations() {
                    instances.extend(reservation.instances().iter().map(instance_info));
                }
            }
            Ok(instances)
        })
        .await
    }

    async fn create_tags(
        &self,
        resource_ids: Vec<String>,
        tags: HashMap<String, String>,
    ) -> Result<()> {
        self.call("ec2", "CreateTags", None, async {
            let mut request = self.ec2().create_tags().set_resources(Some(resource_ids));
            for (key, value) in tags {
                request = request.tags(ec2::Tag::builder().key(key).value(value).build());
            }
            request.send().await.map_err(|e| map_sdk_error("CreateTags", e))?;
            Ok(())
        })
        .await
    }

    async fn create_auto_scaling_group(&self, config: Value) -> Result<()> {
        let payload = config.to_string().len();
        self.call("autoscaling", "CreateAutoScalingGroup", Some(payload), async {
            let mut request = self.autoscaling().create_auto_scaling_group();
            if let Some(name) = json_str(&config, "AutoScalingGroupName") {
                request = request.auto_scaling_group_name(name);
            }
            if let Some(lt) = config.get("LaunchTemplate") {
                let mut lb = aws_sdk_autoscaling::types::LaunchTemplateSpecification::builder();
                if let Some(id) = json_str(lt, "LaunchTemplateId") {
                    lb = lb.launch_template_id(id);
                }
                if let Some(version) = json_str(lt, "Version") {
                    lb = lb.version(version);
                }
                request = request.launch_template(lb.build());
            }
            if let Some(min) = json_i32(&config, "MinSize") {
                request = request.min_size(min);
            }
            if let Some(max) = json_i32(&config, "MaxSize") {
                request = request.max_size(max);
            }
            if let Some(desired) = json_i32(&config, "DesiredCapacity") {
                request = request.desired_capacity(desired);
            }
            if let Some(cooldown) = json_i32(&config, "DefaultCooldown") {
                request = request.default_cooldown(cooldown);
            }
            if let Some(check) = json_str(&config, "HealthCheckType") {
                request = request.health_check_type(check);
            }
            if let Some(grace) = json_i32(&config, "HealthCheckGracePeriod") {
                request = request.health_check_grace_period(grace);
            }
            if let Some(subnets) = json_str(&config, "VPCZoneIdentifier") {
                request = request.vpc_zone_identifier(subnets);
            }
            if let Some(context) = json_str(&config, "Context") {
                request = request.context(context);
            }
            request
                .send()
                .await
                .map_err(|e| map_sdk_error("CreateAutoScalingGroup", e))?;
            Ok(())
        })
        .await
    }

    async fn describe_auto_scaling_group(&self, name: &str) -> Result<Option<AsgInfo>> {
        self.call("autoscaling", "DescribeAutoScalingGroups", None, async {
            let response = self
                .autoscaling()
                .describe_auto_scaling_groups()
                .auto_scaling_group_names(name)
                .send()
                .await
                .map_err(|e| map_sdk_error("DescribeAutoScalingGroups", e))?;
            Ok(response.auto_scaling_groups().first().map(|asg| AsgInfo {
                name: asg.auto_scaling_group_name().unwrap_or_default().to_string(),
                desired_capacity: asg.desired_capacity().unwrap_or(0),
                min_size: asg.min_size().unwrap_or(0),
                max_size: asg.max_size().unwrap_or(0),
                instance_ids: asg
                    .instances()
                    .iter()
                    .filter_map(|i| i.instance_id().map(|id| id.to_string()))
                    .collect(),
            }))
        })
        .await
    }

    async fn update_auto_scaling_group(
        &self,
        name: &str,
        desired_capacity: i32,
        min_size: Option<i32>,
    ) -> Result<()> {
        self.call("autoscaling", "UpdateAutoScalingGroup", None, async {
            let mut request = self
                .autoscaling()
                .update_auto_scaling_group()
                .auto_scaling_group_name(name)
                .desired_capacity(desired_capacity);
            if let Some(min) = min_size {
                request = request.min_size(min);
            }
            request
                .send()
                .await
                .map_err(|e| map_sdk_error("UpdateAutoScalingGroup", e))?;
            Ok(())
        })
        .await
    }

    async fn detach_instances(
        &self,
        name: &str,
        instance_ids: Vec<String>,
        decrement_desired_capacity: bool,
    ) -> Result<()> {
        self.call("autoscaling", "DetachInstances", None, async {
            self.autoscaling()
                .detach_instances()
                .auto_scaling_group_name(name)
                .set_instance_ids(Some(instance_ids))
                .should_decrement_desired_capacity(decrement_desired_capacity)
                .send()
                .await
                .map_err(|e| map_sdk_error("DetachInstances", e))?;
            Ok(())
        })
        .await
    }

    async fn delete_auto_scaling_group(&self, name: &str, force_delete: bool) -> Result<()> {
        self.call("autoscaling", "DeleteAutoScalingGroup", None, async {
            self.autoscaling()
                .delete_auto_scaling_group()
                .auto_scaling_group_name(name)
                .force_delete(force_delete)
                .send()
                .await
                .map_err(|e| map_sdk_error("DeleteAutoScalingGroup", e))?;
            Ok(())
        })
        .await
    }

    async fn create_or_update_asg_tags(&self, tags: Vec<AsgTag>) -> Result<()> {
        self.call("autoscaling", "CreateOrUpdateTags", None, async {
            let mut request = self.autoscaling().create_or_update_tags();
            for tag in tags {
                let tag = aws_sdk_autoscaling::types::Tag::builder()
                    .key(tag.key)
                    .value(tag.value)
                    .propagate_at_launch(tag.propagate_at_launch)
                    .resource_id(tag.resource_id)
                    .resource_type("auto-scaling-group")
                    .build()
                    .map_err(|e| BrokerError::Validation {
                        field: "tags".to_string(),
                        reason: format!("invalid ASG tag: {e}"),
                    })?;
                request = request.tags(tag);
            }
            request.send().await.map_err(|e| map_sdk_error("CreateOrUpdateTags", e))?;
            Ok(())
        })
        .await
    }

    async fn create_launch_template(
        &self,
        name: &str,
        data: Value,
        tags: HashMap<String, String>,
    ) -> Result<LaunchTemplateInfo> {
        let payload = data.to_string().len();
        self.call("ec2", "CreateLaunchTemplate", Some(payload), async {
            let mut request = self
                .ec2()
                .create_launch_template()
                .launch_template_name(name)
                .launch_template_data(launch_template_data(&data));
            if !tags.is_empty() {
                let mut spec = ec2::TagSpecification::builder()
                    .resource_type(ec2::ResourceType::LaunchTemplate);
                for (key, value) in tags {
                    spec = spec.tags(ec2::Tag::builder().key(key).value(value).build());
                }
                request = request.tag_specifications(spec.build());
            }
            let response = request
                .send()
                .await
                .map_err(|e| map_sdk_error("CreateLaunchTemplate", e))?;
            let lt = response.launch_template().ok_or_else(|| {
                BrokerError::infrastructure("CreateLaunchTemplate returned no template")
            })?;
            Ok(LaunchTemplateInfo {
                template_id: lt.launch_template_id().unwrap_or_default().to_string(),
                name: lt.launch_template_name().unwrap_or_default().to_string(),
                latest_version: lt.latest_version_number().unwrap_or(1) as u64,
                default_version: lt.default_version_number().unwrap_or(1) as u64,
            })
        })
        .await
    }

    async fn describe_launch_template_by_name(
        &self,
        name: &str,
    ) -> Result<Option<LaunchTemplateInfo>> {
        self.call("ec2", "DescribeLaunchTemplates", None, async {
            let result = self
                .ec2()
                .describe_launch_templates()
                .launch_template_names(name)
                .send()
                .await;
            match result {
                Ok(response) => Ok(response.launch_templates().first().map(|lt| {
                    LaunchTemplateInfo {
                        template_id: lt.launch_template_id().unwrap_or_default().to_string(),
                        name: lt.launch_template_name().unwrap_or_default().to_string(),
                        latest_version: lt.latest_version_number().unwrap_or(1) as u64,
                        default_version: lt.default_version_number().unwrap_or(1) as u64,
                    }
                })),
                Err(e) if e.code() == Some("InvalidLaunchTemplateName.NotFoundException") => {
                    Ok(None)
                }
                Err(e) => Err(map_sdk_error("DescribeLaunchTemplates", e)),
            }
        })
        .await
    }

    async fn create_launch_template_version(
        &self,
        template_id: &str,
        data: Value,
    ) -> Result<u64> {
        let payload = data.to_string().len();
        self.call("ec2", "CreateLaunchTemplateVersion", Some(payload), async {
            let mut request = self
                .ec2()
                .create_launch_template_version()
                .launch_template_id(template_id)
                .launch_template_data(launch_template_data(&data));
            if let Some(description) = json_str(&data, "VersionDescription") {
                request = request.version_description(description);
            }
            let response = request
                .send()
                .await
                .map_err(|e| map_sdk_error("CreateLaunchTemplateVersion", e))?;
            Ok(response
                .launch_template_version()
                .and_then(|v| v.version_number())
                .unwrap_or(1) as u64)
        })
        .await
    }

    async fn delete_launch_template_versions(
        &self,
        template_id: &str,
        versions: Vec<u64>,
    ) -> Result<()> {
        self.call("ec2", "DeleteLaunchTemplateVersions", None, async {
            self.ec2()
                .delete_launch_template_versions()
                .launch_template_id(template_id)
                .set_versions(Some(versions.iter().map(|v| v.to_string()).collect()))
                .send()
                .await
                .map_err(|e| map_sdk_error("DeleteLaunchTemplateVersions", e))?;
            Ok(())
        })
        .await
    }

    async fn ping(&self) -> Result<()> {
        self.call("ec2", "DescribeAvailabilityZones", None, async {
            self.ec2()
                .describe_availability_zones()
                .send()
                .await
                .map_err(|e| map_sdk_error("DescribeAvailabilityZones", e))?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stringified_numbers_are_accepted() {
        let v = json!({"TotalTargetCapacity": "5", "MinSize": 0});
        assert_eq!(json_i32(&v, "TotalTargetCapacity"), Some(5));
        assert_eq!(json_i32(&v, "MinSize"), Some(0));
        assert_eq!(json_i32(&v, "Missing"), None);
    }

    #[test]
    fn classification_covers_the_taxonomy() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "x");
        let err = classify_aws_error("CreateFleet", "RequestLimitExceeded", "slow down", io);
        assert_eq!(err.error_code(), "THROTTLING_ERROR");

        let io = std::io::Error::new(std::io::ErrorKind::Other, "x");
        let err =
            classify_aws_error("RunInstances", "InsufficientInstanceCapacity", "no t3", io);
        assert_eq!(err.error_code(), "INSUFFICIENT_CAPACITY");

        let io = std::io::Error::new(std::io::ErrorKind::Other, "x");
        let err = classify_aws_error("CreateFleet", "UnauthorizedOperation", "denied", io);
        assert_eq!(err.error_code(), "AUTHORIZATION_ERROR");

        let io = std::io::Error::new(std::io::ErrorKind::Other, "x");
        let err = classify_aws_error("CreateFleet", "SomethingElse", "boom", io);
        assert_eq!(err.error_code(), "INFRASTRUCTURE_ERROR");
    }

    #[test]
    fn launch_template_data_maps_core_fields() {
        let data = launch_template_data(&json!({
            "ImageId": "ami-1",
            "InstanceType": "t3.micro",
            "KeyName": "ops",
            "SecurityGroupIds": ["sg-a", "sg-b"],
            "Monitoring": {"Enabled": true}
        }));
        assert_eq!(data.image_id(), Some("ami-1"));
        assert_eq!(data.key_name(), Some("ops"));
        assert_eq!(data.security_group_ids().len(), 2);
        assert_eq!(data.monitoring().and_then(|m| m.enabled()), Some(true));
    }
}

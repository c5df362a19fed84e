//! Template aggregate
//!
//! A template describes what to provision: image, instance types, network
//! placement and the provider API used to acquire capacity. The core value
//! is provider-neutral; AWS-only fields live in a composed
//! `AwsTemplateExtensions` rather than a subclass.
//!
//! Templates are immutable DTOs: loading or reloading configuration produces
//! a new set, never an in-place mutation.

use crate::error::{BrokerError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Concrete provisioning verb within a provider type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderApi {
    #[serde(rename = "EC2Fleet")]
    Ec2Fleet,
    SpotFleet,
    #[serde(rename = "ASG")]
    Asg,
    RunInstances,
}

impl ProviderApi {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderApi::Ec2Fleet => "EC2Fleet",
            ProviderApi::SpotFleet => "SpotFleet",
            ProviderApi::Asg => "ASG",
            ProviderApi::RunInstances => "RunInstances",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "EC2Fleet" => Ok(ProviderApi::Ec2Fleet),
            "SpotFleet" => Ok(ProviderApi::SpotFleet),
            "ASG" => Ok(ProviderApi::Asg),
            "RunInstances" => Ok(ProviderApi::RunInstances),
            other => Err(BrokerError::Validation {
                field: "provider_api".to_string(),
                reason: format!("unknown provider API: {other}"),
            }),
        }
    }

    /// Hard cap on machines per request for this API.
    pub fn max_machines_per_request(&self) -> u32 {
        match self {
            ProviderApi::Ec2Fleet | ProviderApi::Asg | ProviderApi::SpotFleet => 1000,
            ProviderApi::RunInstances => 50,
        }
    }
}

impl std::fmt::Display for ProviderApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceType {
    Ondemand,
    Spot,
}

impl PriceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriceType::Ondemand => "ondemand",
            PriceType::Spot => "spot",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FleetType {
    Instant,
    Request,
    Maintain,
}

impl FleetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FleetType::Instant => "instant",
            FleetType::Request => "request",
            FleetType::Maintain => "maintain",
        }
    }
}

/// Provider-neutral allocation strategy with explicit per-API vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStrategy {
    LowestPrice,
    Diversified,
    CapacityOptimized,
    CapacityOptimizedPrioritized,
    PriceCapacityOptimized,
}

impl AllocationStrategy {
    /// EC2Fleet spelling (kebab-case).
    pub fn for_ec2_fleet(&self) -> &'static str {
        match self {
            AllocationStrategy::LowestPrice => "lowest-price",
            AllocationStrategy::Diversified => "diversified",
            AllocationStrategy::CapacityOptimized => "capacity-optimized",
            AllocationStrategy::CapacityOptimizedPrioritized => "capacity-optimized-prioritized",
            AllocationStrategy::PriceCapacityOptimized => "price-capacity-optimized",
        }
    }

    /// SpotFleet spelling (camelCase).
    pub fn for_spot_fleet(&self) -> &'static str {
        match self {
            AllocationStrategy::LowestPrice => "lowestPrice",
            AllocationStrategy::Diversified => "diversified",
            AllocationStrategy::CapacityOptimized => "capacityOptimized",
            AllocationStrategy::CapacityOptimizedPrioritized => "capacityOptimizedPrioritized",
            AllocationStrategy::PriceCapacityOptimized => "priceCapacityOptimized",
        }
    }

    /// ASG spelling (snake_case).
    pub fn for_asg(&self) -> &'static str {
        match self {
            AllocationStrategy::LowestPrice => "lowest_price",
            AllocationStrategy::Diversified => "diversified",
            AllocationStrategy::CapacityOptimized => "capacity_optimized",
            AllocationStrategy::CapacityOptimizedPrioritized => "capacity_optimized_prioritized",
            AllocationStrategy::PriceCapacityOptimized => "price_capacity_optimized",
        }
    }

    pub fn for_api(&self, api: ProviderApi) -> &'static str {
        match api {
            ProviderApi::Ec2Fleet | ProviderApi::RunInstances => self.for_ec2_fleet(),
            ProviderApi::SpotFleet => self.for_spot_fleet(),
            ProviderApi::Asg => self.for_asg(),
        }
    }
}

/// AWS-only template fields, composed into the core template.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AwsTemplateExtensions {
    pub fleet_type: Option<FleetType>,
    /// IAM role ARN; required by SpotFleet.
    pub fleet_role: Option<String>,
    pub key_name: Option<String>,
    pub user_data: Option<String>,
    pub root_device_volume_size: Option<i32>,
    pub volume_type: Option<String>,
    pub iops: Option<i32>,
    pub instance_profile: Option<String>,
    pub percent_on_demand: Option<u8>,
    pub pools_count: Option<i32>,
    pub launch_template_id: Option<String>,
    pub launch_template_version: Option<String>,
    /// Attribute-based instance selection requirements.
    pub instance_requirements: Option<serde_json::Value>,
    pub assign_public_ip: Option<bool>,
    /// ASG Context field.
    pub context: Option<String>,
    pub launch_template_spec: Option<serde_json::Value>,
    pub launch_template_spec_file: Option<String>,
    pub provider_api_spec: Option<serde_json::Value>,
    pub provider_api_spec_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub template_id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub provider_api: ProviderApi,
    pub image_id: String,
    #[serde(default)]
    pub instance_type: Option<String>,
    /// Instance type -> capacity weight.
    #[serde(default)]
    pub instance_types: HashMap<String, u32>,
    pub subnet_ids: Vec<String>,
    #[serde(default)]
    pub security_group_ids: Vec<String>,
    #[serde(default = "default_max_instances")]
    pub max_instances: u32,
    #[serde(default = "default_price_type")]
    pub price_type: PriceType,
    #[serde(default)]
    pub allocation_strategy: Option<AllocationStrategy>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    /// Pin to a named provider instance.
    #[serde(default)]
    pub provider_name: Option<String>,
    /// Constrain to a provider type, any instance.
    #[serde(default)]
    pub provider_type: Option<String>,
    #[serde(flatten)]
    pub aws: AwsTemplateExtensions,
}

fn default_max_instances() -> u32 {
    1
}

fn default_price_type() -> PriceType {
    PriceType::Ondemand
}

impl Template {
    /// Deserialize a merged template document and validate its invariants.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let template: Template = serde_json::from_value(value).map_err(|e| {
            BrokerError::Validation {
                field: "template".to_string(),
                reason: format!("malformed template document: {e}"),
            }
        })?;
        template.validate()?;
        Ok(template)
    }

    pub fn validate(&self) -> Result<()> {
        if self.image_id.is_empty() {
            return Err(self.field_error("image_id", "must be set"));
        }
        if self.subnet_ids.is_empty() {
            return Err(self.field_error("subnet_ids", "must not be empty"));
        }
        if self.max_instances == 0 {
            return Err(self.field_error("max_instances", "must be at least 1"));
        }
        if let Some(percent) = self.aws.percent_on_demand {
            if percent > 100 {
                return Err(self.field_error("percent_on_demand", "must be within [0, 100]"));
            }
        }
        if self.aws.launch_template_spec.is_some() && self.aws.launch_template_spec_file.is_some() {
            return Err(self.field_error(
                "launch_template_spec",
                "launch_template_spec and launch_template_spec_file are mutually exclusive",
            ));
        }
        if self.aws.provider_api_spec.is_some() && self.aws.provider_api_spec_file.is_some() {
            return Err(self.field_error(
                "provider_api_spec",
                "provider_api_spec and provider_api_spec_file are mutually exclusive",
            ));
        }
        if let Some(version) = &self.aws.launch_template_version {
            validate_launch_template_version(version)
                .map_err(|reason| self.field_error("launch_template_version", &reason))?;
        }
        if self.provider_api == ProviderApi::SpotFleet
            && self.aws.fleet_type == Some(FleetType::Instant)
        {
            return Err(self.field_error("fleet_type", "SpotFleet does not accept 'instant'"));
        }
        Ok(())
    }

    fn field_error(&self, field: &str, reason: &str) -> BrokerError {
        BrokerError::Validation {
            field: field.to_string(),
            reason: format!("template '{}': {reason}", self.template_id),
        }
    }

    /// Fleet type with per-API defaulting: `instant` for EC2Fleet,
    /// `request` for SpotFleet.
    pub fn effective_fleet_type(&self) -> Option<FleetType> {
        match (self.aws.fleet_type, self.provider_api) {
            (Some(t), _) => Some(t),
            (None, ProviderApi::Ec2Fleet) => Some(FleetType::Instant),
            (None, ProviderApi::SpotFleet) => Some(FleetType::Request),
            _ => None,
        }
    }

    /// Instance types with weights; falls back to the single `instance_type`
    /// with weight 1.
    pub fn weighted_instance_types(&self) -> Vec<(String, u32)> {
        if !self.instance_types.is_empty() {
            let mut entries: Vec<_> =
                self.instance_types.iter().map(|(t, w)| (t.clone(), *w)).collect();
            entries.sort();
            return entries;
        }
        self.instance_type.iter().map(|t| (t.clone(), 1)).collect()
    }

    pub fn has_native_provider_api_spec(&self) -> bool {
        self.aws.provider_api_spec.is_some() || self.aws.provider_api_spec_file.is_some()
    }

    pub fn has_native_launch_template_spec(&self) -> bool {
        self.aws.launch_template_spec.is_some() || self.aws.launch_template_spec_file.is_some()
    }
}

/// `$Latest`, `$Default` or a positive integer string.
pub fn validate_launch_template_version(version: &str) -> std::result::Result<(), String> {
    if version == "$Latest" || version == "$Default" {
        return Ok(());
    }
    match version.parse::<u64>() {
        Ok(n) if n >= 1 => Ok(()),
        _ => Err(format!(
            "expected $Latest, $Default or a positive integer, got '{version}'"
        )),
    }
}

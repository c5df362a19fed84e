//! Provider capability validation
//!
//! Validates a (template, provider instance) pairing before a request is
//! dispatched. Three levels: STRICT turns warnings into errors, LENIENT
//! keeps them as warnings, BASIC reports only critical errors and clears
//! warnings.

use crate::config::ProviderInstanceConfig;
use crate::domain::{FleetType, PriceType, ProviderApi, Template};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationLevel {
    Strict,
    Lenient,
    Basic,
}

#[derive(Debug, Clone)]
pub struct CapabilityValidation {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

pub struct ProviderCapabilityService;

impl ProviderCapabilityService {
    pub fn new() -> Self {
        Self
    }

    pub fn validate_template_requirements(
        &self,
        template: &Template,
        instance: &ProviderInstanceConfig,
        requested_count: Option<u32>,
        level: ValidationLevel,
    ) -> CapabilityValidation {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        let api = template.provider_api;
        if !instance.capabilities.iter().any(|c| c == api.as_str()) {
            errors.push(format!(
                "provider instance '{}' does not declare capability '{}'",
                instance.name, api
            ));
        }

        if template.price_type == PriceType::Spot && api == ProviderApi::RunInstances {
            errors.push("RunInstances does not support spot instances".to_string());
        }

        if let Some(count) = requested_count {
            let cap = api.max_machines_per_request();
            if count > cap {
                errors.push(format!(
                    "requested {count} machines exceeds the {api} cap of {cap}"
                ));
            }
        }

        if template.effective_fleet_type() == Some(FleetType::Instant)
            && api == ProviderApi::SpotFleet
        {
            errors.push("SpotFleet does not accept fleet type 'instant'".to_string());
        }

        if template.aws.percent_on_demand.is_some() && api != ProviderApi::Ec2Fleet {
            warnings.push(format!(
                "percent_on_demand is only honored by EC2Fleet, ignored for {api}"
            ));
        }

        if template.allocation_strategy.is_some() && api == ProviderApi::RunInstances {
            warnings.push("allocation_strategy has no effect on RunInstances".to_string());
        }

        if api == ProviderApi::SpotFleet && template.aws.fleet_role.is_none() {
            errors.push("SpotFleet requires fleet_role".to_string());
        }

        match level {
            ValidationLevel::Strict => {
                errors.extend(warnings.drain(..));
            }
            ValidationLevel::Lenient => {}
            ValidationLevel::Basic => {
                warnings.clear();
            }
        }

        CapabilityValidation { is_valid: errors.is_empty(), errors, warnings }
    }
}

impl Default for ProviderCapabilityService {
    fn default() -> Self {
        Self::new()
    }
}

//! Provider instance selection
//!
//! Picks a provider instance for a template using a fixed precedence:
//! explicit instance name, then provider type plus the configured selection
//! policy, then any instance supporting the template's provider API, then
//! the configured default, then the first enabled instance.

use crate::config::{BrokerConfig, ProviderInstanceConfig, SelectionPolicy};
use crate::domain::Template;
use crate::error::{BrokerError, Result};
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone)]
pub struct SelectionResult {
    pub provider_type: String,
    pub provider_instance: String,
    pub selection_reason: String,
    pub confidence: f64,
    /// Other enabled instances that could have served the template.
    pub alternatives: Vec<String>,
}

pub struct ProviderSelectionService {
    round_robin_cursor: AtomicUsize,
}

impl ProviderSelectionService {
    pub fn new() -> Self {
        Self { round_robin_cursor: AtomicUsize::new(0) }
    }

    pub fn select(&self, config: &BrokerConfig, template: &Template) -> Result<SelectionResult> {
        // 1. Explicit instance pin.
        if let Some(name) = &template.provider_name {
            let instance = config.find_provider_instance(name).ok_or_else(|| {
                BrokerError::Validation {
                    field: "provider_name".to_string(),
                    reason: format!("unknown provider instance '{name}'"),
                }
            })?;
            if !instance.enabled {
                return Err(BrokerError::Validation {
                    field: "provider_name".to_string(),
                    reason: format!("provider instance '{name}' is disabled"),
                });
            }
            return Ok(self.result(
                config,
                instance,
                format!("template pins provider instance '{name}'"),
                1.0,
            ));
        }

        // 2. Provider type plus selection policy.
        if let Some(provider_type) = &template.provider_type {
            let candidates: Vec<_> = config
                .enabled_provider_instances()
                .filter(|p| &p.provider_type == provider_type)
                .collect();
            if candidates.is_empty() {
                return Err(BrokerError::Validation {
                    field: "provider_type".to_string(),
                    reason: format!("no enabled provider instance of type '{provider_type}'"),
                });
            }
            let chosen = self.apply_policy(config.provider.selection_policy, &candidates, template);
            return Ok(self.result(
                config,
                chosen,
                format!(
                    "selection policy {:?} over provider type '{provider_type}'",
                    config.provider.selection_policy
                ),
                0.9,
            ));
        }

        // 3. Any instance declaring support for the template's API.
        let api = template.provider_api.as_str();
        if let Some(instance) = config
            .enabled_provider_instances()
            .find(|p| p.capabilities.iter().any(|c| c == api))
        {
            return Ok(self.result(
                config,
                instance,
                format!("instance declares support for provider API '{api}'"),
                0.7,
            ));
        }

        // 4. Configured default, then first enabled.
        if let Some(default_name) = &config.provider.active_provider {
            if let Some(instance) = config
                .find_provider_instance(default_name)
                .filter(|p| p.enabled)
            {
                return Ok(self.result(
                    config,
                    instance,
                    format!("configured default provider instance '{default_name}'"),
                    0.5,
                ));
            }
        }

        let instance = config.enabled_provider_instances().next().ok_or_else(|| {
            BrokerError::Configuration {
                message: "no enabled provider instances configured".to_string(),
                source: None,
            }
        })?;
        Ok(self.result(config, instance, "first enabled provider instance".to_string(), 0.3))
    }

    fn apply_policy<'a>(
        &self,
        policy: SelectionPolicy,
        candidates: &[&'a ProviderInstanceConfig],
        template: &Template,
    ) -> &'a ProviderInstanceConfig {
        match policy {
            SelectionPolicy::FirstAvailable => {
                candidates.iter().copied().min_by_key(|p| p.priority).unwrap_or(candidates[0])
            }
            SelectionPolicy::RoundRobin | SelectionPolicy::FastestResponse => {
                // Fastest-response needs live latency data which lives in the
                // strategy metrics; at selection time fall back to rotation.
                let n = self.round_robin_cursor.fetch_add(1, Ordering::SeqCst);
                candidates[n % candidates.len()]
            }
            SelectionPolicy::WeightedRoundRobin => {
                let total: u64 = candidates.iter().map(|p| u64::from(p.weight.max(1))).sum();
                let mut roll = fastrand::u64(0..total.max(1));
                for &candidate in candidates {
                    let w = u64::from(candidate.weight.max(1));
                    if roll < w {
                        return candidate;
                    }
                    roll -= w;
                }
                candidates[candidates.len() - 1]
            }
            SelectionPolicy::CapabilityBased => {
                let api = template.provider_api.as_str();
                candidates
                    .iter()
                    .copied()
                    .find(|p| p.capabilities.iter().any(|c| c == api))
                    .unwrap_or(candidates[0])
            }
        }
    }

    fn result(
        &self,
        config: &BrokerConfig,
        instance: &ProviderInstanceConfig,
        reason: String,
        confidence: f64,
    ) -> SelectionResult {
        let alternatives = config
            .enabled_provider_instances()
            .filter(|p| p.name != instance.name)
            .map(|p| p.name.clone())
            .collect();
        SelectionResult {
            provider_type: instance.provider_type.clone(),
            provider_instance: instance.name.clone(),
            selection_reason: reason,
            confidence,
            alternatives,
        }
    }
}

impl Default for ProviderSelectionService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config_with(instances: Vec<ProviderInstanceConfig>) -> BrokerConfig {
        let mut config = BrokerConfig::default();
        config.provider.providers = instances;
        config
    }

    fn instance(name: &str, enabled: bool, capabilities: &[&str]) -> ProviderInstanceConfig {
        ProviderInstanceConfig {
            name: name.to_string(),
            provider_type: "aws".to_string(),
            enabled,
            priority: 100,
            weight: 1,
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            config: json!({}),
            template_defaults: json!({}),
        }
    }

    fn template() -> Template {
        Template::from_value(json!({
            "template_id": "t1",
            "provider_api": "EC2Fleet",
            "image_id": "ami-1",
            "subnet_ids": ["subnet-a"]
        }))
        .unwrap()
    }

    #[test]
    fn explicit_provider_name_wins() {
        let config = config_with(vec![
            instance("aws-a", true, &["EC2Fleet"]),
            instance("aws-b", true, &["EC2Fleet"]),
        ]);
        let mut t = template();
        t.provider_name = Some("aws-b".to_string());

        let result = ProviderSelectionService::new().select(&config, &t).unwrap();
        assert_eq!(result.provider_instance, "aws-b");
        assert_eq!(result.confidence, 1.0);
        assert_eq!(result.alternatives, vec!["aws-a".to_string()]);
    }

    #[test]
    fn disabled_pinned_instance_fails() {
        let config = config_with(vec![instance("aws-a", false, &["EC2Fleet"])]);
        let mut t = template();
        t.provider_name = Some("aws-a".to_string());
        assert!(ProviderSelectionService::new().select(&config, &t).is_err());
    }

    #[test]
    fn provider_type_uses_selection_policy() {
        let mut config = config_with(vec![
            instance("aws-a", true, &["EC2Fleet"]),
            instance("aws-b", true, &["EC2Fleet"]),
        ]);
        config.provider.selection_policy = SelectionPolicy::RoundRobin;
        let mut t = template();
        t.provider_type = Some("aws".to_string());

        let service = ProviderSelectionService::new();
        let first = service.select(&config, &t).unwrap().provider_instance;
        let second = service.select(&config, &t).unwrap().provider_instance;
        assert_ne!(first, second);
    }

    #[test]
    fn api_support_is_third_choice() {
        let config = config_with(vec![
            instance("aws-asg-only", true, &["ASG"]),
            instance("aws-fleet", true, &["EC2Fleet"]),
        ]);
        let result = ProviderSelectionService::new().select(&config, &template()).unwrap();
        assert_eq!(result.provider_instance, "aws-fleet");
        assert!(result.selection_reason.contains("EC2Fleet"));
    }

    #[test]
    fn falls_back_to_default_then_first_enabled() {
        let mut config = config_with(vec![
            instance("aws-a", true, &[]),
            instance("aws-b", true, &[]),
        ]);
        config.provider.active_provider = Some("aws-b".to_string());

        let result = ProviderSelectionService::new().select(&config, &template()).unwrap();
        assert_eq!(result.provider_instance, "aws-b");

        config.provider.active_provider = None;
        let result = ProviderSelectionService::new().select(&config, &template()).unwrap();
        assert_eq!(result.provider_instance, "aws-a");
    }

    #[test]
    fn no_enabled_instances_is_a_configuration_error() {
        let config = config_with(vec![instance("aws-a", false, &[])]);
        let err = ProviderSelectionService::new().select(&config, &template()).unwrap_err();
        assert_eq!(err.error_code(), "CONFIGURATION_ERROR");
    }
}

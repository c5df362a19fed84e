//! Native provider-API spec rendering
//!
//! Operators may ship vendor-exact JSON payloads, inline on the template or
//! as a file reference, with templated variables. The service renders the
//! document with the request/template/package context bound, parses it back
//! to JSON and hands it to the handler, which overlays its computed keys.
//! Rendering is deterministic; a malformed expression is a hard
//! configuration error at render time.

use crate::domain::{ProviderApi, Request, Template};
use crate::error::{BrokerError, Result};
use base64::Engine;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use tera::Tera;
use tracing::debug;

pub struct AwsNativeSpecService {
    enabled: bool,
    spec_dir: PathBuf,
    package_name: String,
    package_version: String,
}

impl AwsNativeSpecService {
    pub fn new(
        enabled: bool,
        spec_dir: PathBuf,
        package_name: String,
        package_version: String,
    ) -> Self {
        Self { enabled, spec_dir, package_name, package_version }
    }

    /// Render the template's provider-API spec, or `None` when the template
    /// declares none (or native specs are disabled).
    pub fn process_provider_api_spec(
        &self,
        template: &Template,
        request: &Request,
    ) -> Result<Option<Value>> {
        self.process_provider_api_spec_with_merge(template, request, Value::Null)
    }

    /// Same, with handler-computed context merged in before rendering.
    pub fn process_provider_api_spec_with_merge(
        &self,
        template: &Template,
        request: &Request,
        extra_context: Value,
    ) -> Result<Option<Value>> {
        if !self.enabled {
            return Ok(None);
        }
        let Some(raw) = self.raw_provider_api_spec(template)? else {
            return Ok(None);
        };
        let context = self.build_context(template, request, extra_context);
        let rendered = self.render(&raw, &context, &template.template_id)?;
        debug!("Rendered native provider API spec for template {}", template.template_id);
        Ok(Some(rendered))
    }

    /// Render the operator's launch-template spec, if any.
    pub fn process_launch_template_spec(
        &self,
        template: &Template,
        request: &Request,
    ) -> Result<Option<Value>> {
        if !self.enabled {
            return Ok(None);
        }
        let raw = if let Some(inline) = &template.aws.launch_template_spec {
            Some(inline.clone())
        } else if let Some(file) = &template.aws.launch_template_spec_file {
            Some(self.load_spec_file(file, &template.template_id)?)
        } else {
            None
        };
        let Some(raw) = raw else {
            return Ok(None);
        };
        let context = self.build_context(template, request, Value::Null);
        Ok(Some(self.render(&raw, &context, &template.template_id)?))
    }

    /// Render a built-in default scalar skeleton for the given provider API.
    /// Handlers overlay launch-template configs and tags programmatically.
    pub fn render_default_spec(
        &self,
        api: ProviderApi,
        template: &Template,
        request: &Request,
        extra_context: Value,
    ) -> Result<Value> {
        let source = default_spec_source(api);
        let context = self.build_context(template, request, extra_context);
        self.render_source(source, &context, &template.template_id)
    }

    fn raw_provider_api_spec(&self, template: &Template) -> Result<Option<Value>> {
        if let Some(inline) = &template.aws.provider_api_spec {
            return Ok(Some(inline.clone()));
        }
        if let Some(file) = &template.aws.provider_api_spec_file {
            return Ok(Some(self.load_spec_file(file, &template.template_id)?));
        }
        Ok(None)
    }

    fn load_spec_file(&self, file: &str, template_id: &str) -> Result<Value> {
        let path = self.spec_dir.join(file);
        let content = std::fs::read_to_string(&path).map_err(|e| {
            BrokerError::Configuration {
                message: format!(
                    "template '{template_id}': cannot read spec file {}",
                    path.display()
                ),
                source: Some(Box::new(e)),
            }
        })?;
        serde_json::from_str(&content).map_err(|e| BrokerError::Configuration {
            message: format!(
                "template '{template_id}': spec file {} is not valid JSON",
                path.display()
            ),
            source: Some(Box::new(e)),
        })
    }

    fn build_context(&self, template: &Template, request: &Request, extra: Value) -> tera::Context {
        let mut context = tera::Context::new();
        context.insert("request_id", &request.request_id);
        context.insert("requested_count", &request.machine_count);
        context.insert("template_id", &template.template_id);
        context.insert("image_id", &template.image_id);
        context.insert("instance_type", &template.instance_type);
        context.insert("package_name", &self.package_name);
        context.insert("package_version", &self.package_version);
        if let Value::Object(map) = extra {
            for (key, value) in map {
                context.insert(key, &value);
            }
        }
        context
    }

    /// Serialize the spec document, run it through the template engine and
    /// parse the result back to JSON.
    fn render(&self, spec: &Value, context: &tera::Context, template_id: &str) -> Result<Value> {
        let source = serde_json::to_string_pretty(spec)?;
        self.render_source(&source, context, template_id)
    }

    fn render_source(
        &self,
        source: &str,
        context: &tera::Context,
        template_id: &str,
    ) -> Result<Value> {
        let mut tera = Tera::default();
        tera.register_filter("b64encode", b64encode_filter);
        let rendered = tera.render_str(source, context).map_err(|e| {
            BrokerError::Configuration {
                message: format!("template '{template_id}': native spec render failed: {e}"),
                source: Some(Box::new(e)),
            }
        })?;
        let value: Value =
            serde_json::from_str(&rendered).map_err(|e| BrokerError::Configuration {
                message: format!(
                    "template '{template_id}': rendered native spec is not valid JSON"
                ),
                source: Some(Box::new(e)),
            })?;
        if !value.is_object() {
            return Err(BrokerError::Configuration {
                message: format!(
                    "template '{template_id}': rendered native spec must be a JSON object"
                ),
                source: None,
            });
        }
        Ok(value)
    }
}

fn b64encode_filter(
    value: &tera::Value,
    _args: &HashMap<String, tera::Value>,
) -> tera::Result<tera::Value> {
    let input = value
        .as_str()
        .ok_or_else(|| tera::Error::msg("b64encode expects a string"))?;
    Ok(tera::Value::String(
        base64::engine::general_purpose::STANDARD.encode(input.as_bytes()),
    ))
}

fn default_spec_source(api: ProviderApi) -> &'static str {
    match api {
        ProviderApi::Ec2Fleet => DEFAULT_EC2_FLEET_SPEC,
        ProviderApi::SpotFleet => DEFAULT_SPOT_FLEET_SPEC,
        ProviderApi::Asg => DEFAULT_ASG_SPEC,
        ProviderApi::RunInstances => DEFAULT_RUN_INSTANCES_SPEC,
    }
}

const DEFAULT_EC2_FLEET_SPEC: &str = r#"{
  "Type": "{{ fleet_type }}",
  "TargetCapacitySpecification": {
    "TotalTargetCapacity": {{ requested_count }},
    "DefaultTargetCapacityType": "{{ default_capacity_type }}",
    "OnDemandTargetCapacity": {{ on_demand_count | default(value=0) }},
    "SpotTargetCapacity": {{ spot_count | default(value=0) }}
  }
}"#;

const DEFAULT_SPOT_FLEET_SPEC: &str = r#"{
  "IamFleetRole": "{{ fleet_role }}",
  "TargetCapacity": {{ requested_count }},
  "Type": "{{ fleet_type }}",
  "AllocationStrategy": "{{ allocation_strategy }}"
}"#;

const DEFAULT_ASG_SPEC: &str = r#"{
  "AutoScalingGroupName": "{{ asg_name }}",
  "MinSize": {{ min_size | default(value=0) }},
  "MaxSize": {{ max_size }},
  "DesiredCapacity": {{ requested_count }},
  "DefaultCooldown": 300,
  "HealthCheckType": "EC2",
  "HealthCheckGracePeriod": 300,
  "VPCZoneIdentifier": "{{ vpc_zone_identifier }}"
}"#;

const DEFAULT_RUN_INSTANCES_SPEC: &str = r#"{
  "ImageId": "{{ image_id }}",
  "MinCount": {{ requested_count }},
  "MaxCount": {{ requested_count }}
}"#;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn service() -> AwsNativeSpecService {
        AwsNativeSpecService::new(
            true,
            PathBuf::from("/nonexistent"),
            "hostbroker".to_string(),
            "0.1.0".to_string(),
        )
    }

    fn template_with_spec(spec: Value) -> Template {
        Template::from_value(json!({
            "template_id": "tmpl-1",
            "provider_api": "EC2Fleet",
            "image_id": "ami-1",
            "instance_type": "t3.micro",
            "subnet_ids": ["subnet-a"],
            "provider_api_spec": spec
        }))
        .unwrap()
    }

    #[test]
    fn renders_requested_count_into_the_spec() {
        let template = template_with_spec(json!({
            "Type": "instant",
            "TargetCapacitySpecification": {"TotalTargetCapacity": "{{ requested_count }}"}
        }));
        let request = Request::new_acquisition("tmpl-1", 5).unwrap();

        let rendered = service()
            .process_provider_api_spec(&template, &request)
            .unwrap()
            .expect("spec expected");
        assert_eq!(rendered["Type"], "instant");
        assert_eq!(rendered["TargetCapacitySpecification"]["TotalTargetCapacity"], "5");
    }

    #[test]
    fn rendering_is_deterministic() {
        let template = template_with_spec(json!({
            "Name": "{{ template_id }}-{{ requested_count }}"
        }));
        let request = Request::new_acquisition("tmpl-1", 3).unwrap();
        let service = service();

        let a = service.process_provider_api_spec(&template, &request).unwrap();
        let b = service.process_provider_api_spec(&template, &request).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn no_spec_yields_none() {
        let template = Template::from_value(json!({
            "template_id": "tmpl-1",
            "provider_api": "EC2Fleet",
            "image_id": "ami-1",
            "subnet_ids": ["subnet-a"]
        }))
        .unwrap();
        let request = Request::new_acquisition("tmpl-1", 1).unwrap();
        assert!(service().process_provider_api_spec(&template, &request).unwrap().is_none());
    }

    #[test]
    fn disabled_service_yields_none_even_with_spec() {
        let template = template_with_spec(json!({"Type": "instant"}));
        let request = Request::new_acquisition("tmpl-1", 1).unwrap();
        let disabled = AwsNativeSpecService::new(
            false,
            PathBuf::from("/nonexistent"),
            "hostbroker".to_string(),
            "0.1.0".to_string(),
        );
        assert!(disabled.process_provider_api_spec(&template, &request).unwrap().is_none());
    }

    #[test]
    fn unclosed_expression_is_a_hard_error() {
        let template = template_with_spec(json!({"Name": "{{ request_id"}));
        let request = Request::new_acquisition("tmpl-1", 1).unwrap();
        let err = service().process_provider_api_spec(&template, &request).unwrap_err();
        assert_eq!(err.error_code(), "CONFIGURATION_ERROR");
    }

    #[test]
    fn merge_context_reaches_the_renderer() {
        let template = template_with_spec(json!({
            "AutoScalingGroupName": "{{ asg_name }}"
        }));
        let request = Request::new_acquisition("tmpl-1", 1).unwrap();
        let rendered = service()
            .process_provider_api_spec_with_merge(
                &template,
                &request,
                json!({"asg_name": "hf-req-9"}),
            )
            .unwrap()
            .expect("spec expected");
        assert_eq!(rendered["AutoScalingGroupName"], "hf-req-9");
    }

    #[test]
    fn b64encode_filter_is_available() {
        let template = template_with_spec(json!({
            "UserData": "{{ user_data | b64encode }}"
        }));
        let request = Request::new_acquisition("tmpl-1", 1).unwrap();
        let rendered = service()
            .process_provider_api_spec_with_merge(
                &template,
                &request,
                json!({"user_data": "echo hi"}),
            )
            .unwrap()
            .expect("spec expected");
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(rendered["UserData"].as_str().unwrap())
            .unwrap();
        assert_eq!(String::from_utf8(decoded).unwrap(), "echo hi");
    }

    #[test]
    fn default_specs_render_for_every_api() {
        let request = Request::new_acquisition("tmpl-1", 4).unwrap();
        let template = Template::from_value(json!({
            "template_id": "tmpl-1",
            "provider_api": "EC2Fleet",
            "image_id": "ami-1",
            "instance_type": "t3.micro",
            "subnet_ids": ["subnet-a"]
        }))
        .unwrap();
        let service = service();

        let fleet = service
            .render_default_spec(
                ProviderApi::Ec2Fleet,
                &template,
                &request,
                json!({"fleet_type": "instant", "default_capacity_type": "on-demand"}),
            )
            .unwrap();
        assert_eq!(fleet["Type"], "instant");
        assert_eq!(fleet["TargetCapacitySpecification"]["TotalTargetCapacity"], 4);

        let asg = service
            .render_default_spec(
                ProviderApi::Asg,
                &template,
                &request,
                json!({"asg_name": "hf-r1", "max_size": 8, "vpc_zone_identifier": "subnet-a"}),
            )
            .unwrap();
        assert_eq!(asg["MaxSize"], 8);
        assert_eq!(asg["DesiredCapacity"], 4);

        let ri = service
            .render_default_spec(ProviderApi::RunInstances, &template, &request, json!({}))
            .unwrap();
        assert_eq!(ri["MinCount"], 4);
        assert_eq!(ri["MaxCount"], 4);
    }
}

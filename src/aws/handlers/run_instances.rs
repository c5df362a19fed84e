//! RunInstances handler
//!
//! The simplest provisioning path: a direct `RunInstances` call with
//! `MinCount = MaxCount = requested_count`. The reservation id is the
//! resource id and instances are known immediately. Capacity shortfalls
//! surface as recoverable capacity errors.

use crate::aws::handlers::{AcquireOutcome, AwsHandler, HandlerDeps};
use crate::domain::{Machine, ProviderApi, Request, Template};
use crate::error::{BrokerError, Result};
use base64::Engine;
use serde_json::{json, Value};
use tracing::info;

pub struct RunInstancesHandler {
    deps: HandlerDeps,
}

impl RunInstancesHandler {
    pub fn new(deps: HandlerDeps) -> Self {
        Self { deps }
    }

    fn build_run_config(&self, template: &Template, request: &Request) -> Result<Value> {
        let mut config = match self.deps.native_spec.process_provider_api_spec_with_merge(
            template,
            request,
            Value::Null,
        )? {
            Some(spec) => {
                info!(
                    "Using native provider API spec for RunInstances template {}",
                    template.template_id
                );
                spec
            }
            None => self.deps.native_spec.render_default_spec(
                ProviderApi::RunInstances,
                template,
                request,
                Value::Null,
            )?,
        };

        config["ImageId"] = json!(template.image_id);
        config["MinCount"] = json!(request.machine_count);
        config["MaxCount"] = json!(request.machine_count);
        if let Some((instance_type, _)) = template.weighted_instance_types().first() {
            config["InstanceType"] = json!(instance_type);
        }
        if let Some(subnet) = template.subnet_ids.first() {
            config["SubnetId"] = json!(subnet);
        }
        if !template.security_group_ids.is_empty() {
            config["SecurityGroupIds"] = json!(template.security_group_ids);
        }
        if let Some(key_name) = &template.aws.key_name {
            config["KeyName"] = json!(key_name);
        }
        if let Some(user_data) = &template.aws.user_data {
            config["UserData"] =
                json!(base64::engine::general_purpose::STANDARD.encode(user_data.as_bytes()));
        }
        if let Some(profile) = &template.aws.instance_profile {
            config["IamInstanceProfile"] = json!({ "Name": profile });
        }
        if config.get("TagSpecifications").is_none() {
            let mut tags: Vec<Value> = template
                .tags
                .iter()
                .map(|(k, v)| json!({"Key": k, "Value": v}))
                .collect();
            tags.push(json!({"Key": "RequestId", "Value": request.request_id}));
            tags.push(json!({"Key": "TemplateId", "Value": template.template_id}));
            config["TagSpecifications"] =
                json!([{ "ResourceType": "instance", "Tags": tags }]);
        }
        Ok(config)
    }
}

#[async_trait::async_trait]
impl AwsHandler for RunInstancesHandler {
    fn provider_api(&self) -> ProviderApi {
        ProviderApi::RunInstances
    }

    async fn acquire_hosts(
        &self,
        request: &Request,
        template: &Template,
    ) -> Result<AcquireOutcome> {
        if let Some(resource_ids) = self.deps.ledger.recorded(&request.request_id).await {
            info!(
                "Request {} already holds reservation {:?}, returning recorded ids",
                request.request_id, resource_ids
            );
            return Ok(AcquireOutcome::succeeded(resource_ids, Vec::new()));
        }

        let config = self.build_run_config(template, request)?;

        let api = self.deps.ops.api().clone();
        let reservation = self
            .deps
            .ops
            .execute_critical("run_instances", || {
                let api = api.clone();
                let config = config.clone();
                async move { api.run_instances(config).await }
            })
            .await?;

        info!(
            "RunInstances reservation {} created {} instances for request {}",
            reservation.reservation_id,
            reservation.instances.len(),
            request.request_id
        );
        self.deps
            .ledger
            .record(&request.request_id, vec![reservation.reservation_id.clone()])
            .await;
        Ok(AcquireOutcome::succeeded(
            vec![reservation.reservation_id],
            reservation.instances,
        ))
    }

    async fn check_hosts_status(&self, request: &Request) -> Result<Vec<Machine>> {
        // Reservation contents are fixed at acquire time; the machine
        // references are the instance ids.
        if request.machine_references.is_empty() {
            return Ok(Vec::new());
        }
        let resource_id = request.resource_ids.first().cloned().unwrap_or_default();
        let infos =
            self.deps.ops.describe_instances_batched(&request.machine_references).await?;
        Ok(infos
            .iter()
            .map(|info| self.deps.machines.machine_from_instance(info, request, &resource_id))
            .collect())
    }

    async fn release_hosts(&self, request: &Request) -> Result<()> {
        if request.machine_references.is_empty() {
            return Err(BrokerError::infrastructure(
                "no instance ids recorded on RunInstances request",
            ));
        }
        self.deps.ops.terminate_instances_with_fallback(&request.machine_references).await?;
        info!(
            "Terminated {} instances for request {}",
            request.machine_references.len(),
            request.request_id
        );
        self.deps.ledger.forget(&request.request_id).await;
        Ok(())
    }
}

//! Auto Scaling Group handler
//!
//! Creates one ASG per request, named `hf-<request_id>`, spanning the
//! template's subnets. Releasing specific machines reduces desired
//! capacity, detaches the instances and terminates them; releasing without
//! machine ids force-deletes the whole group.

use crate::aws::api::AsgTag;
use crate::aws::handlers::{AcquireOutcome, AwsHandler, HandlerDeps};
use crate::domain::{Machine, ProviderApi, Request, Template};
use crate::error::{BrokerError, Result};
use serde_json::{json, Value};
use tracing::{error, info, warn};

pub struct AsgHandler {
    deps: HandlerDeps,
    package_name: String,
}

impl AsgHandler {
    pub fn new(deps: HandlerDeps, package_name: String) -> Self {
        Self { deps, package_name }
    }

    fn asg_name(request: &Request) -> String {
        format!("hf-{}", request.request_id)
    }

    fn validate_prerequisites(&self, template: &Template) -> Result<()> {
        let mut missing = Vec::new();
        if template.subnet_ids.is_empty() {
            missing.push("subnet_ids");
        }
        if template.security_group_ids.is_empty() {
            missing.push("security_group_ids");
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(BrokerError::Validation {
                field: missing.join(", "),
                reason: format!(
                    "template '{}': required for Auto Scaling Groups",
                    template.template_id
                ),
            })
        }
    }

    fn build_asg_config(
        &self,
        asg_name: &str,
        template: &Template,
        request: &Request,
        launch_template_id: &str,
        launch_template_version: &str,
    ) -> Result<Value> {
        let context = json!({
            "asg_name": asg_name,
            "min_size": 0,
            "max_size": request.machine_count * 2,
            "vpc_zone_identifier": template.subnet_ids.join(","),
            "launch_template_id": launch_template_id,
            "launch_template_version": launch_template_version,
        });

        let mut config = match self.deps.native_spec.process_provider_api_spec_with_merge(
            template,
            request,
            context.clone(),
        )? {
            Some(spec) => {
                info!(
                    "Using native provider API spec with merge for ASG template {}",
                    template.template_id
                );
                spec
            }
            None => self.deps.native_spec.render_default_spec(
                ProviderApi::Asg,
                template,
                request,
                context,
            )?,
        };

        // The launch template binding and group name are always ours.
        config["LaunchTemplate"] = json!({
            "LaunchTemplateId": launch_template_id,
            "Version": launch_template_version,
        });
        config["AutoScalingGroupName"] = json!(asg_name);
        if config.get("VPCZoneIdentifier").is_none() {
            config["VPCZoneIdentifier"] = json!(template.subnet_ids.join(","));
        }
        if let Some(context_field) = &template.aws.context {
            config["Context"] = json!(context_field);
        }
        Ok(config)
    }

    async fn tag_asg(&self, asg_name: &str, template: &Template, request: &Request) {
        let mut tags: Vec<AsgTag> = vec![
            ("Name".to_string(), format!("hostfactory-asg-{}", request.request_id)),
            ("RequestId".to_string(), request.request_id.clone()),
            ("TemplateId".to_string(), template.template_id.clone()),
            ("CreatedBy".to_string(), self.package_name.clone()),
            ("ProviderApi".to_string(), "ASG".to_string()),
        ]
        .into_iter()
        .map(|(key, value)| AsgTag {
            key,
            value,
            propagate_at_launch: true,
            resource_id: asg_name.to_string(),
        })
        .collect();
        for (key, value) in &template.tags {
            tags.push(AsgTag {
                key: key.clone(),
                value: value.clone(),
                propagate_at_launch: true,
                resource_id: asg_name.to_string(),
            });
        }

        let api = self.deps.ops.api().clone();
        let result = self
            .deps
            .ops
            .execute_critical("create_or_update_asg_tags", || {
                let api = api.clone();
                let tags = tags.clone();
                async move { api.create_or_update_asg_tags(tags).await }
            })
            .await;
        match result {
            Ok(()) => info!("Tagged ASG {}", asg_name),
            // Tagging failure never fails the acquisition.
            Err(e) => warn!("Failed to tag ASG {}: {}", asg_name, e),
        }
    }
}

#[async_trait::async_trait]
impl AwsHandler for AsgHandler {
    fn provider_api(&self) -> ProviderApi {
        ProviderApi::Asg
    }

    async fn acquire_hosts(
        &self,
        request: &Request,
        template: &Template,
    ) -> Result<AcquireOutcome> {
        if let Some(resource_ids) = self.deps.ledger.recorded(&request.request_id).await {
            info!(
                "Request {} already owns ASG {:?}, returning recorded ids",
                request.request_id, resource_ids
            );
            return Ok(AcquireOutcome::succeeded(resource_ids, Vec::new()));
        }

        self.validate_prerequisites(template)?;

        let lt = self
            .deps
            .launch_templates
            .create_or_update_launch_template(template, request)
            .await?;

        let asg_name = Self::asg_name(request);
        let config =
            self.build_asg_config(&asg_name, template, request, &lt.template_id, &lt.version)?;

        let api = self.deps.ops.api().clone();
        self.deps
            .ops
            .execute_critical("create_auto_scaling_group", || {
                let api = api.clone();
                let config = config.clone();
                async move { api.create_auto_scaling_group(config).await }
            })
            .await?;
        info!("Successfully created Auto Scaling Group: {}", asg_name);

        self.tag_asg(&asg_name, template, request).await;

        self.deps.ledger.record(&request.request_id, vec![asg_name.clone()]).await;
        // ASG instances come later, via status checks.
        Ok(AcquireOutcome::succeeded(vec![asg_name], Vec::new()))
    }

    async fn check_hosts_status(&self, request: &Request) -> Result<Vec<Machine>> {
        if request.resource_ids.is_empty() {
            info!("No ASG names recorded on request {}", request.request_id);
            return Ok(Vec::new());
        }
        let mut machines = Vec::new();
        for asg_name in &request.resource_ids {
            let api = self.deps.ops.api().clone();
            let name = asg_name.clone();
            let asg = match self
                .deps
                .ops
                .execute_standard("describe_auto_scaling_group", || {
                    let api = api.clone();
                    let name = name.clone();
                    async move { api.describe_auto_scaling_group(&name).await }
                })
                .await
            {
                Ok(Some(asg)) => asg,
                Ok(None) => {
                    warn!("ASG {} not found", asg_name);
                    continue;
                }
                Err(e) => {
                    error!("Failed to get instances for ASG {}: {}", asg_name, e);
                    continue;
                }
            };
            let infos = self.deps.ops.describe_instances_batched(&asg.instance_ids).await?;
            machines.extend(
                infos
                    .iter()
                    .map(|info| self.deps.machines.machine_from_instance(info, request, asg_name)),
            );
        }
        Ok(machines)
    }

    async fn release_hosts(&self, request: &Request) -> Result<()> {
        if request.resource_ids.is_empty() {
            return Err(BrokerError::infrastructure("no ASG names recorded on request"));
        }

        for asg_name in &request.resource_ids {
            let instance_ids: Vec<String> = request.machine_references.clone();
            let api = self.deps.ops.api().clone();

            if !instance_ids.is_empty() {
                let name = asg_name.clone();
                let asg = self
                    .deps
                    .ops
                    .execute_standard("describe_auto_scaling_group", || {
                        let api = api.clone();
                        let name = name.clone();
                        async move { api.describe_auto_scaling_group(&name).await }
                    })
                    .await?
                    .ok_or_else(|| {
                        BrokerError::NotFound {
                            entity: "auto_scaling_group".to_string(),
                            id: asg_name.clone(),
                        }
                    })?;

                // Reduce desired capacity before detaching.
                let new_capacity =
                    (asg.desired_capacity - instance_ids.len() as i32).max(0);
                let name = asg_name.clone();
                let min_size = asg.min_size.min(new_capacity);
                self.deps
                    .ops
                    .execute_critical("update_auto_scaling_group", || {
                        let api = api.clone();
                        let name = name.clone();
                        async move {
                            api.update_auto_scaling_group(&name, new_capacity, Some(min_size))
                                .await
                        }
                    })
                    .await?;
                info!("Reduced ASG {} capacity to {}", asg_name, new_capacity);

                let name = asg_name.clone();
                let ids = instance_ids.clone();
                self.deps
                    .ops
                    .execute_critical("detach_instances", || {
                        let api = api.clone();
                        let name = name.clone();
                        let ids = ids.clone();
                        async move { api.detach_instances(&name, ids, true).await }
                    })
                    .await?;
                info!("Detached instances from ASG {}: {:?}", asg_name, instance_ids);

                self.deps.ops.terminate_instances_with_fallback(&instance_ids).await?;
                info!("Terminated instances: {:?}", instance_ids);
            } else {
                let name = asg_name.clone();
                self.deps
                    .ops
                    .execute_critical("delete_auto_scaling_group", || {
                        let api = api.clone();
                        let name = name.clone();
                        async move { api.delete_auto_scaling_group(&name, true).await }
                    })
                    .await?;
                info!("Deleted Auto Scaling Group: {}", asg_name);
            }
        }
        self.deps.ledger.forget(&request.request_id).await;
        Ok(())
    }
}

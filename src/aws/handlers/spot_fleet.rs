//! Spot Fleet handler
//!
//! Provisions capacity with `RequestSpotFleet`. Requires an IAM fleet role.
//! Termination cancels the spot fleet request with instance termination and
//! then sweeps any leaked instances with an explicit `TerminateInstances`.

use crate::aws::handlers::{
    launch_template_overrides, tag_specifications, AcquireOutcome, AwsHandler, HandlerDeps,
};
use crate::domain::{FleetType, Machine, ProviderApi, Request, Template};
use crate::error::{BrokerError, Result};
use serde_json::{json, Value};
use tracing::{error, info, warn};

pub struct SpotFleetHandler {
    deps: HandlerDeps,
}

impl SpotFleetHandler {
    pub fn new(deps: HandlerDeps) -> Self {
        Self { deps }
    }

    fn fleet_role<'a>(&self, template: &'a Template) -> Result<&'a str> {
        template.aws.fleet_role.as_deref().ok_or_else(|| BrokerError::Validation {
            field: "fleet_role".to_string(),
            reason: format!(
                "template '{}': SpotFleet requires an IAM fleet role",
                template.template_id
            ),
        })
    }

    fn build_spot_fleet_config(
        &self,
        template: &Template,
        request: &Request,
        launch_template_id: &str,
        launch_template_version: &str,
    ) -> Result<Value> {
        let fleet_role = self.fleet_role(template)?.to_string();
        let fleet_type =
            template.effective_fleet_type().unwrap_or(FleetType::Request).as_str().to_string();
        let allocation_strategy = template
            .allocation_strategy
            .map(|s| s.for_spot_fleet().to_string())
            .unwrap_or_else(|| "lowestPrice".to_string());
        let context = json!({
            "fleet_role": fleet_role,
            "fleet_type": fleet_type,
            "allocation_strategy": allocation_strategy,
        });

        let mut config = match self.deps.native_spec.process_provider_api_spec_with_merge(
            template,
            request,
            context.clone(),
        )? {
            Some(spec) => {
                info!(
                    "Using native provider API spec for SpotFleet template {}",
                    template.template_id
                );
                spec
            }
            None => self.deps.native_spec.render_default_spec(
                ProviderApi::SpotFleet,
                template,
                request,
                context,
            )?,
        };

        // The fleet role and launch template are always ours to inject.
        config["IamFleetRole"] = json!(fleet_role);
        if config.get("TargetCapacity").is_none() {
            config["TargetCapacity"] = json!(request.machine_count);
        }
        if let Some(pools) = template.aws.pools_count {
            config["InstancePoolsToUseCount"] = json!(pools);
        }
        config["LaunchTemplateConfigs"] = json!([{
            "LaunchTemplateSpecification": {
                "LaunchTemplateId": launch_template_id,
                "Version": launch_template_version,
            },
            "Overrides": launch_template_overrides(template),
        }]);
        if config.get("TagSpecifications").is_none() {
            config["TagSpecifications"] =
                tag_specifications(template, request, "spot-fleet-request");
        }
        Ok(config)
    }
}

#[async_trait::async_trait]
impl AwsHandler for SpotFleetHandler {
    fn provider_api(&self) -> ProviderApi {
        ProviderApi::SpotFleet
    }

    async fn acquire_hosts(
        &self,
        request: &Request,
        template: &Template,
    ) -> Result<AcquireOutcome> {
        if let Some(resource_ids) = self.deps.ledger.recorded(&request.request_id).await {
            info!(
                "Request {} already holds spot fleet {:?}, returning recorded ids",
                request.request_id, resource_ids
            );
            return Ok(AcquireOutcome::succeeded(resource_ids, Vec::new()));
        }

        let lt = self
            .deps
            .launch_templates
            .create_or_update_launch_template(template, request)
            .await?;
        let config =
            self.build_spot_fleet_config(template, request, &lt.template_id, &lt.version)?;

        let api = self.deps.ops.api().clone();
        let spot_fleet_request_id = self
            .deps
            .ops
            .execute_critical("request_spot_fleet", || {
                let config = config.clone();
                let api = api.clone();
                async move { api.request_spot_fleet(config).await }
            })
            .await?;

        info!(
            "Created spot fleet request {} for request {}",
            spot_fleet_request_id, request.request_id
        );
        self.deps
            .ledger
            .record(&request.request_id, vec![spot_fleet_request_id.clone()])
            .await;
        // Spot fleets fulfill asynchronously; instances surface via status checks.
        Ok(AcquireOutcome::succeeded(vec![spot_fleet_request_id], Vec::new()))
    }

    async fn check_hosts_status(&self, request: &Request) -> Result<Vec<Machine>> {
        let mut machines = Vec::new();
        for resource_id in &request.resource_ids {
            let api = self.deps.ops.api().clone();
            let rid = resource_id.clone();
            let ids = match self
                .deps
                .ops
                .execute_standard("describe_spot_fleet_instances", || {
                    let api = api.clone();
                    let rid = rid.clone();
                    async move { api.describe_spot_fleet_instances(&rid).await }
                })
                .await
            {
                Ok(ids) => ids,
                Err(e) => {
                    error!("Failed to enumerate spot fleet {}: {}", resource_id, e);
                    continue;
                }
            };
            let infos = self.deps.ops.describe_instances_batched(&ids).await?;
            machines.extend(
                infos
                    .iter()
                    .map(|info| self.deps.machines.machine_from_instance(info, request, resource_id)),
            );
        }
        Ok(machines)
    }

    async fn release_hosts(&self, request: &Request) -> Result<()> {
        if request.resource_ids.is_empty() {
            return Err(BrokerError::infrastructure(
                "no spot fleet request ids recorded on request",
            ));
        }
        let api = self.deps.ops.api().clone();
        let ids = request.resource_ids.clone();
        self.deps
            .ops
            .execute_critical("cancel_spot_fleet_requests", || {
                let api = api.clone();
                let ids = ids.clone();
                async move { api.cancel_spot_fleet_requests(ids, true).await }
            })
            .await?;
        info!("Cancelled spot fleet requests {:?}", request.resource_ids);

        // Explicit fallback for instances the cancellation did not reap.
        if let Err(e) = self
            .deps
            .ops
            .terminate_instances_with_fallback(&request.machine_references)
            .await
        {
            warn!("Fallback termination after spot fleet cancel failed: {}", e);
            return Err(e);
        }
        self.deps.ledger.forget(&request.request_id).await;
        Ok(())
    }
}

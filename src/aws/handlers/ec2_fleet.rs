//! EC2 Fleet handler
//!
//! Provisions capacity with `CreateFleet`. `instant` fleets return their
//! instances synchronously; `request`/`maintain` fleets materialize
//! instances over time and are tracked through status checks. Native
//! provider-API specs are rendered and merged with computed values; the
//! launch template configuration is always injected.

use crate::aws::handlers::{
    launch_template_overrides, tag_specifications, AcquireOutcome, AwsHandler, HandlerDeps,
};
use crate::domain::{FleetType, Machine, PriceType, ProviderApi, Request, Template};
use crate::error::{BrokerError, Result};
use serde_json::{json, Value};
use tracing::{error, info, warn};

pub struct Ec2FleetHandler {
    deps: HandlerDeps,
}

impl Ec2FleetHandler {
    pub fn new(deps: HandlerDeps) -> Self {
        Self { deps }
    }

    fn render_context(&self, template: &Template, request: &Request) -> Value {
        let fleet_type =
            template.effective_fleet_type().unwrap_or(FleetType::Instant).as_str().to_string();
        let (on_demand, spot) = super::capacity_split(template, request.machine_count);
        let default_capacity_type = match template.price_type {
            PriceType::Spot => "spot",
            PriceType::Ondemand => "on-demand",
        };
        json!({
            "fleet_type": fleet_type,
            "default_capacity_type": default_capacity_type,
            "on_demand_count": on_demand,
            "spot_count": spot,
        })
    }

    /// Fleet configuration: rendered native spec when the template ships
    /// one, the default skeleton otherwise. Launch template configs, tags
    /// and capacity are overlaid either way.
    fn build_fleet_config(
        &self,
        template: &Template,
        request: &Request,
        launch_template_id: &str,
        launch_template_version: &str,
    ) -> Result<Value> {
        let context = self.render_context(template, request);
        let mut config = match self.deps.native_spec.process_provider_api_spec_with_merge(
            template,
            request,
            context.clone(),
        )? {
            Some(spec) => {
                info!(
                    "Using native provider API spec for EC2Fleet template {}",
                    template.template_id
                );
                spec
            }
            None => self.deps.native_spec.render_default_spec(
                ProviderApi::Ec2Fleet,
                template,
                request,
                context,
            )?,
        };

        let lt_config = json!({
            "LaunchTemplateSpecification": {
                "LaunchTemplateId": launch_template_id,
                "Version": launch_template_version,
            },
            "Overrides": launch_template_overrides(template),
        });
        if let Some(strategy) = template.allocation_strategy {
            let spot_options = config
                .get("SpotOptions")
                .cloned()
                .unwrap_or_else(|| json!({}));
            if spot_options.get("AllocationStrategy").is_none() {
                let mut spot_options = spot_options;
                spot_options["AllocationStrategy"] = json!(strategy.for_ec2_fleet());
                if let Some(pools) = template.aws.pools_count {
                    spot_options["InstancePoolsToUseCount"] = json!(pools);
                }
                config["SpotOptions"] = spot_options;
            }
        }
        config["LaunchTemplateConfigs"] = json!([lt_config]);
        if config.get("TagSpecifications").is_none() {
            config["TagSpecifications"] = tag_specifications(template, request, "fleet");
        }
        Ok(config)
    }
}

#[async_trait::async_trait]
impl AwsHandler for Ec2FleetHandler {
    fn provider_api(&self) -> ProviderApi {
        ProviderApi::Ec2Fleet
    }

    async fn acquire_hosts(
        &self,
        request: &Request,
        template: &Template,
    ) -> Result<AcquireOutcome> {
        if let Some(resource_ids) = self.deps.ledger.recorded(&request.request_id).await {
            info!(
                "Request {} already acquired fleet {:?}, returning recorded ids",
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
            self.build_fleet_config(template, request, &lt.template_id, &lt.version)?;

        let api = self.deps.ops.api().clone();
        let result = self
            .deps
            .ops
            .execute_critical("create_fleet", || {
                let config = config.clone();
                let api = api.clone();
                async move { api.create_fleet(config).await }
            })
            .await?;

        if !result.errors.is_empty() {
            if result.instance_ids.is_empty()
                && template.effective_fleet_type() == Some(FleetType::Instant)
            {
                return Err(BrokerError::Capacity {
                    message: format!(
                        "CreateFleet returned no instances: {}",
                        result.errors.join("; ")
                    ),
                    retry_after_secs: Some(30),
                });
            }
            warn!(
                "CreateFleet for request {} reported partial errors: {}",
                request.request_id,
                result.errors.join("; ")
            );
        }

        let instances = if result.instance_ids.is_empty() {
            Vec::new()
        } else {
            self.deps.ops.describe_instances_batched(&result.instance_ids).await.unwrap_or_else(
                |e| {
                    warn!("Failed to describe instant fleet instances: {}", e);
                    Vec::new()
                },
            )
        };

        info!(
            "Created EC2 fleet {} for request {} ({} immediate instances)",
            result.fleet_id,
            request.request_id,
            instances.len()
        );
        self.deps.ledger.record(&request.request_id, vec![result.fleet_id.clone()]).await;
        Ok(AcquireOutcome::succeeded(vec![result.fleet_id], instances))
    }

    async fn check_hosts_status(&self, request: &Request) -> Result<Vec<Machine>> {
        let mut machines = Vec::new();
        for resource_id in &request.resource_ids {
            let api = self.deps.ops.api().clone();
            let rid = resource_id.clone();
            let ids = match self
                .deps
                .ops
                .execute_standard("describe_fleet_instances", || {
                    let api = api.clone();
                    let rid = rid.clone();
                    async move { api.describe_fleet_instances(&rid).await }
                })
                .await
            {
                Ok(ids) => ids,
                Err(e) => {
                    error!("Failed to enumerate fleet {}: {}", resource_id, e);
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
            return Err(BrokerError::infrastructure("no fleet ids recorded on request"));
        }
        for resource_id in &request.resource_ids {
            let api = self.deps.ops.api().clone();
            let rid = resource_id.clone();
            self.deps
                .ops
                .execute_critical("delete_fleet", || {
                    let api = api.clone();
                    let rid = rid.clone();
                    async move { api.delete_fleet(&rid, true).await }
                })
                .await?;
            info!("Deleted EC2 fleet {}", resource_id);
        }
        // Terminate anything the fleet may have leaked.
        self.deps.ops.terminate_instances_with_fallback(&request.machine_references).await?;
        self.deps.ledger.forget(&request.request_id).await;
        Ok(())
    }
}

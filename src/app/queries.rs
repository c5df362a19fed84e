//! Queries and their handlers
//!
//! Queries are side-effect free: they read the persisted state and the
//! provider registry without mutating either. Status progression belongs to
//! the lifecycle poller, not to these handlers.

use crate::app::bus::{Query, QueryBus, QueryHandler};
use crate::app::capability::ValidationLevel;
use crate::app::wiring::AppCore;
use crate::domain::{Machine, Request, RequestStatus, Template};
use crate::error::{BrokerError, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

pub struct GetTemplate {
    pub template_id: String,
}

impl Query for GetTemplate {
    type Output = Template;
}

#[derive(Default)]
pub struct ListTemplates;

impl Query for ListTemplates {
    type Output = Vec<Template>;
}

pub struct GetRequestStatus {
    pub request_id: String,
}

/// Request state plus the scheduler-shaped machine payloads.
#[derive(Debug, Clone, Serialize)]
pub struct RequestStatusView {
    pub request: Request,
    pub machines: Vec<Value>,
    pub progress_percentage: f64,
}

impl Query for GetRequestStatus {
    type Output = RequestStatusView;
}

#[derive(Default)]
pub struct ListRequests {
    pub status: Option<RequestStatus>,
}

impl Query for ListRequests {
    type Output = Vec<Request>;
}

pub struct GetMachinesByRequest {
    pub request_id: String,
}

impl Query for GetMachinesByRequest {
    type Output = Vec<Machine>;
}

#[derive(Default)]
pub struct GetProviderInfo;

impl Query for GetProviderInfo {
    type Output = Value;
}

#[derive(Default)]
pub struct ValidateProviderConfig;

impl Query for ValidateProviderConfig {
    type Output = Value;
}

struct GetTemplateHandler {
    core: Arc<AppCore>,
}

#[async_trait]
impl QueryHandler<GetTemplate> for GetTemplateHandler {
    async fn handle(&self, query: GetTemplate) -> Result<Template> {
        self.core.templates.get_template(&query.template_id).await
    }
}

struct ListTemplatesHandler {
    core: Arc<AppCore>,
}

#[async_trait]
impl QueryHandler<ListTemplates> for ListTemplatesHandler {
    async fn handle(&self, _query: ListTemplates) -> Result<Vec<Template>> {
        self.core.templates.list_templates().await
    }
}

struct GetRequestStatusHandler {
    core: Arc<AppCore>,
}

#[async_trait]
impl QueryHandler<GetRequestStatus> for GetRequestStatusHandler {
    async fn handle(&self, query: GetRequestStatus) -> Result<RequestStatusView> {
        let request = self
            .core
            .uow
            .requests()
            .get_by_id(&query.request_id)
            .await?
            .ok_or_else(|| BrokerError::NotFound {
                entity: "request".to_string(),
                id: query.request_id.clone(),
            })?;
        let machines = self
            .core
            .uow
            .machines()
            .find_by(|m: &Machine| m.request_id == query.request_id)
            .await?;
        Ok(RequestStatusView {
            progress_percentage: request.get_progress_percentage(),
            machines: machines.iter().map(|m| m.to_scheduler_payload()).collect(),
            request,
        })
    }
}

struct ListRequestsHandler {
    core: Arc<AppCore>,
}

#[async_trait]
impl QueryHandler<ListRequests> for ListRequestsHandler {
    async fn handle(&self, query: ListRequests) -> Result<Vec<Request>> {
        let mut requests = match query.status {
            Some(status) => {
                self.core.uow.requests().find_by(|r: &Request| r.status == status).await?
            }
            None => self.core.uow.requests().find_all().await?,
        };
        requests.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(requests)
    }
}

struct GetMachinesByRequestHandler {
    core: Arc<AppCore>,
}

#[async_trait]
impl QueryHandler<GetMachinesByRequest> for GetMachinesByRequestHandler {
    async fn handle(&self, query: GetMachinesByRequest) -> Result<Vec<Machine>> {
        self.core.uow.machines().find_by(|m: &Machine| m.request_id == query.request_id).await
    }
}

struct GetProviderInfoHandler {
    core: Arc<AppCore>,
}

#[async_trait]
impl QueryHandler<GetProviderInfo> for GetProviderInfoHandler {
    async fn handle(&self, _query: GetProviderInfo) -> Result<Value> {
        let config = self.core.config.read().await;
        let metrics = self.core.provider_context.all_metrics().await;
        let instances: Vec<Value> = config
            .provider
            .providers
            .iter()
            .map(|p| {
                let m = metrics.get(&p.name);
                serde_json::json!({
                    "name": p.name,
                    "type": p.provider_type,
                    "enabled": p.enabled,
                    "priority": p.priority,
                    "weight": p.weight,
                    "capabilities": p.capabilities,
                    "total_operations": m.map(|m| m.total_operations).unwrap_or(0),
                    "success_rate": m.map(|m| m.success_rate).unwrap_or(0.0),
                })
            })
            .collect();
        Ok(serde_json::json!({
            "active_provider": self.core.provider_context.active_strategy_name().await,
            "selection_policy": format!("{:?}", config.provider.selection_policy),
            "instances": instances,
        }))
    }
}

struct ValidateProviderConfigHandler {
    core: Arc<AppCore>,
}

#[async_trait]
impl QueryHandler<ValidateProviderConfig> for ValidateProviderConfigHandler {
    async fn handle(&self, _query: ValidateProviderConfig) -> Result<Value> {
        let config = self.core.config.read().await;
        let templates = self.core.templates.list_templates().await?;
        let mut results = Vec::new();
        for template in &templates {
            let selection = self.core.selection.select(&config, template);
            let entry = match selection {
                Ok(selection) => {
                    let instance = config.find_provider_instance(&selection.provider_instance);
                    let validation = instance.map(|i| {
                        self.core.capability.validate_template_requirements(
                            template,
                            i,
                            None,
                            ValidationLevel::Lenient,
                        )
                    });
                    serde_json::json!({
                        "template_id": template.template_id,
                        "provider_instance": selection.provider_instance,
                        "is_valid": validation.as_ref().map(|v| v.is_valid).unwrap_or(false),
                        "errors": validation.as_ref().map(|v| v.errors.clone()).unwrap_or_default(),
                        "warnings": validation.map(|v| v.warnings).unwrap_or_default(),
                    })
                }
                Err(e) => serde_json::json!({
                    "template_id": template.template_id,
                    "is_valid": false,
                    "errors": [e.to_string()],
                }),
            };
            results.push(entry);
        }
        Ok(serde_json::json!({
            "enabled_instances": config.enabled_provider_instances().count(),
            "templates": results,
        }))
    }
}

/// Wire every query handler onto the bus.
pub async fn register_query_handlers(bus: &QueryBus, core: Arc<AppCore>) {
    bus.register::<GetTemplate, _>(Arc::new(GetTemplateHandler { core: core.clone() })).await;
    bus.register::<ListTemplates, _>(Arc::new(ListTemplatesHandler { core: core.clone() })).await;
    bus.register::<GetRequestStatus, _>(Arc::new(GetRequestStatusHandler { core: core.clone() }))
        .await;
    bus.register::<ListRequests, _>(Arc::new(ListRequestsHandler { core: core.clone() })).await;
    bus.register::<GetMachinesByRequest, _>(Arc::new(GetMachinesByRequestHandler {
        core: core.clone(),
    }))
    .await;
    bus.register::<GetProviderInfo, _>(Arc::new(GetProviderInfoHandler { core: core.clone() }))
        .await;
    bus.register::<ValidateProviderConfig, _>(Arc::new(ValidateProviderConfigHandler { core }))
        .await;
}

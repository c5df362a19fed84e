//! Commands and their handlers
//!
//! Commands mutate state and return the affected aggregate id. The
//! acquisition path resolves the template, selects a provider instance,
//! validates capability, persists the new request (publishing
//! `RequestCreated` on commit) and dispatches `CREATE_INSTANCES` through
//! the provider context. Provider errors translate into request-state
//! transitions: capacity and throttling leave the request retryable,
//! authorization and validation fail it.

use crate::app::bus::{Command, CommandBus, CommandHandler};
use crate::app::capability::ValidationLevel;
use crate::app::wiring::AppCore;
use crate::config::BrokerConfig;
use crate::domain::{Machine, Request, Template};
use crate::error::{BrokerError, Result};
use crate::provider::{OperationType, ProviderOperation, ProviderResult};
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct CreateAcquisitionRequest {
    pub template_id: String,
    pub machine_count: u32,
    pub requester_id: Option<String>,
    pub priority: Option<u8>,
    pub timeout_minutes: Option<i64>,
    pub tags: HashMap<String, String>,
}

impl CreateAcquisitionRequest {
    pub fn new(template_id: &str, machine_count: u32) -> Self {
        Self {
            template_id: template_id.to_string(),
            machine_count,
            requester_id: None,
            priority: None,
            timeout_minutes: None,
            tags: HashMap::new(),
        }
    }
}

impl Command for CreateAcquisitionRequest {}

#[derive(Debug, Clone)]
pub struct CreateReturnRequest {
    pub machine_ids: Vec<String>,
    pub reason: Option<String>,
}

impl Command for CreateReturnRequest {}

#[derive(Debug, Clone)]
pub struct CancelRequest {
    pub request_id: String,
    pub reason: String,
}

impl Command for CancelRequest {}

#[derive(Debug, Clone, Default)]
pub struct ReloadTemplates;

impl Command for ReloadTemplates {}

#[derive(Debug, Clone, Default)]
pub struct ReloadProviderConfig;

impl Command for ReloadProviderConfig {}

// -- acquisition -------------------------------------------------------------

pub struct CreateAcquisitionRequestHandler {
    core: Arc<AppCore>,
}

/// Dispatch CREATE_INSTANCES for a pending acquisition and apply the
/// outcome to the aggregate. Shared with the lifecycle poller's retry path.
pub(crate) async fn dispatch_acquisition(
    core: &AppCore,
    request: &mut Request,
    template: &Template,
) -> Result<()> {
    let operation = ProviderOperation::new(
        OperationType::CreateInstances,
        json!({
            "request": request,
            "template": template,
        }),
    )
    .with_correlation_id(&request.request_id);

    let instance_name = request.provider_name.clone().unwrap_or_default();
    let result = core.provider_context.execute_with_strategy(&instance_name, operation).await;
    apply_acquisition_result(request, result)
}

fn apply_acquisition_result(request: &mut Request, result: ProviderResult) -> Result<()> {
    if result.success {
        request.start_processing()?;
        if let Some(resource_ids) = result
            .data
            .as_ref()
            .and_then(|d| d.get("resource_ids"))
            .and_then(|v| v.as_array())
        {
            for id in resource_ids.iter().filter_map(|v| v.as_str()) {
                request.add_resource_id(id);
            }
        }
        // Synchronous paths (instant fleets, RunInstances) know their
        // instances immediately.
        if let Some(instance_ids) = result
            .data
            .as_ref()
            .and_then(|d| d.get("instance_ids"))
            .and_then(|v| v.as_array())
        {
            for id in instance_ids.iter().filter_map(|v| v.as_str()) {
                request.add_machine_reference(id);
            }
        }
        return Ok(());
    }

    let code = result.error_code.as_deref().unwrap_or("INFRASTRUCTURE_ERROR");
    let message = result
        .error_message
        .clone()
        .unwrap_or_else(|| "provider operation failed".to_string());
    match code {
        // Recoverable: stay pending, burn one retry, the poller re-dispatches.
        "INSUFFICIENT_CAPACITY" | "THROTTLING_ERROR" | "NETWORK_ERROR" => {
            if request.can_retry() {
                request.increment_retry_count(&message)?;
                warn!(
                    "Request {} provisioning deferred ({}), retry {}/{}",
                    request.request_id, code, request.retry_count, request.max_retries
                );
                Ok(())
            } else {
                request.start_processing()?;
                request.fail_with_error(&format!("retries exhausted: {message}"))?;
                Ok(())
            }
        }
        // Terminal: authorization, validation, configuration.
        _ => {
            request.start_processing()?;
            request.fail_with_error(&message)?;
            Ok(())
        }
    }
}

#[async_trait]
impl CommandHandler<CreateAcquisitionRequest> for CreateAcquisitionRequestHandler {
    async fn handle(&self, command: CreateAcquisitionRequest) -> Result<String> {
        let template = self.core.templates.get_template(&command.template_id).await?;
        let config: BrokerConfig = self.core.config.read().await.clone();

        let selection = self.core.selection.select(&config, &template)?;
        let instance = config
            .find_provider_instance(&selection.provider_instance)
            .ok_or_else(|| BrokerError::NotFound {
                entity: "provider_instance".to_string(),
                id: selection.provider_instance.clone(),
            })?;

        let validation = self.core.capability.validate_template_requirements(
            &template,
            instance,
            Some(command.machine_count),
            ValidationLevel::Strict,
        );
        if !validation.is_valid {
            return Err(BrokerError::Validation {
                field: "template".to_string(),
                reason: validation.errors.join("; "),
            });
        }

        let mut request = Request::new_acquisition(&command.template_id, command.machine_count)?;
        if let Some(priority) = command.priority {
            request = request.with_priority(priority)?;
        }
        if let Some(requester) = &command.requester_id {
            request = request.with_requester(requester);
        }
        if let Some(timeout) = command.timeout_minutes {
            request = request.with_timeout_minutes(timeout);
        }
        request.tags = command.tags.clone();
        request.record_provider(
            &selection.provider_instance,
            &selection.provider_type,
            template.provider_api.as_str(),
        );
        info!(
            "Created acquisition request {} for template {} ({}, {})",
            request.request_id,
            command.template_id,
            selection.provider_instance,
            selection.selection_reason
        );

        let request_id = request.request_id.clone();

        // Persist the pending request; RequestCreated publishes on commit.
        let uow = self.core.uow.begin_for_request(&request_id).await;
        uow.stage_request(&mut request).await?;
        uow.commit().await?;

        // Dispatch provisioning, then commit the resulting transition.
        dispatch_acquisition(&self.core, &mut request, &template).await?;
        let uow = self.core.uow.begin_for_request(&request_id).await;
        uow.stage_request(&mut request).await?;
        uow.commit().await?;

        Ok(request_id)
    }
}

// -- return ------------------------------------------------------------------

pub struct CreateReturnRequestHandler {
    core: Arc<AppCore>,
}

#[async_trait]
impl CommandHandler<CreateReturnRequest> for CreateReturnRequestHandler {
    async fn handle(&self, command: CreateReturnRequest) -> Result<String> {
        let machines_repo = self.core.uow.machines();
        let mut machines: Vec<Machine> = Vec::new();
        for machine_id in &command.machine_ids {
            let machine = machines_repo.get_by_id(machine_id).await?.ok_or_else(|| {
                BrokerError::NotFound { entity: "machine".to_string(), id: machine_id.clone() }
            })?;
            machines.push(machine);
        }

        let mut request =
            Request::new_return(command.machine_ids.clone(), command.reason.clone())?;
        for machine in &machines {
            request.add_resource_id(&machine.resource_id);
        }
        // Provider binding carries over from the machines being returned.
        if let Some(machine) = machines.first() {
            request.record_provider(
                machine.provider_name.as_deref().unwrap_or_default(),
                machine.provider_type.as_deref().unwrap_or_default(),
                machine.provider_api.as_deref().unwrap_or_default(),
            );
        }
        let request_id = request.request_id.clone();

        let uow = self.core.uow.begin_for_request(&request_id).await;
        uow.stage_request(&mut request).await?;
        uow.commit().await?;

        let operation = ProviderOperation::new(
            OperationType::TerminateInstances,
            json!({ "request": request }),
        )
        .with_correlation_id(&request_id);
        let instance_name = request.provider_name.clone().unwrap_or_default();
        let result =
            self.core.provider_context.execute_with_strategy(&instance_name, operation).await;

        request.start_processing()?;
        if result.success {
            request
                .complete_successfully(command.machine_ids.clone(), Some("hosts released".into()))?;
            for machine in &mut machines {
                machine.status = "terminated".to_string();
                machine.result = crate::domain::MachineResult::Fail;
            }
        } else {
            let message = result
                .error_message
                .unwrap_or_else(|| "release failed".to_string());
            request.fail_with_error(&message)?;
        }

        let uow = self.core.uow.begin_for_request(&request_id).await;
        uow.stage_request(&mut request).await?;
        for machine in &machines {
            uow.stage_machine(machine).await?;
        }
        uow.commit().await?;

        Ok(request_id)
    }
}

// -- cancel ------------------------------------------------------------------

pub struct CancelRequestHandler {
    core: Arc<AppCore>,
}

#[async_trait]
impl CommandHandler<CancelRequest> for CancelRequestHandler {
    async fn handle(&self, command: CancelRequest) -> Result<String> {
        let uow = self.core.uow.begin_for_request(&command.request_id).await;
        let mut request = self
            .core
            .uow
            .requests()
            .get_by_id(&command.request_id)
            .await?
            .ok_or_else(|| BrokerError::NotFound {
                entity: "request".to_string(),
                id: command.request_id.clone(),
            })?;
        request.cancel(&command.reason)?;
        uow.stage_request(&mut request).await?;
        uow.commit().await?;
        info!("Cancelled request {}: {}", command.request_id, command.reason);
        Ok(command.request_id)
    }
}

// -- reloads -----------------------------------------------------------------

pub struct ReloadTemplatesHandler {
    core: Arc<AppCore>,
}

#[async_trait]
impl CommandHandler<ReloadTemplates> for ReloadTemplatesHandler {
    async fn handle(&self, _command: ReloadTemplates) -> Result<String> {
        let loaded = self.core.templates.reload().await?;
        info!("Reloaded {} templates", loaded.templates.len());
        Ok(loaded.templates.len().to_string())
    }
}

pub struct ReloadProviderConfigHandler {
    core: Arc<AppCore>,
}

#[async_trait]
impl CommandHandler<ReloadProviderConfig> for ReloadProviderConfigHandler {
    async fn handle(&self, _command: ReloadProviderConfig) -> Result<String> {
        let fresh = BrokerConfig::load(self.core.config_path.as_deref())?;
        *self.core.config.write().await = fresh;
        let registered = self.core.register_strategies().await?;
        Ok(registered.to_string())
    }
}

/// Wire every command handler onto the bus.
pub async fn register_command_handlers(bus: &CommandBus, core: Arc<AppCore>) {
    bus.register::<CreateAcquisitionRequest, _>(Arc::new(CreateAcquisitionRequestHandler {
        core: core.clone(),
    }))
    .await;
    bus.register::<CreateReturnRequest, _>(Arc::new(CreateReturnRequestHandler {
        core: core.clone(),
    }))
    .await;
    bus.register::<CancelRequest, _>(Arc::new(CancelRequestHandler { core: core.clone() })).await;
    bus.register::<ReloadTemplates, _>(Arc::new(ReloadTemplatesHandler { core: core.clone() }))
        .await;
    bus.register::<ReloadProviderConfig, _>(Arc::new(ReloadProviderConfigHandler { core })).await;
}

//! AWS provider strategy
//!
//! One strategy per configured AWS provider instance. Routes dispatched
//! operations to the handler matching the template's provider API and
//! declares capabilities from the instance configuration.

use crate::aws::api::AwsApi;
use crate::aws::handlers::AwsHandler;
use crate::domain::{ProviderApi, Request, Template};
use crate::error::{BrokerError, Result};
use crate::provider::{
    OperationType, ProviderCapabilities, ProviderHealthStatus, ProviderOperation,
    ProviderResult, ProviderStrategy,
};
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct AwsProviderStrategy {
    name: String,
    capabilities: Vec<String>,
    handlers: HashMap<ProviderApi, Arc<dyn AwsHandler>>,
    api: Arc<dyn AwsApi>,
    initialized: AtomicBool,
}

impl AwsProviderStrategy {
    pub fn new(
        name: &str,
        capabilities: Vec<String>,
        handlers: HashMap<ProviderApi, Arc<dyn AwsHandler>>,
        api: Arc<dyn AwsApi>,
    ) -> Self {
        Self {
            name: name.to_string(),
            capabilities,
            handlers,
            api,
            initialized: AtomicBool::new(false),
        }
    }

    fn parse_request(operation: &ProviderOperation) -> Result<Request> {
        let value = operation
            .param("request")
            .cloned()
            .ok_or_else(|| BrokerError::Validation {
                field: "request".to_string(),
                reason: "operation parameters missing 'request'".to_string(),
            })?;
        Ok(serde_json::from_value(value)?)
    }

    fn parse_template(operation: &ProviderOperation) -> Result<Template> {
        let value = operation
            .param("template")
            .cloned()
            .ok_or_else(|| BrokerError::Validation {
                field: "template".to_string(),
                reason: "operation parameters missing 'template'".to_string(),
            })?;
        Template::from_value(value)
    }

    fn handler_for(&self, api: ProviderApi) -> Result<&Arc<dyn AwsHandler>> {
        self.handlers.get(&api).ok_or_else(|| BrokerError::ProviderOperation {
            code: crate::error::ProviderOperationErrorCode::OperationNotSupported,
            message: format!("no handler registered for provider API {api}"),
        })
    }

    fn handler_for_request(&self, request: &Request) -> Result<&Arc<dyn AwsHandler>> {
        let api = request
            .provider_api
            .as_deref()
            .ok_or_else(|| BrokerError::Validation {
                field: "provider_api".to_string(),
                reason: "request carries no provider API".to_string(),
            })
            .and_then(ProviderApi::parse)?;
        self.handler_for(api)
    }

    async fn dispatch(&self, operation: &ProviderOperation) -> Result<serde_json::Value> {
        match operation.operation_type {
            OperationType::CreateInstances => {
                let request = Self::parse_request(operation)?;
                let template = Self::parse_template(operation)?;
                let handler = self.handler_for(template.provider_api)?;
                let outcome = handler.acquire_hosts(&request, &template).await?;
                if !outcome.success {
                    return Err(BrokerError::infrastructure(
                        outcome
                            .error_message
                            .unwrap_or_else(|| "acquisition failed".to_string()),
                    ));
                }
                let instance_ids: Vec<String> =
                    outcome.instances.iter().map(|i| i.instance_id.clone()).collect();
                Ok(json!({
                    "resource_ids": outcome.resource_ids,
                    "instance_ids": instance_ids,
                }))
            }
            OperationType::GetInstanceStatus => {
                let request = Self::parse_request(operation)?;
                let handler = self.handler_for_request(&request)?;
                let machines = handler.check_hosts_status(&request).await?;
                Ok(json!({ "machines": machines }))
            }
            OperationType::TerminateInstances => {
                let request = Self::parse_request(operation)?;
                let handler = self.handler_for_request(&request)?;
                handler.release_hosts(&request).await?;
                Ok(json!({ "released": true }))
            }
            OperationType::ValidateTemplate => {
                let template = Self::parse_template(operation)?;
                template.validate()?;
                self.handler_for(template.provider_api)?;
                Ok(json!({ "valid": true }))
            }
            OperationType::GetAvailableTemplates => {
                // Template discovery lives in the configuration manager; the
                // strategy only reports which APIs it can serve.
                Ok(json!({ "provider_apis": self.capabilities }))
            }
        }
    }
}

#[async_trait]
impl ProviderStrategy for AwsProviderStrategy {
    fn provider_type(&self) -> &str {
        "aws"
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&self) -> Result<()> {
        self.initialized.store(true, Ordering::SeqCst);
        debug!("Initialized AWS provider strategy '{}'", self.name);
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    async fn cleanup(&self) {
        self.initialized.store(false, Ordering::SeqCst);
    }

    async fn execute_operation(&self, operation: ProviderOperation) -> ProviderResult {
        match self.dispatch(&operation).await {
            Ok(data) => ProviderResult::ok(data),
            Err(e) => {
                warn!(
                    "AWS strategy '{}' failed {}: {}",
                    self.name, operation.operation_type, e
                );
                ProviderResult::fail(e.error_code(), e.to_string())
            }
        }
    }

    fn get_capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            provider_apis: self.capabilities.clone(),
            supported_operations: vec![
                OperationType::CreateInstances,
                OperationType::TerminateInstances,
                OperationType::GetInstanceStatus,
                OperationType::ValidateTemplate,
                OperationType::GetAvailableTemplates,
            ],
            max_machines_per_request: Some(1000),
        }
    }

    async fn check_health(&self) -> ProviderHealthStatus {
        match self.api.ping().await {
            Ok(()) => ProviderHealthStatus::healthy(),
            Err(e) => ProviderHealthStatus::unhealthy(format!("AWS ping failed: {e}")),
        }
    }
}

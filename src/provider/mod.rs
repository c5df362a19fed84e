//! Provider-agnostic strategy definitions
//!
//! A provider strategy is one configured incarnation of a provider type
//! (e.g. `aws-us-east-1`). Strategies expose a narrow capability set; the
//! `ProviderContext` registry routes operations to them and records
//! per-strategy metrics. Composite strategies (fallback, load balancing)
//! wrap children behind the same trait.

pub mod balance;
pub mod context;
pub mod fallback;
pub mod metrics;

pub use balance::{BalancingAlgorithm, LoadBalancingStrategy};
pub use context::ProviderContext;
pub use fallback::FallbackStrategy;
pub use metrics::{StrategyMetrics, StrategyMetricsSnapshot};

use crate::error::{ProviderOperationErrorCode, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Operations a strategy can be asked to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationType {
    CreateInstances,
    TerminateInstances,
    GetInstanceStatus,
    ValidateTemplate,
    GetAvailableTemplates,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::CreateInstances => "CREATE_INSTANCES",
            OperationType::TerminateInstances => "TERMINATE_INSTANCES",
            OperationType::GetInstanceStatus => "GET_INSTANCE_STATUS",
            OperationType::ValidateTemplate => "VALIDATE_TEMPLATE",
            OperationType::GetAvailableTemplates => "GET_AVAILABLE_TEMPLATES",
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller metadata threaded through a dispatch.
#[derive(Debug, Clone, Default)]
pub struct OperationContext {
    pub correlation_id: Option<String>,
    pub caller: Option<String>,
}

/// A single unit of work dispatched to a strategy.
#[derive(Debug, Clone)]
pub struct ProviderOperation {
    pub operation_type: OperationType,
    /// Operation parameters as a JSON object (request, template, ids...).
    pub parameters: serde_json::Value,
    pub context: OperationContext,
}

impl ProviderOperation {
    pub fn new(operation_type: OperationType, parameters: serde_json::Value) -> Self {
        Self { operation_type, parameters, context: OperationContext::default() }
    }

    pub fn with_correlation_id(mut self, id: &str) -> Self {
        self.context.correlation_id = Some(id.to_string());
        self
    }

    pub fn param(&self, key: &str) -> Option<&serde_json::Value> {
        self.parameters.get(key)
    }
}

/// Outcome of a dispatched operation.
#[derive(Debug, Clone)]
pub struct ProviderResult {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub metadata: Option<HashMap<String, String>>,
    pub error_message: Option<String>,
    pub error_code: Option<String>,
}

impl ProviderResult {
    pub fn ok(data: serde_json::Value) -> Self {
        Self { success: true, data: Some(data), metadata: None, error_message: None, error_code: None }
    }

    pub fn fail(code: &str, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            metadata: None,
            error_message: Some(message.into()),
            error_code: Some(code.to_string()),
        }
    }

    pub fn operation_error(code: ProviderOperationErrorCode, message: impl Into<String>) -> Self {
        Self::fail(code.as_str(), message)
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.get_or_insert_with(HashMap::new).insert(key.to_string(), value.to_string());
        self
    }
}

/// What a strategy declares it can do.
#[derive(Debug, Clone, Default)]
pub struct ProviderCapabilities {
    /// Provider APIs this instance supports (e.g. "EC2Fleet").
    pub provider_apis: Vec<String>,
    pub supported_operations: Vec<OperationType>,
    pub max_machines_per_request: Option<u32>,
}

impl ProviderCapabilities {
    pub fn supports_operation(&self, op: OperationType) -> bool {
        self.supported_operations.contains(&op)
    }

    pub fn supports_api(&self, api: &str) -> bool {
        self.provider_apis.iter().any(|a| a == api)
    }
}

#[derive(Debug, Clone)]
pub struct ProviderHealthStatus {
    pub healthy: bool,
    pub message: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl ProviderHealthStatus {
    pub fn healthy() -> Self {
        Self { healthy: true, message: None, checked_at: Utc::now() }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self { healthy: false, message: Some(message.into()), checked_at: Utc::now() }
    }
}

/// Capability set every provider strategy implements.
#[async_trait]
pub trait ProviderStrategy: Send + Sync {
    /// Provider family (e.g. "aws").
    fn provider_type(&self) -> &str;

    /// Instance name; the registry key. Defaults to the provider type for
    /// single-instance strategies.
    fn name(&self) -> &str {
        self.provider_type()
    }

    async fn initialize(&self) -> Result<()>;

    fn is_initialized(&self) -> bool;

    /// Release held resources; called when the strategy is replaced or the
    /// context shuts down.
    async fn cleanup(&self);

    async fn execute_operation(&self, operation: ProviderOperation) -> ProviderResult;

    fn get_capabilities(&self) -> ProviderCapabilities;

    async fn check_health(&self) -> ProviderHealthStatus;
}

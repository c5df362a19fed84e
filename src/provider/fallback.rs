//! Fallback composite strategy
//!
//! Wraps an ordered list of child strategies; an operation runs against each
//! child in turn until one succeeds. The last failure is returned when every
//! child fails.

use crate::error::{ProviderOperationErrorCode, Result};
use crate::provider::{
    ProviderCapabilities, ProviderHealthStatus, ProviderOperation, ProviderResult,
    ProviderStrategy,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

pub struct FallbackStrategy {
    name: String,
    children: Vec<Arc<dyn ProviderStrategy>>,
    fallback_used_total: AtomicU64,
}

impl FallbackStrategy {
    pub fn new(name: &str, children: Vec<Arc<dyn ProviderStrategy>>) -> Self {
        Self { name: name.to_string(), children, fallback_used_total: AtomicU64::new(0) }
    }

    /// How many times a non-primary child served an operation.
    pub fn fallback_used_total(&self) -> u64 {
        self.fallback_used_total.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderStrategy for FallbackStrategy {
    fn provider_type(&self) -> &str {
        "composite-fallback"
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&self) -> Result<()> {
        for child in &self.children {
            child.initialize().await?;
        }
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.children.iter().all(|c| c.is_initialized())
    }

    async fn cleanup(&self) {
        for child in &self.children {
            child.cleanup().await;
        }
    }

    async fn execute_operation(&self, operation: ProviderOperation) -> ProviderResult {
        let mut last_failure: Option<ProviderResult> = None;

        for (index, child) in self.children.iter().enumerate() {
            let result = child.execute_operation(operation.clone()).await;
            if result.success {
                if index > 0 {
                    self.fallback_used_total.fetch_add(1, Ordering::SeqCst);
                }
                return result.with_metadata("served_by", child.name());
            }
            warn!(
                "Fallback child '{}' failed ({}), advancing",
                child.name(),
                result.error_message.as_deref().unwrap_or("unknown error")
            );
            last_failure = Some(result);
        }

        last_failure.unwrap_or_else(|| {
            ProviderResult::operation_error(
                ProviderOperationErrorCode::NoStrategyAvailable,
                "fallback strategy has no children",
            )
        })
    }

    fn get_capabilities(&self) -> ProviderCapabilities {
        // Union of child capabilities.
        let mut capabilities = ProviderCapabilities::default();
        for child in &self.children {
            let c = child.get_capabilities();
            for api in c.provider_apis {
                if !capabilities.provider_apis.contains(&api) {
                    capabilities.provider_apis.push(api);
                }
            }
            for op in c.supported_operations {
                if !capabilities.supported_operations.contains(&op) {
                    capabilities.supported_operations.push(op);
                }
            }
        }
        capabilities
    }

    async fn check_health(&self) -> ProviderHealthStatus {
        for child in &self.children {
            if child.check_health().await.healthy {
                return ProviderHealthStatus::healthy();
            }
        }
        ProviderHealthStatus::unhealthy("all fallback children unhealthy")
    }
}

//! Strategy registry and operation router
//!
//! `ProviderContext` owns every registered strategy, tracks the active one,
//! verifies declared capabilities before dispatch and records per-strategy
//! metrics. Registration takes a write lock; dispatch holds no lock beyond
//! the strategy's own.

use crate::error::{BrokerError, ProviderOperationErrorCode, Result};
use crate::provider::metrics::{StrategyMetrics, StrategyMetricsSnapshot};
use crate::provider::{ProviderOperation, ProviderResult, ProviderStrategy};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{info, warn};

struct Registered {
    strategy: Arc<dyn ProviderStrategy>,
    metrics: Arc<StrategyMetrics>,
}

pub struct ProviderContext {
    strategies: RwLock<HashMap<String, Registered>>,
    active: RwLock<Option<String>>,
}

impl ProviderContext {
    pub fn new() -> Self {
        Self { strategies: RwLock::new(HashMap::new()), active: RwLock::new(None) }
    }

    /// Register a strategy under its instance name. A duplicate key replaces
    /// the previous strategy, which gets `cleanup()` before it is dropped.
    pub async fn register_strategy(&self, strategy: Arc<dyn ProviderStrategy>) {
        let key = strategy.name().to_string();
        let replaced = {
            let mut strategies = self.strategies.write().await;
            strategies.insert(
                key.clone(),
                Registered { strategy, metrics: Arc::new(StrategyMetrics::new()) },
            )
        };
        if let Some(previous) = replaced {
            warn!("Replacing provider strategy '{}'", key);
            previous.strategy.cleanup().await;
        } else {
            info!("Registered provider strategy '{}'", key);
        }

        let mut active = self.active.write().await;
        if active.is_none() {
            *active = Some(key);
        }
    }

    /// Switch the active strategy.
    pub async fn set_strategy(&self, name: &str) -> Result<()> {
        if !self.strategies.read().await.contains_key(name) {
            return Err(BrokerError::ProviderOperation {
                code: ProviderOperationErrorCode::StrategyNotFound,
                message: format!("strategy '{name}' is not registered"),
            });
        }
        *self.active.write().await = Some(name.to_string());
        Ok(())
    }

    pub async fn active_strategy_name(&self) -> Option<String> {
        self.active.read().await.clone()
    }

    pub async fn registered_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.strategies.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Dispatch to the active strategy.
    pub async fn execute_operation(&self, operation: ProviderOperation) -> ProviderResult {
        let Some(name) = self.active.read().await.clone() else {
            return ProviderResult::operation_error(
                ProviderOperationErrorCode::NoStrategyAvailable,
                "no provider strategy registered",
            );
        };
        self.execute_with_strategy(&name, operation).await
    }

    /// Dispatch to a specific strategy regardless of the active one. Only the
    /// named strategy's metrics are touched.
    pub async fn execute_with_strategy(
        &self,
        name: &str,
        operation: ProviderOperation,
    ) -> ProviderResult {
        let (strategy, metrics) = {
            let strategies = self.strategies.read().await;
            match strategies.get(name) {
                Some(r) => (r.strategy.clone(), r.metrics.clone()),
                None => {
                    return ProviderResult::operation_error(
                        ProviderOperationErrorCode::StrategyNotFound,
                        format!("strategy '{name}' is not registered"),
                    )
                }
            }
        };

        // Capability gate before the strategy is invoked at all.
        if !strategy.get_capabilities().supports_operation(operation.operation_type) {
            return ProviderResult::operation_error(
                ProviderOperationErrorCode::OperationNotSupported,
                format!(
                    "strategy '{name}' does not support {}",
                    operation.operation_type
                ),
            );
        }

        let started = Instant::now();
        let result = strategy.execute_operation(operation).await;
        metrics.record_operation(result.success, started.elapsed());
        result
    }

    pub async fn check_strategy_health(
        &self,
        name: &str,
    ) -> Result<crate::provider::ProviderHealthStatus> {
        let (strategy, metrics) = {
            let strategies = self.strategies.read().await;
            match strategies.get(name) {
                Some(r) => (r.strategy.clone(), r.metrics.clone()),
                None => {
                    return Err(BrokerError::ProviderOperation {
                        code: ProviderOperationErrorCode::StrategyNotFound,
                        message: format!("strategy '{name}' is not registered"),
                    })
                }
            }
        };
        metrics.record_health_check();
        Ok(strategy.check_health().await)
    }

    pub async fn strategy_metrics(&self, name: &str) -> Option<StrategyMetricsSnapshot> {
        self.strategies.read().await.get(name).map(|r| r.metrics.snapshot())
    }

    pub async fn all_metrics(&self) -> HashMap<String, StrategyMetricsSnapshot> {
        self.strategies
            .read()
            .await
            .iter()
            .map(|(name, r)| (name.clone(), r.metrics.snapshot()))
            .collect()
    }

    /// Cleanup every registered strategy (shutdown path).
    pub async fn cleanup_all(&self) {
        let strategies = {
            let mut map = self.strategies.write().await;
            std::mem::take(&mut *map)
        };
        for (name, registered) in strategies {
            info!("Cleaning up provider strategy '{}'", name);
            registered.strategy.cleanup().await;
        }
        *self.active.write().await = None;
    }
}

impl Default for ProviderContext {
    fn default() -> Self {
        Self::new()
    }
}

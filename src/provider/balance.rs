//! Load-balancing composite strategy
//!
//! Distributes operations across child strategies by a configured
//! algorithm. Unhealthy children are skipped; health is refreshed lazily on
//! a cadence rather than per dispatch.

use crate::config::SelectionPolicy;
use crate::error::{ProviderOperationErrorCode, Result};
use crate::provider::metrics::StrategyMetrics;
use crate::provider::{
    ProviderCapabilities, ProviderHealthStatus, ProviderOperation, ProviderResult,
    ProviderStrategy,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalancingAlgorithm {
    RoundRobin,
    Weighted,
    CapabilityBased,
    FastestResponse,
}

impl From<SelectionPolicy> for BalancingAlgorithm {
    fn from(policy: SelectionPolicy) -> Self {
        match policy {
            SelectionPolicy::RoundRobin => BalancingAlgorithm::RoundRobin,
            SelectionPolicy::WeightedRoundRobin => BalancingAlgorithm::Weighted,
            SelectionPolicy::CapabilityBased => BalancingAlgorithm::CapabilityBased,
            SelectionPolicy::FastestResponse => BalancingAlgorithm::FastestResponse,
            SelectionPolicy::FirstAvailable => BalancingAlgorithm::RoundRobin,
        }
    }
}

struct Child {
    strategy: Arc<dyn ProviderStrategy>,
    weight: u32,
    healthy: AtomicBool,
    metrics: StrategyMetrics,
}

pub struct LoadBalancingStrategy {
    name: String,
    algorithm: BalancingAlgorithm,
    children: Vec<Child>,
    cursor: AtomicUsize,
}

impl LoadBalancingStrategy {
    pub fn new(
        name: &str,
        algorithm: BalancingAlgorithm,
        children: Vec<(Arc<dyn ProviderStrategy>, u32)>,
    ) -> Self {
        Self {
            name: name.to_string(),
            algorithm,
            children: children
                .into_iter()
                .map(|(strategy, weight)| Child {
                    strategy,
                    weight,
                    healthy: AtomicBool::new(true),
                    metrics: StrategyMetrics::new(),
                })
                .collect(),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Re-probe child health; callers run this on the configured cadence.
    pub async fn refresh_health(&self) {
        for child in &self.children {
            let status = child.strategy.check_health().await;
            child.healthy.store(status.healthy, Ordering::SeqCst);
        }
    }

    fn eligible(&self, operation: &ProviderOperation) -> Vec<usize> {
        self.children
            .iter()
            .enumerate()
            .filter(|(_, c)| c.healthy.load(Ordering::SeqCst))
            .filter(|(_, c)| {
                c.strategy.get_capabilities().supports_operation(operation.operation_type)
            })
            .map(|(i, _)| i)
            .collect()
    }

    fn pick(&self, eligible: &[usize]) -> Option<usize> {
        if eligible.is_empty() {
            return None;
        }
        let chosen = match self.algorithm {
            BalancingAlgorithm::RoundRobin | BalancingAlgorithm::CapabilityBased => {
                let n = self.cursor.fetch_add(1, Ordering::SeqCst);
                eligible[n % eligible.len()]
            }
            BalancingAlgorithm::Weighted => {
                let total: u64 =
                    eligible.iter().map(|&i| u64::from(self.children[i].weight.max(1))).sum();
                let mut roll = fastrand::u64(0..total.max(1));
                let mut selected = eligible[0];
                for &i in eligible {
                    let w = u64::from(self.children[i].weight.max(1));
                    if roll < w {
                        selected = i;
                        break;
                    }
                    roll -= w;
                }
                selected
            }
            BalancingAlgorithm::FastestResponse => *eligible
                .iter()
                .min_by(|&&a, &&b| {
                    let ta = self.children[a].metrics.snapshot().average_response_time_ms;
                    let tb = self.children[b].metrics.snapshot().average_response_time_ms;
                    ta.partial_cmp(&tb).unwrap_or(std::cmp::Ordering::Equal)
                })
                .unwrap_or(&eligible[0]),
        };
        Some(chosen)
    }
}

#[async_trait]
impl ProviderStrategy for LoadBalancingStrategy {
    fn provider_type(&self) -> &str {
        "composite-load-balancing"
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&self) -> Result<()> {
        for child in &self.children {
            child.strategy.initialize().await?;
        }
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.children.iter().all(|c| c.strategy.is_initialized())
    }

    async fn cleanup(&self) {
        for child in &self.children {
            child.strategy.cleanup().await;
        }
    }

    async fn execute_operation(&self, operation: ProviderOperation) -> ProviderResult {
        let eligible = self.eligible(&operation);
        let Some(index) = self.pick(&eligible) else {
            return ProviderResult::operation_error(
                ProviderOperationErrorCode::NoStrategyAvailable,
                "no healthy child supports the operation",
            );
        };

        let child = &self.children[index];
        let started = Instant::now();
        let result = child.strategy.execute_operation(operation).await;
        child.metrics.record_operation(result.success, started.elapsed());
        result.with_metadata("served_by", child.strategy.name())
    }

    fn get_capabilities(&self) -> ProviderCapabilities {
        let mut capabilities = ProviderCapabilities::default();
        for child in &self.children {
            let c = child.strategy.get_capabilities();
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
        self.refresh_health().await;
        if self.children.iter().any(|c| c.healthy.load(Ordering::SeqCst)) {
            ProviderHealthStatus::healthy()
        } else {
            ProviderHealthStatus::unhealthy("no healthy children")
        }
    }
}

//! Standardized execution of AWS operations
//!
//! Wraps every provisioning call in the per-call retry policy; critical
//! operations (create/terminate/modify) additionally pass through the
//! circuit breaker. Batch helpers split id lists by the configured batch
//! sizes and keep going on partial failure.

use crate::aws::api::{AwsApi, InstanceInfo};
use crate::aws::instrumentation::AwsApiMetrics;
use crate::config::{CircuitBreakerConfig, PerformanceConfig};
use crate::error::{BrokerError, Result};
use crate::retry::{CircuitBreaker, ExponentialBackoffPolicy, RetryPolicy};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const DEFAULT_TERMINATE_BATCH: usize = 50;
const DEFAULT_DESCRIBE_BATCH: usize = 100;

pub struct AwsOperations {
    api: Arc<dyn AwsApi>,
    retry: ExponentialBackoffPolicy,
    breaker: CircuitBreaker,
    metrics: Option<Arc<AwsApiMetrics>>,
    terminate_batch: usize,
    describe_batch: usize,
}

impl AwsOperations {
    pub fn new(
        api: Arc<dyn AwsApi>,
        breaker_config: &CircuitBreakerConfig,
        performance: &PerformanceConfig,
    ) -> Self {
        let breaker = CircuitBreaker::new(
            breaker_config.enabled,
            breaker_config.failure_threshold,
            Duration::from_secs(breaker_config.recovery_timeout),
        );
        let (terminate_batch, describe_batch) = if performance.enable_batching {
            (
                performance
                    .batch_sizes
                    .get("terminate_instances")
                    .copied()
                    .unwrap_or(DEFAULT_TERMINATE_BATCH),
                performance
                    .batch_sizes
                    .get("describe_instances")
                    .copied()
                    .unwrap_or(DEFAULT_DESCRIBE_BATCH),
            )
        } else {
            (usize::MAX, usize::MAX)
        };
        Self {
            api,
            retry: ExponentialBackoffPolicy::for_cloud_api(),
            breaker,
            metrics: None,
            terminate_batch,
            describe_batch,
        }
    }

    /// Attach the shared recorder so request-level retries count into
    /// `retries_total`.
    pub fn with_metrics(mut self, metrics: Arc<AwsApiMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn api(&self) -> &Arc<dyn AwsApi> {
        &self.api
    }

    /// Run a read/idempotent operation with retries.
    pub async fn execute_standard<T, F, Fut>(&self, operation_name: &str, f: F) -> Result<T>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let attempts = AtomicU32::new(0);
        let result = self
            .retry
            .execute_with_retry(|| {
                attempts.fetch_add(1, Ordering::SeqCst);
                f()
            })
            .await;
        self.count_retries(attempts.load(Ordering::SeqCst));
        result.map_err(|e| {
            warn!("AWS operation '{}' failed: {}", operation_name, e);
            e
        })
    }

    /// Run a critical operation (create/terminate/modify) under the circuit
    /// breaker, retries inside.
    pub async fn execute_critical<T, F, Fut>(&self, operation_name: &str, f: F) -> Result<T>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let attempts = AtomicU32::new(0);
        let result = self
            .breaker
            .call(|| {
                self.retry.execute_with_retry(|| {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    f()
                })
            })
            .await;
        self.count_retries(attempts.load(Ordering::SeqCst));
        result.map_err(|e| {
            warn!("Critical AWS operation '{}' failed: {}", operation_name, e);
            e
        })
    }

    fn count_retries(&self, attempts: u32) {
        if let Some(metrics) = &self.metrics {
            for _ in 1..attempts.max(1) {
                metrics.record_retry();
            }
        }
    }

    /// Terminate instances in batches; a failed batch is logged and the rest
    /// still proceed, then the first failure is reported.
    pub async fn terminate_instances_with_fallback(&self, instance_ids: &[String]) -> Result<()> {
        if instance_ids.is_empty() {
            return Ok(());
        }
        let mut first_error = None;
        for batch in instance_ids.chunks(self.terminate_batch.max(1)) {
            let batch_vec: Vec<String> = batch.to_vec();
            let result = self
                .execute_critical("terminate_instances", || {
                    let ids = batch_vec.clone();
                    let api = self.api.clone();
                    async move { api.terminate_instances(ids).await }
                })
                .await;
            if let Err(e) = result {
                warn!("Failed to terminate batch of {} instances: {}", batch.len(), e);
                if first_error.is_none() {
                    first_error = Some(e);
                }
            } else {
                info!("Terminated {} instances", batch.len());
            }
        }
        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Describe instances in batches, concatenating pages.
    pub async fn describe_instances_batched(
        &self,
        instance_ids: &[String],
    ) -> Result<Vec<InstanceInfo>> {
        if instance_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut all = Vec::with_capacity(instance_ids.len());
        for batch in instance_ids.chunks(self.describe_batch.max(1)) {
            let batch_vec: Vec<String> = batch.to_vec();
            let infos = self
                .execute_standard("describe_instances", || {
                    let ids = batch_vec.clone();
                    let api = self.api.clone();
                    async move { api.describe_instances(ids).await }
                })
                .await?;
            all.extend(infos);
        }
        Ok(all)
    }

    /// Validate that a result-bearing acquire produced usable output.
    pub fn ensure_resource_id(resource_id: &str, what: &str) -> Result<()> {
        if resource_id.is_empty() {
            return Err(BrokerError::infrastructure(format!("{what} returned an empty resource id")));
        }
        Ok(())
    }
}

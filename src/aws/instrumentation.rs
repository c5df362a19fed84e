//! AWS API call instrumentation
//!
//! Records per-call counters overall and per `service.operation`, durations,
//! error buckets, the throttling family and best-effort response sizes.
//! Operation names are normalized to lowercase snake_case. The SDK adapter
//! opens a call context before each request and consumes it afterwards, so
//! contexts never leak across retries; the correlation id survives retries.

use crate::config::AwsMetricsConfig;
use crate::error::BrokerError;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Error codes counted into `throttling_total`.
pub const THROTTLING_ERROR_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "RequestLimitExceeded",
    "TooManyRequestsException",
    "ProvisionedThroughputExceededException",
];

pub fn is_throttling_code(code: &str) -> bool {
    THROTTLING_ERROR_CODES.contains(&code)
}

/// Normalize an operation name to lowercase snake_case
/// (`CreateFleet` -> `create_fleet`).
pub fn normalize_operation_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, c) in name.chars().enumerate() {
        if c.is_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

#[derive(Debug, Default, Clone)]
pub struct OperationStats {
    pub calls_total: u64,
    pub success_total: u64,
    pub errors_total: u64,
    pub total_duration: Duration,
    pub response_bytes: u64,
}

#[derive(Debug, Default)]
struct MetricsState {
    calls_total: u64,
    success_total: u64,
    errors_total: u64,
    retries_total: u64,
    throttling_total: u64,
    per_operation: HashMap<String, OperationStats>,
    errors_by_kind: HashMap<String, u64>,
}

/// Per-call context; created before the request, consumed after it.
#[derive(Debug)]
pub struct CallContext {
    pub correlation_id: String,
    pub service: String,
    pub operation: String,
    started: Instant,
    recorded: bool,
}

/// Shared recorder attached to the SDK adapter.
pub struct AwsApiMetrics {
    config: AwsMetricsConfig,
    state: Mutex<MetricsState>,
}

#[derive(Debug, Clone)]
pub struct AwsApiMetricsSnapshot {
    pub calls_total: u64,
    pub success_total: u64,
    pub errors_total: u64,
    pub retries_total: u64,
    pub throttling_total: u64,
    pub per_operation: HashMap<String, OperationStats>,
    pub errors_by_kind: HashMap<String, u64>,
}

impl AwsApiMetrics {
    pub fn new(config: AwsMetricsConfig) -> Self {
        Self { config, state: Mutex::new(MetricsState::default()) }
    }

    pub fn disabled() -> Self {
        Self::new(AwsMetricsConfig { aws_metrics_enabled: false, ..AwsMetricsConfig::default() })
    }

    /// Whether this call should be recorded, honoring the enable flag,
    /// whitelists and sample rate.
    fn should_record(&self, service: &str, operation: &str) -> bool {
        if !self.config.aws_metrics_enabled {
            return false;
        }
        if !self.config.monitored_services.is_empty()
            && !self.config.monitored_services.iter().any(|s| s == service)
        {
            return false;
        }
        if !self.config.monitored_operations.is_empty()
            && !self.config.monitored_operations.iter().any(|o| o == operation)
        {
            return false;
        }
        if self.config.sample_rate < 1.0 {
            return fastrand::f64() < self.config.sample_rate;
        }
        true
    }

    /// Open a call context. Returns `None` when the call is not sampled.
    pub fn begin_call(&self, service: &str, operation: &str) -> Option<CallContext> {
        let operation = normalize_operation_name(operation);
        if !self.should_record(service, &operation) {
            return None;
        }
        Some(CallContext {
            correlation_id: Uuid::new_v4().to_string(),
            service: service.to_string(),
            operation,
            started: Instant::now(),
            recorded: false,
        })
    }

    /// Record a completed call and consume its context.
    pub fn end_call(
        &self,
        mut context: CallContext,
        error: Option<&BrokerError>,
        response_size: Option<usize>,
    ) {
        if context.recorded {
            return;
        }
        context.recorded = true;

        let duration = context.started.elapsed();
        let key = format!("{}.{}", context.service, context.operation);
        let mut state = self.state.lock().expect("aws metrics lock poisoned");
        state.calls_total += 1;
        match error {
            None => state.success_total += 1,
            Some(e) => {
                state.errors_total += 1;
                *state.errors_by_kind.entry(e.error_code().to_string()).or_insert(0) += 1;
                if matches!(e, BrokerError::Throttling(_)) {
                    state.throttling_total += 1;
                }
            }
        }

        let op = state.per_operation.entry(key).or_default();
        op.calls_total += 1;
        op.total_duration += duration;
        match error {
            None => op.success_total += 1,
            Some(_) => op.errors_total += 1,
        }
        if self.config.track_payload_sizes {
            op.response_bytes += response_size.unwrap_or(0) as u64;
        }
    }

    pub fn record_retry(&self) {
        let mut state = self.state.lock().expect("aws metrics lock poisoned");
        state.retries_total += 1;
    }

    pub fn snapshot(&self) -> AwsApiMetricsSnapshot {
        let state = self.state.lock().expect("aws metrics lock poisoned");
        AwsApiMetricsSnapshot {
            calls_total: state.calls_total,
            success_total: state.success_total,
            errors_total: state.errors_total,
            retries_total: state.retries_total,
            throttling_total: state.throttling_total,
            per_operation: state.per_operation.clone(),
            errors_by_kind: state.errors_by_kind.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> AwsApiMetrics {
        AwsApiMetrics::new(AwsMetricsConfig::default())
    }

    #[test]
    fn operation_names_normalize_to_snake_case() {
        assert_eq!(normalize_operation_name("CreateFleet"), "create_fleet");
        assert_eq!(normalize_operation_name("RequestSpotFleet"), "request_spot_fleet");
        assert_eq!(normalize_operation_name("describe_instances"), "describe_instances");
    }

    #[test]
    fn throttling_family_is_complete() {
        for code in [
            "Throttling",
            "ThrottlingException",
            "RequestLimitExceeded",
            "TooManyRequestsException",
            "ProvisionedThroughputExceededException",
        ] {
            assert!(is_throttling_code(code), "{code}");
        }
        assert!(!is_throttling_code("AccessDenied"));
    }

    #[test]
    fn success_and_error_paths_count() {
        let metrics = recorder();

        let ctx = metrics.begin_call("ec2", "CreateFleet").unwrap();
        metrics.end_call(ctx, None, Some(128));

        let ctx = metrics.begin_call("ec2", "CreateFleet").unwrap();
        let err = BrokerError::Throttling("RequestLimitExceeded".into());
        metrics.end_call(ctx, Some(&err), None);

        let snap = metrics.snapshot();
        assert_eq!(snap.calls_total, 2);
        assert_eq!(snap.success_total, 1);
        assert_eq!(snap.errors_total, 1);
        assert_eq!(snap.throttling_total, 1);
        assert_eq!(snap.errors_by_kind.get("THROTTLING_ERROR"), Some(&1));

        let op = snap.per_operation.get("ec2.create_fleet").unwrap();
        assert_eq!(op.calls_total, 2);
        assert_eq!(op.success_total, 1);
        assert_eq!(op.errors_total, 1);
        assert_eq!(op.response_bytes, 128);
    }

    #[test]
    fn disabled_recorder_skips_contexts() {
        let metrics = AwsApiMetrics::disabled();
        assert!(metrics.begin_call("ec2", "CreateFleet").is_none());
    }

    #[test]
    fn service_whitelist_filters() {
        let metrics = AwsApiMetrics::new(AwsMetricsConfig {
            monitored_services: vec!["ec2".to_string()],
            ..AwsMetricsConfig::default()
        });
        assert!(metrics.begin_call("ec2", "CreateFleet").is_some());
        assert!(metrics.begin_call("autoscaling", "CreateAutoScalingGroup").is_none());
    }
}

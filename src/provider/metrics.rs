//! Per-strategy operation metrics
//!
//! Counters are atomic so concurrent dispatches never lose counts; the
//! rolling response-time average sits behind a narrow mutex and may be
//! approximate under contention.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Default)]
struct TimingState {
    average_response_time_ms: f64,
    last_used: Option<DateTime<Utc>>,
    last_health_check: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct StrategyMetrics {
    total_operations: AtomicU64,
    successful_operations: AtomicU64,
    failed_operations: AtomicU64,
    health_check_count: AtomicU64,
    timing: Mutex<TimingState>,
}

#[derive(Debug, Clone)]
pub struct StrategyMetricsSnapshot {
    pub total_operations: u64,
    pub successful_operations: u64,
    pub failed_operations: u64,
    pub success_rate: f64,
    pub average_response_time_ms: f64,
    pub last_used: Option<DateTime<Utc>>,
    pub health_check_count: u64,
    pub last_health_check: Option<DateTime<Utc>>,
}

impl StrategyMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_operation(&self, success: bool, duration: Duration) {
        let total = self.total_operations.fetch_add(1, Ordering::SeqCst) + 1;
        if success {
            self.successful_operations.fetch_add(1, Ordering::SeqCst);
        } else {
            self.failed_operations.fetch_add(1, Ordering::SeqCst);
        }

        let mut timing = self.timing.lock().expect("metrics lock poisoned");
        let sample_ms = duration.as_secs_f64() * 1000.0;
        // Cumulative mean; total is the post-increment count.
        let n = total as f64;
        timing.average_response_time_ms += (sample_ms - timing.average_response_time_ms) / n;
        timing.last_used = Some(Utc::now());
    }

    pub fn record_health_check(&self) {
        self.health_check_count.fetch_add(1, Ordering::SeqCst);
        let mut timing = self.timing.lock().expect("metrics lock poisoned");
        timing.last_health_check = Some(Utc::now());
    }

    pub fn snapshot(&self) -> StrategyMetricsSnapshot {
        let total = self.total_operations.load(Ordering::SeqCst);
        let successful = self.successful_operations.load(Ordering::SeqCst);
        let failed = self.failed_operations.load(Ordering::SeqCst);
        let timing = self.timing.lock().expect("metrics lock poisoned");
        StrategyMetricsSnapshot {
            total_operations: total,
            successful_operations: successful,
            failed_operations: failed,
            success_rate: if total == 0 { 0.0 } else { 100.0 * successful as f64 / total as f64 },
            average_response_time_ms: timing.average_response_time_ms,
            last_used: timing.last_used,
            health_check_count: self.health_check_count.load(Ordering::SeqCst),
            last_health_check: timing.last_health_check,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn success_rate_is_zero_without_operations() {
        let metrics = StrategyMetrics::new();
        let snap = metrics.snapshot();
        assert_eq!(snap.total_operations, 0);
        assert_eq!(snap.success_rate, 0.0);
    }

    #[test]
    fn counters_and_rate_add_up() {
        let metrics = StrategyMetrics::new();
        metrics.record_operation(true, Duration::from_millis(10));
        metrics.record_operation(true, Duration::from_millis(30));
        metrics.record_operation(false, Duration::from_millis(20));

        let snap = metrics.snapshot();
        assert_eq!(snap.total_operations, 3);
        assert_eq!(snap.successful_operations, 2);
        assert_eq!(snap.failed_operations, 1);
        assert!(snap.successful_operations + snap.failed_operations <= snap.total_operations);
        assert!((snap.success_rate - 66.666).abs() < 0.01);
        assert!(snap.average_response_time_ms > 0.0);
        assert!(snap.last_used.is_some());
    }

    #[tokio::test]
    async fn concurrent_recording_never_loses_counts() {
        let metrics = Arc::new(StrategyMetrics::new());
        let mut handles = Vec::new();
        for i in 0..8 {
            let m = metrics.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    m.record_operation(i % 2 == 0, Duration::from_micros(50));
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let snap = metrics.snapshot();
        assert_eq!(snap.total_operations, 800);
        assert_eq!(snap.successful_operations + snap.failed_operations, 800);
        assert!(snap.success_rate >= 0.0 && snap.success_rate <= 100.0);
    }
}

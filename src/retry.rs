//! Retry logic with exponential backoff and circuit breaking
//!
//! Provides retry policies for handling transient failures in cloud API
//! calls, plus a circuit breaker that guards critical provisioning
//! operations (create/terminate/modify).

use crate::error::{BrokerError, IsRetryable, Result};
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Default retry configuration constants
const DEFAULT_INITIAL_RETRY_DELAY_MS: u64 = 100;
const DEFAULT_MAX_RETRY_DELAY_SECS: u64 = 30;
const DEFAULT_JITTER_FACTOR: f64 = 0.1;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const CLOUD_API_MAX_ATTEMPTS: u32 = 5;

/// Retry policy trait
#[allow(async_fn_in_trait)]
pub trait RetryPolicy: Send + Sync {
    /// Execute a function with retry logic
    async fn execute_with_retry<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send;
}

/// Exponential backoff retry policy
pub struct ExponentialBackoffPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
    jitter_factor: f64,
}

impl ExponentialBackoffPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(DEFAULT_INITIAL_RETRY_DELAY_MS),
            max_delay: Duration::from_secs(DEFAULT_MAX_RETRY_DELAY_SECS),
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }

    /// Create default policy (3 attempts)
    pub fn default_policy() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }

    /// Create policy for cloud API calls (5 attempts)
    pub fn for_cloud_api() -> Self {
        Self::new(CLOUD_API_MAX_ATTEMPTS)
    }

    /// Calculate backoff delay for given attempt number
    fn calculate_backoff(&self, attempt: u32) -> Duration {
        let exponential = self.initial_delay.as_millis() as f64 * 2f64.powi(attempt as i32);
        let delay_ms = exponential.min(self.max_delay.as_millis() as f64);

        // Jitter prevents thundering herd against the provider API
        let jitter = delay_ms * self.jitter_factor * fastrand::f64();
        Duration::from_millis((delay_ms + jitter) as u64)
    }
}

impl RetryPolicy for ExponentialBackoffPolicy {
    async fn execute_with_retry<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
    {
        let mut last_error = None;

        for attempt in 0..self.max_attempts {
            match f().await {
                Ok(result) => {
                    if attempt > 0 {
                        info!("Operation succeeded after {} retries", attempt);
                    }
                    return Ok(result);
                }
                Err(e) => {
                    if !e.is_retryable() {
                        warn!("Non-retryable error, aborting: {}", e);
                        return Err(e);
                    }

                    if attempt == self.max_attempts - 1 {
                        warn!("Max retries ({}) reached", self.max_attempts);
                        return Err(e);
                    }

                    let backoff = self.calculate_backoff(attempt);
                    warn!(
                        "Retryable error (attempt {}/{}), retrying in {:?}: {}",
                        attempt + 1,
                        self.max_attempts,
                        backoff,
                        e
                    );
                    last_error = Some(e);
                    tokio::time::sleep(backoff).await;
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            BrokerError::infrastructure("retry loop exited without an error")
        }))
    }
}

/// No retry policy (for operations that shouldn't be retried)
pub struct NoRetryPolicy;

impl RetryPolicy for NoRetryPolicy {
    async fn execute_with_retry<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
    {
        f().await
    }
}

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Circuit breaker guarding critical provider operations.
///
/// Closed until `failure_threshold` consecutive failures, then open for
/// `recovery_timeout`. The first call after the timeout probes half-open;
/// success closes the circuit, failure re-opens it.
pub struct CircuitBreaker {
    enabled: bool,
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(enabled: bool, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            enabled,
            failure_threshold,
            recovery_timeout,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    /// Breaker that never trips (configuration disabled).
    pub fn disabled() -> Self {
        Self::new(false, u32::MAX, Duration::from_secs(0))
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().expect("circuit breaker lock poisoned").state
    }

    /// Check admission before attempting an operation.
    ///
    /// Returns an infrastructure error while the circuit is open. The lock
    /// only covers the breaker bookkeeping, never the network call itself.
    fn admit(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let mut inner = self.inner.lock().expect("circuit breaker lock poisoned");
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.recovery_timeout {
                    inner.state = CircuitState::HalfOpen;
                    info!("Circuit breaker half-open, probing");
                    Ok(())
                } else {
                    Err(BrokerError::infrastructure(format!(
                        "circuit breaker open, retry in {:?}",
                        self.recovery_timeout.saturating_sub(elapsed)
                    )))
                }
            }
        }
    }

    fn record_success(&self) {
        if !self.enabled {
            return;
        }
        let mut inner = self.inner.lock().expect("circuit breaker lock poisoned");
        inner.consecutive_failures = 0;
        if inner.state != CircuitState::Closed {
            info!("Circuit breaker closed");
        }
        inner.state = CircuitState::Closed;
        inner.opened_at = None;
    }

    fn record_failure(&self) {
        if !self.enabled {
            return;
        }
        let mut inner = self.inner.lock().expect("circuit breaker lock poisoned");
        inner.consecutive_failures += 1;
        let tripped = inner.state == CircuitState::HalfOpen
            || inner.consecutive_failures >= self.failure_threshold;
        if tripped {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            warn!(
                "Circuit breaker opened after {} consecutive failures",
                inner.consecutive_failures
            );
        }
    }

    /// Run an operation under the breaker.
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.admit()?;
        match f().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn breaker_opens_after_threshold() {
        let breaker = CircuitBreaker::new(true, 2, Duration::from_secs(60));

        for _ in 0..2 {
            let _ = breaker
                .call(|| async { Err::<(), _>(BrokerError::Network("reset".into())) })
                .await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        // Open circuit rejects without invoking the closure
        let result = breaker.call(|| async { Ok::<_, BrokerError>(1) }).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn breaker_recovers_through_half_open() {
        let breaker = CircuitBreaker::new(true, 1, Duration::from_millis(5));

        let _ = breaker
            .call(|| async { Err::<(), _>(BrokerError::Network("reset".into())) })
            .await;
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(10)).await;
        let result = breaker.call(|| async { Ok::<_, BrokerError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn disabled_breaker_never_trips() {
        let breaker = CircuitBreaker::disabled();
        for _ in 0..10 {
            let _ = breaker
                .call(|| async { Err::<(), _>(BrokerError::Network("reset".into())) })
                .await;
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}

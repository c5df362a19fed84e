//! Error types for hostbroker
//!
//! This module defines the error handling strategy for hostbroker. Library
//! code uses `crate::error::Result<T>` which returns `BrokerError`; CLI code
//! uses `anyhow::Result<T>` for top-level error handling and converts at the
//! boundary with `anyhow::Error::from` to preserve error chains.
//!
//! ## Retry Awareness
//!
//! Errors implement `IsRetryable` to indicate whether an operation should be
//! retried. The `RetryPolicy` in `src/retry.rs` uses this to determine retry
//! behavior. Only transient infrastructure kinds (network, throttling,
//! capacity, storage) are retryable; validation, state, configuration and
//! authorization errors fail immediately.
//!
//! ## Error Codes
//!
//! Every error surfaces a stable SHOUT_SNAKE `error_code()` so callers
//! (scheduler adapter, CLI) can pattern-match without string inspection.
//! Domain errors are never wrapped into other domain errors; foreign errors
//! (IO, JSON, SQL, AWS SDK) are converted into the nearest kind with the
//! original retained as `#[source]`.

use std::collections::HashMap;
use thiserror::Error;

/// Main error type for hostbroker
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Validation error: {field} - {reason}")]
    Validation { field: String, reason: String },

    #[error("Invalid request state transition: {current} -> {attempted}")]
    InvalidRequestState { current: String, attempted: String },

    #[error("Request processing error: {0}")]
    RequestProcessing(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Authorization error: {0}")]
    Authorization(String),

    #[error("Insufficient capacity: {message}")]
    Capacity {
        message: String,
        /// Suggested delay before the request-level retry, in seconds.
        retry_after_secs: Option<u64>,
    },

    #[error("Throttled by provider: {0}")]
    Throttling(String),

    #[error("Infrastructure error: {message}")]
    Infrastructure {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Provider operation error [{code}]: {message}")]
    ProviderOperation { code: ProviderOperationErrorCode, message: String },

    #[error("Storage error: {message}")]
    Storage {
        message: String,
        /// Transient storage failures (lock contention, connection drops) retry.
        transient: bool,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Strategy-layer error codes surfaced by `ProviderContext`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderOperationErrorCode {
    NoStrategyAvailable,
    StrategyNotFound,
    OperationNotSupported,
}

impl std::fmt::Display for ProviderOperationErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ProviderOperationErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoStrategyAvailable => "NO_STRATEGY_AVAILABLE",
            Self::StrategyNotFound => "STRATEGY_NOT_FOUND",
            Self::OperationNotSupported => "OPERATION_NOT_SUPPORTED",
        }
    }
}

impl BrokerError {
    /// Stable machine-readable code for this error kind.
    pub fn error_code(&self) -> &'static str {
        match self {
            BrokerError::Validation { .. } => "VALIDATION_ERROR",
            BrokerError::InvalidRequestState { .. } => "INVALID_REQUEST_STATE",
            BrokerError::RequestProcessing(_) => "REQUEST_PROCESSING_ERROR",
            BrokerError::NotFound { .. } => "NOT_FOUND",
            BrokerError::Configuration { .. } => "CONFIGURATION_ERROR",
            BrokerError::Network(_) => "NETWORK_ERROR",
            BrokerError::Authorization(_) => "AUTHORIZATION_ERROR",
            BrokerError::Capacity { .. } => "INSUFFICIENT_CAPACITY",
            BrokerError::Throttling(_) => "THROTTLING_ERROR",
            BrokerError::Infrastructure { .. } => "INFRASTRUCTURE_ERROR",
            BrokerError::ProviderOperation { code, .. } => code.as_str(),
            BrokerError::Storage { .. } => "STORAGE_ERROR",
            BrokerError::Io(_) => "IO_ERROR",
            BrokerError::Json(_) => "SERIALIZATION_ERROR",
        }
    }

    /// Optional structured details for adapters that render errors outward.
    pub fn details(&self) -> HashMap<String, String> {
        let mut details = HashMap::new();
        match self {
            BrokerError::Validation { field, reason } => {
                details.insert("field".to_string(), field.clone());
                details.insert("reason".to_string(), reason.clone());
            }
            BrokerError::InvalidRequestState { current, attempted } => {
                details.insert("current".to_string(), current.clone());
                details.insert("attempted".to_string(), attempted.clone());
            }
            BrokerError::NotFound { entity, id } => {
                details.insert("entity".to_string(), entity.clone());
                details.insert("id".to_string(), id.clone());
            }
            BrokerError::Capacity { retry_after_secs, .. } => {
                if let Some(secs) = retry_after_secs {
                    details.insert("retry_after_secs".to_string(), secs.to_string());
                }
            }
            _ => {}
        }
        details
    }

    /// Build a configuration error wrapping a foreign cause with file context.
    pub fn configuration_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        BrokerError::Configuration {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn infrastructure(message: impl Into<String>) -> Self {
        BrokerError::Infrastructure { message: message.into(), source: None }
    }

    pub fn storage_transient(message: impl Into<String>) -> Self {
        BrokerError::Storage { message: message.into(), transient: true, source: None }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        BrokerError::Storage { message: message.into(), transient: false, source: None }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Trait for determining if an error is retryable
///
/// Used by `RetryPolicy` implementations to determine whether an error
/// should trigger a retry attempt.
pub trait IsRetryable {
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for BrokerError {
    fn is_retryable(&self) -> bool {
        match self {
            BrokerError::Network(_)
            | BrokerError::Throttling(_)
            | BrokerError::Capacity { .. }
            | BrokerError::Io(_) => true,
            BrokerError::Storage { transient, .. } => *transient,
            BrokerError::Infrastructure { .. } => true,
            _ => false,
        }
    }
}

/// Whether a low-layer error escalates to the request-level retry loop.
///
/// Capacity and throttling escape the per-call retry budget and leave the
/// request retryable; authorization, validation and configuration errors
/// fail the request outright.
pub fn escalates_to_request_retry(error: &BrokerError) -> bool {
    matches!(error, BrokerError::Capacity { .. } | BrokerError::Throttling(_))
}

//! Exit code standardization for hostbroker
//!
//! Consistent exit codes per error kind so the scheduler integration and
//! scripts can branch without parsing messages.
//!
//! ## Exit Code Convention
//!
//! - `0` = Success
//! - `1` = User error (invalid input, validation failure, resource not found)
//! - `2` = System error (AWS API failure, network error, provider error)
//! - `3` = Configuration error (missing config, invalid spec, bad credentials)

use crate::error::BrokerError;

/// Standard exit codes for hostbroker
pub mod codes {
    /// Success
    #[allow(dead_code)]
    pub const SUCCESS: i32 = 0;
    /// User error (invalid input, validation failure)
    pub const USER_ERROR: i32 = 1;
    /// System error (AWS API failure, network error)
    pub const SYSTEM_ERROR: i32 = 2;
    /// Configuration error (missing config, invalid credentials)
    pub const CONFIG_ERROR: i32 = 3;
}

/// Map a BrokerError to an appropriate exit code
pub fn exit_code_for_error(error: &BrokerError) -> i32 {
    use BrokerError::*;
    match error {
        // Configuration errors
        Configuration { .. } => codes::CONFIG_ERROR,
        Authorization(_) => codes::CONFIG_ERROR,

        // User errors (invalid input, bad state transitions, unknown ids)
        Validation { .. } => codes::USER_ERROR,
        InvalidRequestState { .. } => codes::USER_ERROR,
        NotFound { .. } => codes::USER_ERROR,
        RequestProcessing(_) => codes::USER_ERROR,

        // System errors (provider, network, storage, serialization)
        Network(_) => codes::SYSTEM_ERROR,
        Capacity { .. } => codes::SYSTEM_ERROR,
        Throttling(_) => codes::SYSTEM_ERROR,
        Infrastructure { .. } => codes::SYSTEM_ERROR,
        ProviderOperation { .. } => codes::SYSTEM_ERROR,
        Storage { .. } => codes::SYSTEM_ERROR,
        Io(_) => codes::SYSTEM_ERROR,
        Json(_) => codes::SYSTEM_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_documented_codes() {
        let validation =
            BrokerError::Validation { field: "count".into(), reason: "zero".into() };
        assert_eq!(exit_code_for_error(&validation), codes::USER_ERROR);

        let network = BrokerError::Network("reset".into());
        assert_eq!(exit_code_for_error(&network), codes::SYSTEM_ERROR);

        let config = BrokerError::Configuration { message: "bad".into(), source: None };
        assert_eq!(exit_code_for_error(&config), codes::CONFIG_ERROR);
    }
}

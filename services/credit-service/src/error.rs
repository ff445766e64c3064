//! Error types for credit-service.
//!
//! `ServiceError` is what engine operations return and what the HTTP layer
//! renders (see `api::error`). Lower layers have their own enums
//! (`StoreError`, `GatewayError`) that convert into it.

use crate::gateway::GatewayError;
use crate::store::StoreError;
use thiserror::Error;

/// Result type alias using the crate's service error.
pub type Result<T> = std::result::Result<T, ServiceError>;

#[derive(Debug, Error)]
pub enum ServiceError {
    /// Package id not in the configured price list.
    #[error("unknown credit package `{0}`")]
    InvalidPackage(String),

    /// Malformed or inconsistent request.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Payment signature did not match.
    #[error("payment signature mismatch")]
    InvalidSignature,

    #[error("order {0} not found")]
    OrderNotFound(String),

    #[error("resource {0} not found")]
    ResourceNotFound(String),

    /// Balance too low; nothing was debited.
    #[error("insufficient credit: balance {balance}, required {required}")]
    InsufficientCredit { balance: i64, required: i64 },

    #[error("payment gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("rate limit exceeded, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InsufficientCredit { balance, required } => {
                Self::InsufficientCredit { balance, required }
            }
            // NotFound / Conflict are handled where they carry meaning; anything
            // reaching here is an unexpected storage condition.
            other => Self::StorageUnavailable(other.to_string()),
        }
    }
}

impl From<GatewayError> for ServiceError {
    fn from(err: GatewayError) -> Self {
        Self::GatewayUnavailable(err.to_string())
    }
}

/// Startup configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },

    #[error("{0} must be set together with {1}")]
    Incomplete(&'static str, &'static str),
}

impl ConfigError {
    pub fn invalid(key: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_insufficient_credit_survives_conversion() {
        let err: ServiceError = StoreError::InsufficientCredit {
            balance: 0,
            required: 1,
        }
        .into();
        assert!(matches!(
            err,
            ServiceError::InsufficientCredit {
                balance: 0,
                required: 1
            }
        ));
    }

    #[test]
    fn other_store_errors_become_storage_unavailable() {
        let err: ServiceError = StoreError::Unavailable("pool timed out".into()).into();
        assert!(matches!(err, ServiceError::StorageUnavailable(_)));
        let err: ServiceError = StoreError::Conflict("dup".into()).into();
        assert!(matches!(err, ServiceError::StorageUnavailable(_)));
    }
}

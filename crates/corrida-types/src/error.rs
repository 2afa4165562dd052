//! Error taxonomy shared by every Corrida component
//!
//! Guard failures are cheap, local, and surfaced immediately. A lost
//! binding race is `Conflict` and must never be retried as if it had
//! succeeded. Only external-dependency failures are retriable.

use crate::RideId;
use rust_decimal::Decimal;
use thiserror::Error;

/// Result type for Corrida operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Corrida error taxonomy
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// Malformed request; surfaced to the caller, never retried
    #[error("Invalid input: {field} - {reason}")]
    InvalidInput { field: String, reason: String },

    /// State-machine guard or binding race lost; already handled elsewhere
    #[error("Conflict: {reason}")]
    Conflict { reason: String },

    /// Actor not authorized for this ride or wallet
    #[error("Forbidden: {reason}")]
    Forbidden { reason: String },

    /// Unknown ride, driver, or wallet
    #[error("{resource} not found: {id}")]
    NotFound { resource: &'static str, id: String },

    /// Withdrawal exceeds the available balance
    #[error("Insufficient funds: requested {requested}, available {available}")]
    InsufficientFunds {
        requested: Decimal,
        available: Decimal,
    },

    /// Dispatch exhausted every round without a binding
    #[error("No drivers available for ride {ride_id}")]
    NoDriversAvailable { ride_id: RideId },

    /// Payout or other external dependency unavailable
    #[error("External service failure: {service} - {reason}")]
    ExternalServiceFailure {
        service: &'static str,
        reason: String,
    },
}

impl CoreError {
    pub fn invalid_input(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn conflict(reason: impl Into<String>) -> Self {
        Self::Conflict {
            reason: reason.into(),
        }
    }

    pub fn forbidden(reason: impl Into<String>) -> Self {
        Self::Forbidden {
            reason: reason.into(),
        }
    }

    pub fn not_found(resource: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            resource,
            id: id.to_string(),
        }
    }

    /// Whether retrying with backoff can help
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::ExternalServiceFailure { .. })
    }

    /// Stable code for API payloads
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidInput { .. } => "INVALID_INPUT",
            Self::Conflict { .. } => "CONFLICT",
            Self::Forbidden { .. } => "FORBIDDEN",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            Self::NoDriversAvailable { .. } => "NO_DRIVERS_AVAILABLE",
            Self::ExternalServiceFailure { .. } => "EXTERNAL_SERVICE_FAILURE",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_error_codes() {
        let err = CoreError::InsufficientFunds {
            requested: dec!(100.00),
            available: dec!(50.00),
        };
        assert_eq!(err.error_code(), "INSUFFICIENT_FUNDS");
        assert_eq!(
            CoreError::conflict("ride already bound").error_code(),
            "CONFLICT"
        );
    }

    #[test]
    fn test_retriable() {
        assert!(CoreError::ExternalServiceFailure {
            service: "payout",
            reason: "timeout".into(),
        }
        .is_retriable());
        assert!(!CoreError::conflict("lost race").is_retriable());
    }
}

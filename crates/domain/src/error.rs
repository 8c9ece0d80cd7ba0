//! Domain error types.

use thiserror::Error;

/// Errors raised by domain rules.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    /// A status transition that the state machine does not allow.
    #[error("Invalid {entity} transition from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    /// An order that cannot be placed as described.
    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    /// A persisted status string that does not map to a known variant.
    #[error("Unknown {kind} value: {value}")]
    UnknownValue { kind: &'static str, value: String },

    /// A configuration value that cannot be parsed.
    #[error("Invalid setting {key}: {value}")]
    InvalidSetting { key: String, value: String },
}

impl DomainError {
    pub(crate) fn unknown(kind: &'static str, value: &str) -> Self {
        DomainError::UnknownValue {
            kind,
            value: value.to_string(),
        }
    }
}

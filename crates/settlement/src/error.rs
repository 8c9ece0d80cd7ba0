//! Settlement error types.

use common::{JobId, OrderId, OrderItemId, ProductId, WebhookDeliveryId, WebhookEndpointId};
use domain::DomainError;
use ledger::LedgerError;
use thiserror::Error;

/// Errors that can occur in the settlement pipeline.
///
/// A conditional write that loses a race is not represented here: it is a
/// no-op and the operation reports the state it observed instead.
#[derive(Debug, Error)]
pub enum SettlementError {
    /// Bad input; rejected before anything was written.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Fewer AVAILABLE units than requested; nothing was reserved.
    #[error("Insufficient stock for {product_id}: requested {requested}")]
    InsufficientStock {
        product_id: ProductId,
        requested: u32,
    },

    /// Timeout, connection failure or 5xx from an external service.
    #[error("{service} unavailable: {reason}")]
    ExternalTransient {
        service: &'static str,
        reason: String,
    },

    /// An external service rejected the request or answered with something
    /// that cannot be interpreted.
    #[error("{service} rejected request: {reason}")]
    ExternalPermanent {
        service: &'static str,
        reason: String,
    },

    /// A cross-entity invariant would be broken.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Order not found: {0}")]
    OrderNotFound(OrderId),

    #[error("Order item not found: {0}")]
    OrderItemNotFound(OrderItemId),

    #[error("Payment not found: {0}")]
    PaymentNotFound(String),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Webhook endpoint not found: {0}")]
    EndpointNotFound(WebhookEndpointId),

    #[error("Webhook delivery not found: {0}")]
    DeliveryNotFound(WebhookDeliveryId),

    /// Domain error.
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    /// Ledger error.
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SettlementError {
    /// Returns true if the failed work may succeed when tried again later.
    ///
    /// The fulfillment scheduler retries transient failures with backoff
    /// and fails the job at once on everything else.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SettlementError::ExternalTransient { .. }
                | SettlementError::InsufficientStock { .. }
                | SettlementError::Ledger(LedgerError::Database(_))
        )
    }

    pub(crate) fn transient(service: &'static str, reason: impl Into<String>) -> Self {
        SettlementError::ExternalTransient {
            service,
            reason: reason.into(),
        }
    }

    pub(crate) fn permanent(service: &'static str, reason: impl Into<String>) -> Self {
        SettlementError::ExternalPermanent {
            service,
            reason: reason.into(),
        }
    }
}

/// Convenience type alias for settlement results.
pub type Result<T> = std::result::Result<T, SettlementError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(SettlementError::transient("gateway", "timeout").is_transient());
        assert!(
            SettlementError::InsufficientStock {
                product_id: ProductId::new("SKU-1"),
                requested: 2,
            }
            .is_transient()
        );
        assert!(!SettlementError::permanent("invite provider", "no such user").is_transient());
        assert!(!SettlementError::Validation("bad".to_string()).is_transient());
        assert!(!SettlementError::InvariantViolation("x".to_string()).is_transient());
    }

    #[test]
    fn test_messages_name_the_service() {
        let err = SettlementError::transient("gateway", "HTTP 503");
        assert_eq!(err.to_string(), "gateway unavailable: HTTP 503");
    }
}

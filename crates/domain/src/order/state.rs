//! Order state machine.

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// The status of an order in its settlement lifecycle.
///
/// State transitions:
/// ```text
/// AwaitingPayment ──► Paid ──► Processing ──┬──► Delivered
///        │             │           │        └──► Failed
///        └─────────────┴───────────┴──► Cancelled | Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Order placed, no settled payment yet.
    #[default]
    AwaitingPayment,

    /// Payment settled; fulfillment jobs are being created.
    Paid,

    /// Fulfillment jobs exist and are being worked.
    Processing,

    /// Every item has been delivered (terminal state).
    Delivered,

    /// Fulfillment failed for good (terminal state).
    Failed,

    /// Cancelled by an operator (terminal state).
    Cancelled,
}

impl OrderStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [OrderStatus; 6] = [
        OrderStatus::AwaitingPayment,
        OrderStatus::Paid,
        OrderStatus::Processing,
        OrderStatus::Delivered,
        OrderStatus::Failed,
        OrderStatus::Cancelled,
    ];

    /// Returns true if the order may move from this status to `next`.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        match (self, next) {
            (AwaitingPayment, Paid) => true,
            (Paid, Processing) => true,
            (Processing, Delivered) => true,
            (AwaitingPayment | Paid | Processing, Cancelled | Failed) => true,
            _ => false,
        }
    }

    /// Validates a transition, returning an error naming both ends when illegal.
    pub fn ensure_transition(&self, next: OrderStatus) -> Result<(), DomainError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(DomainError::InvalidTransition {
                entity: "order",
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }

    /// Returns true once payment no longer needs reconciling.
    pub fn is_settled(&self) -> bool {
        !matches!(self, OrderStatus::AwaitingPayment)
    }

    /// Returns true if the order ended without delivery.
    pub fn is_closed(&self) -> bool {
        matches!(self, OrderStatus::Failed | OrderStatus::Cancelled)
    }

    /// Returns true if this is a terminal state (no further transitions possible).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Delivered | OrderStatus::Failed | OrderStatus::Cancelled
        )
    }

    /// Returns the coarse status shown to buyers.
    pub fn buyer_view(&self) -> BuyerStatus {
        match self {
            OrderStatus::AwaitingPayment => BuyerStatus::AwaitingPayment,
            OrderStatus::Paid | OrderStatus::Processing => BuyerStatus::Processing,
            OrderStatus::Delivered => BuyerStatus::Delivered,
            OrderStatus::Failed => BuyerStatus::Failed,
            OrderStatus::Cancelled => BuyerStatus::Cancelled,
        }
    }

    /// Returns the persisted name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::AwaitingPayment => "AWAITING_PAYMENT",
            OrderStatus::Paid => "PAID",
            OrderStatus::Processing => "PROCESSING",
            OrderStatus::Delivered => "DELIVERED",
            OrderStatus::Failed => "FAILED",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OrderStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::unknown("order status", s))
    }
}

/// Order status as exposed to buyers.
///
/// Job-level detail never leaks past this view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuyerStatus {
    AwaitingPayment,
    Processing,
    Delivered,
    Failed,
    Cancelled,
}

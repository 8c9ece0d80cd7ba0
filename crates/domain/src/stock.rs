//! Single-use stock units.

use chrono::{DateTime, Utc};
use common::{OrderId, OrderItemId, ProductId, StockItemId};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Lifecycle of a stock unit.
///
/// ```text
/// Available ──► Reserved ──► Sold
///     ▲             │
///     └─────────────┘ (release on cancellation)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StockStatus {
    Available,
    Reserved,
    /// Terminal; never reverted.
    Sold,
}

impl StockStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StockStatus::Available => "AVAILABLE",
            StockStatus::Reserved => "RESERVED",
            StockStatus::Sold => "SOLD",
        }
    }
}

impl std::fmt::Display for StockStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for StockStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AVAILABLE" => Ok(StockStatus::Available),
            "RESERVED" => Ok(StockStatus::Reserved),
            "SOLD" => Ok(StockStatus::Sold),
            other => Err(DomainError::unknown("stock status", other)),
        }
    }
}

/// A secret or credential that can be handed to exactly one buyer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockItem {
    pub id: StockItemId,
    pub product_id: ProductId,
    /// The deliverable itself (code, credential, license key).
    pub secret: String,
    pub status: StockStatus,
    pub order_id: Option<OrderId>,
    pub order_item_id: Option<OrderItemId>,
    pub created_at: DateTime<Utc>,
    pub reserved_at: Option<DateTime<Utc>>,
    pub sold_at: Option<DateTime<Utc>>,
}

impl StockItem {
    /// Creates an available unit for a product.
    pub fn new(product_id: impl Into<ProductId>, secret: impl Into<String>) -> Self {
        Self {
            id: StockItemId::new(),
            product_id: product_id.into(),
            secret: secret.into(),
            status: StockStatus::Available,
            order_id: None,
            order_item_id: None,
            created_at: Utc::now(),
            reserved_at: None,
            sold_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_unit_is_available_and_unowned() {
        let unit = StockItem::new("SKU-1", "CODE-AAAA");
        assert_eq!(unit.status, StockStatus::Available);
        assert!(unit.order_id.is_none());
        assert!(unit.order_item_id.is_none());
    }

    #[test]
    fn test_status_parse() {
        for status in [StockStatus::Available, StockStatus::Reserved, StockStatus::Sold] {
            assert_eq!(status.as_str().parse::<StockStatus>().unwrap(), status);
        }
        assert!("GONE".parse::<StockStatus>().is_err());
    }
}

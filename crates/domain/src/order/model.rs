//! Order and order item records.

use chrono::{DateTime, Utc};
use common::{AccountId, OrderId, OrderItemId, ProductId};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::money::Money;

use super::OrderStatus;

/// Who an order belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum OrderOwner {
    /// A signed-in storefront or reseller account.
    Account(AccountId),
    /// A guest checkout, identified by an opaque token.
    Guest(String),
}

/// Buyer contact details captured at checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub email: String,
    pub name: String,
}

/// The money fields of an order, computed once at placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderTotals {
    pub subtotal: Money,
    pub discount_amount: Money,
    pub points_discount: Money,
    pub total_amount: Money,
}

impl OrderTotals {
    /// Computes `subtotal - discount - points_discount`, clamped at zero.
    pub fn compute(
        subtotal: Money,
        discount_amount: Money,
        points_discount: Money,
    ) -> Result<Self, DomainError> {
        if subtotal.is_negative() || discount_amount.is_negative() || points_discount.is_negative()
        {
            return Err(DomainError::InvalidOrder(
                "amounts must not be negative".to_string(),
            ));
        }

        Ok(Self {
            subtotal,
            discount_amount,
            points_discount,
            total_amount: subtotal
                .saturating_sub(discount_amount)
                .saturating_sub(points_discount),
        })
    }
}

/// A placed order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub account_id: Option<AccountId>,
    pub guest_token: Option<String>,
    pub customer_email: String,
    pub customer_name: String,
    pub subtotal: Money,
    pub discount_amount: Money,
    pub points_discount: Money,
    pub total_amount: Money,
    pub status: OrderStatus,
    /// Set once loyalty points and cashback have been granted for delivery.
    pub rewards_granted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl Order {
    /// Creates a new order awaiting payment.
    pub fn new(
        owner: OrderOwner,
        customer: Customer,
        totals: OrderTotals,
        now: DateTime<Utc>,
    ) -> Self {
        let (account_id, guest_token) = match owner {
            OrderOwner::Account(id) => (Some(id), None),
            OrderOwner::Guest(token) => (None, Some(token)),
        };

        Self {
            id: OrderId::new(),
            account_id,
            guest_token,
            customer_email: customer.email,
            customer_name: customer.name,
            subtotal: totals.subtotal,
            discount_amount: totals.discount_amount,
            points_discount: totals.points_discount,
            total_amount: totals.total_amount,
            status: OrderStatus::AwaitingPayment,
            rewards_granted: false,
            created_at: now,
            updated_at: now,
            paid_at: None,
            delivered_at: None,
        }
    }

    /// Returns the order's money fields.
    pub fn totals(&self) -> OrderTotals {
        OrderTotals {
            subtotal: self.subtotal,
            discount_amount: self.discount_amount,
            points_discount: self.points_discount,
            total_amount: self.total_amount,
        }
    }

    /// Returns true if the stored total matches the placement formula.
    pub fn totals_consistent(&self) -> bool {
        OrderTotals::compute(self.subtotal, self.discount_amount, self.points_discount)
            .map(|t| t.total_amount == self.total_amount)
            .unwrap_or(false)
    }
}

/// How a product is delivered once paid for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryType {
    /// Dispense pre-loaded stock units.
    Stock,
    /// Grant access on an external provider's platform.
    Invite,
}

impl DeliveryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryType::Stock => "STOCK",
            DeliveryType::Invite => "INVITE",
        }
    }
}

impl std::fmt::Display for DeliveryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DeliveryType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STOCK" => Ok(DeliveryType::Stock),
            "INVITE" => Ok(DeliveryType::Invite),
            other => Err(DomainError::unknown("delivery type", other)),
        }
    }
}

/// A line of an order.
///
/// Product name and delivery type are snapshotted from the catalog at
/// checkout so fulfillment never has to consult the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: OrderItemId,
    pub order_id: OrderId,
    pub product_id: ProductId,
    pub product_name: String,
    pub delivery_type: DeliveryType,
    pub quantity: u32,
    pub unit_price: Money,
    pub total_price: Money,
    /// Buyer-supplied parameters, e.g. the invite target email.
    pub input_data: serde_json::Value,
    /// Fulfillment result; present once delivered.
    pub delivery_data: Option<serde_json::Value>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl OrderItem {
    /// Creates an undelivered item for an order.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        order_id: OrderId,
        product_id: impl Into<ProductId>,
        product_name: impl Into<String>,
        delivery_type: DeliveryType,
        quantity: u32,
        unit_price: Money,
        input_data: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: OrderItemId::new(),
            order_id,
            product_id: product_id.into(),
            product_name: product_name.into(),
            delivery_type,
            quantity,
            unit_price,
            total_price: unit_price.multiply(quantity),
            input_data,
            delivery_data: None,
            delivered_at: None,
            created_at: now,
        }
    }

    /// Returns true once fulfillment has written a result.
    pub fn is_delivered(&self) -> bool {
        self.delivery_data.is_some()
    }

    /// Looks up a string parameter supplied by the buyer.
    pub fn input_str(&self, key: &str) -> Option<&str> {
        self.input_data.get(key).and_then(|v| v.as_str())
    }
}

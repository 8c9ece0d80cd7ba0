//! Outbound order events, reseller webhook endpoints and delivery logs.

use chrono::{DateTime, Utc};
use common::{AccountId, OrderId, ProductId, WebhookDeliveryId, WebhookEndpointId};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::money::Money;
use crate::order::{Order, OrderItem, OrderStatus};

/// Order lifecycle boundaries that produce notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderEvent {
    #[serde(rename = "order.paid")]
    Paid,
    #[serde(rename = "order.delivered")]
    Delivered,
    #[serde(rename = "order.failed")]
    Failed,
}

impl OrderEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderEvent::Paid => "order.paid",
            OrderEvent::Delivered => "order.delivered",
            OrderEvent::Failed => "order.failed",
        }
    }

    /// The event fired when an order enters `status`, if any.
    pub fn for_status(status: OrderStatus) -> Option<OrderEvent> {
        match status {
            OrderStatus::Paid => Some(OrderEvent::Paid),
            OrderStatus::Delivered => Some(OrderEvent::Delivered),
            OrderStatus::Failed => Some(OrderEvent::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for OrderEvent {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "order.paid" => Ok(OrderEvent::Paid),
            "order.delivered" => Ok(OrderEvent::Delivered),
            "order.failed" => Ok(OrderEvent::Failed),
            other => Err(DomainError::unknown("order event", other)),
        }
    }
}

/// Line item as sent to webhook subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventItem {
    pub product_id: ProductId,
    pub product_name: String,
    pub quantity: u32,
    pub unit_price: Money,
    pub total_price: Money,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_data: Option<serde_json::Value>,
}

/// JSON body POSTed to webhook subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderEventPayload {
    pub event: OrderEvent,
    pub order_id: OrderId,
    pub order_status: OrderStatus,
    pub customer_email: String,
    pub customer_name: String,
    pub total_amount: Money,
    pub items: Vec<EventItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl OrderEventPayload {
    pub fn new(event: OrderEvent, order: &Order, items: &[OrderItem]) -> Self {
        Self {
            event,
            order_id: order.id,
            order_status: order.status,
            customer_email: order.customer_email.clone(),
            customer_name: order.customer_name.clone(),
            total_amount: order.total_amount,
            items: items
                .iter()
                .map(|item| EventItem {
                    product_id: item.product_id.clone(),
                    product_name: item.product_name.clone(),
                    quantity: item.quantity,
                    unit_price: item.unit_price,
                    total_price: item.total_price,
                    delivery_data: item.delivery_data.clone(),
                })
                .collect(),
            delivered_at: order.delivered_at,
            paid_at: order.paid_at,
            created_at: order.created_at,
        }
    }
}

/// A reseller-owned HTTP endpoint subscribed to order events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookEndpoint {
    pub id: WebhookEndpointId,
    pub account_id: AccountId,
    pub url: String,
    /// Shared HMAC secret.
    pub secret: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl WebhookEndpoint {
    pub fn new(account_id: AccountId, url: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            id: WebhookEndpointId::new(),
            account_id,
            url: url.into(),
            secret: secret.into(),
            active: true,
            created_at: Utc::now(),
        }
    }
}

/// One logged attempt to deliver an event. Written once, never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: WebhookDeliveryId,
    pub endpoint_id: WebhookEndpointId,
    pub order_id: OrderId,
    pub event: OrderEvent,
    /// Exact JSON body that was signed and sent.
    pub payload: String,
    pub timestamp: i64,
    pub signature: String,
    pub response_status: Option<u16>,
    pub response_body: Option<String>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// The delivery this attempt replays, for operator retries.
    pub retry_of: Option<WebhookDeliveryId>,
    pub created_at: DateTime<Utc>,
}

impl WebhookDelivery {
    /// Returns true if the subscriber acknowledged with a 2xx.
    pub fn succeeded(&self) -> bool {
        self.delivered_at.is_some()
    }
}

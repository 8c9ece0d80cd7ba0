//! Identifier types shared by every crate in the settlement workspace.

pub mod types;

pub use types::{
    AccountId, JobId, OrderId, OrderItemId, PaymentId, ProductId, StockItemId,
    WalletTransactionId, WebhookDeliveryId, WebhookEndpointId,
};

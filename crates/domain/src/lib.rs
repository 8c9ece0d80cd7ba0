//! Domain layer for the order settlement pipeline.
//!
//! This crate holds the records the pipeline moves through the ledger and
//! the rules that govern them:
//! - Order and OrderItem with the order state machine and totals invariant
//! - StockItem, Payment, FulfillmentJob lifecycles
//! - Reseller wallet postings and loyalty points
//! - Webhook endpoints, event payloads and delivery logs
//! - Retry policy and the business settings snapshot

pub mod error;
pub mod job;
pub mod money;
pub mod order;
pub mod payment;
pub mod settings;
pub mod stock;
pub mod wallet;
pub mod webhook;

pub use error::DomainError;
pub use job::{FailureDisposition, FulfillmentJob, JobStatus, JobType, RetryPolicy};
pub use money::Money;
pub use order::{
    BuyerStatus, Customer, DeliveryType, Order, OrderItem, OrderOwner, OrderStatus, OrderTotals,
};
pub use payment::{ChargeDetails, Payment, PaymentSettlement, PaymentStatus, gateway_fee};
pub use settings::Settings;
pub use stock::{StockItem, StockStatus};
pub use wallet::{
    PointAward, Wallet, WalletEntry, WalletEntryKind, WalletPosting, WalletTransaction,
};
pub use webhook::{
    EventItem, OrderEvent, OrderEventPayload, WebhookDelivery, WebhookEndpoint,
};

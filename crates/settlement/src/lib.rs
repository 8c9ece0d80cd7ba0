//! Order settlement and fulfillment pipeline.
//!
//! This crate moves a placed order through payment, fulfillment and
//! notification:
//! 1. Checkout stores the order AWAITING_PAYMENT
//! 2. The payment reconciler opens a gateway charge and folds the gateway's
//!    status back into the ledger (or the order is paid from a wallet)
//! 3. Entering PAID creates one fulfillment job per item; the worker claims
//!    stock or calls the invite provider
//! 4. The order aggregates to DELIVERED or FAILED and the buyer and any
//!    reseller webhooks are notified
//!
//! Every step is a conditional write against the ledger, so the pipeline
//! can be driven concurrently and re-driven after a crash.

pub mod allocator;
pub mod checkout;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod machine;
pub mod reconciler;
pub mod scheduler;
pub mod services;
pub mod settings;
pub mod signing;
pub mod templates;
pub mod wallet;
pub mod worker;

pub use allocator::StockAllocator;
pub use checkout::{CheckoutService, PlaceOrder, PlaceOrderItem};
pub use coordinator::{
    BatchReport, CoordinatorConfig, ItemView, OrderView, PaymentView, SettlementCoordinator,
};
pub use dispatcher::{DispatchReport, NotificationDispatcher};
pub use error::{Result, SettlementError};
pub use machine::OrderStateMachine;
pub use reconciler::{PaymentReconciler, ReconcileOutcome, map_gateway_status};
pub use scheduler::{FulfillmentScheduler, JobOutcome};
pub use services::{
    HttpEmailNotifier, HttpInviteProvider, HttpPaymentGateway, HttpWebhookTransport,
    InMemoryInviteProvider, InMemoryNotifier, InMemoryPaymentGateway, InMemoryWebhookTransport,
    InviteProvider, LogNotifier, Notifier, PaymentGateway, WebhookTransport,
};
pub use settings::SettingsCache;
pub use wallet::{Rewards, WalletPayment, WalletService};
pub use worker::FulfillmentWorker;

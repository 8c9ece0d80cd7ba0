use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{
    AccountId, JobId, OrderId, OrderItemId, PaymentId, ProductId, WebhookDeliveryId,
    WebhookEndpointId,
};
use domain::{
    ChargeDetails, FulfillmentJob, Order, OrderItem, OrderStatus, Payment, PaymentSettlement,
    PointAward, StockItem, StockStatus, Wallet, WalletEntry, WalletEntryKind, WalletPosting,
    WalletTransaction, WebhookDelivery, WebhookEndpoint,
};

use crate::Result;

/// Orders and their items.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Inserts a new order together with its items.
    async fn insert_order(&self, order: &Order, items: &[OrderItem]) -> Result<()>;

    async fn get_order(&self, id: OrderId) -> Result<Option<Order>>;

    /// Items of an order, in creation order.
    async fn get_order_items(&self, order_id: OrderId) -> Result<Vec<OrderItem>>;

    async fn get_order_item(&self, id: OrderItemId) -> Result<Option<OrderItem>>;

    /// Moves an order from `from` to `to` if it is still in `from`.
    ///
    /// Entering PAID stamps `paid_at`; entering DELIVERED stamps
    /// `delivered_at` and only succeeds when every item carries delivery
    /// data. Returns `false` when the order was not in `from` (another
    /// actor got there first).
    async fn transition_order(
        &self,
        id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Orders currently in `status` whose last update is before `updated_before`,
    /// oldest first.
    async fn orders_with_status(
        &self,
        status: OrderStatus,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Order>>;

    /// Flags the order's delivery rewards as granted. `false` if already set.
    async fn mark_rewards_granted(&self, id: OrderId) -> Result<bool>;

    /// Writes an item's delivery data if it has none yet.
    async fn record_item_delivery(
        &self,
        item_id: OrderItemId,
        delivery_data: &serde_json::Value,
        at: DateTime<Utc>,
    ) -> Result<bool>;
}

/// The finite pool of single-use stock units.
#[async_trait]
pub trait StockStore: Send + Sync {
    async fn insert_stock(&self, units: &[StockItem]) -> Result<()>;

    /// Reserves exactly `quantity` AVAILABLE units of `product_id` for an
    /// order item, oldest first, in one atomic step.
    ///
    /// Returns `None` and changes nothing when fewer than `quantity` units
    /// are available, or when the order is CANCELLED or FAILED. A repeat
    /// call for the same item returns the units it already holds.
    async fn claim_stock(
        &self,
        product_id: &ProductId,
        quantity: u32,
        order_id: OrderId,
        order_item_id: OrderItemId,
        at: DateTime<Utc>,
    ) -> Result<Option<Vec<StockItem>>>;

    /// Units held (RESERVED or SOLD) by an order item.
    async fn stock_for_item(&self, order_item_id: OrderItemId) -> Result<Vec<StockItem>>;

    /// Returns an order's RESERVED units to AVAILABLE. SOLD units are untouched.
    async fn release_stock(&self, order_id: OrderId) -> Result<u64>;

    /// Flips an order's RESERVED units to SOLD.
    async fn finalize_stock(&self, order_id: OrderId, at: DateTime<Utc>) -> Result<u64>;

    /// Flips one order item's RESERVED units to SOLD.
    async fn finalize_item_stock(&self, order_item_id: OrderItemId, at: DateTime<Utc>)
    -> Result<u64>;

    async fn count_stock(&self, product_id: &ProductId, status: StockStatus) -> Result<u64>;
}

/// Gateway payment attempts.
#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// Inserts a PENDING attempt. Returns `false` without inserting when the
    /// order already has a PENDING attempt.
    async fn insert_payment(&self, payment: &Payment) -> Result<bool>;

    async fn get_payment(&self, id: PaymentId) -> Result<Option<Payment>>;

    async fn payment_by_ref(&self, ref_id: &str) -> Result<Option<Payment>>;

    /// The PENDING attempt of an order, if any.
    async fn pending_payment(&self, order_id: OrderId) -> Result<Option<Payment>>;

    /// The most recently created attempt of an order.
    async fn latest_payment(&self, order_id: OrderId) -> Result<Option<Payment>>;

    /// Stores the gateway charge on a still-PENDING attempt.
    async fn attach_charge(
        &self,
        id: PaymentId,
        charge: &ChargeDetails,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Moves a PENDING attempt to its settled status.
    async fn settle_payment(
        &self,
        id: PaymentId,
        settlement: &PaymentSettlement,
        at: DateTime<Utc>,
    ) -> Result<bool>;
}

/// Fulfillment jobs.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Inserts a job unless its order item already has one.
    async fn insert_job(&self, job: &FulfillmentJob) -> Result<bool>;

    async fn get_job(&self, id: JobId) -> Result<Option<FulfillmentJob>>;

    async fn jobs_for_order(&self, order_id: OrderId) -> Result<Vec<FulfillmentJob>>;

    /// Atomically moves up to `limit` due PENDING jobs to PROCESSING,
    /// oldest-created first, and returns them.
    async fn claim_due_jobs(&self, now: DateTime<Utc>, limit: usize)
    -> Result<Vec<FulfillmentJob>>;

    /// Moves one due PENDING job to PROCESSING. `None` if it was not claimable.
    async fn start_job(&self, id: JobId, now: DateTime<Utc>) -> Result<Option<FulfillmentJob>>;

    /// PROCESSING → COMPLETED.
    async fn complete_job(
        &self,
        id: JobId,
        result: &serde_json::Value,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// PROCESSING → PENDING with a new attempt count, provided the job still
    /// has `observed_attempts`.
    async fn requeue_job(
        &self,
        id: JobId,
        observed_attempts: u32,
        attempts: u32,
        error: &str,
        next_retry_at: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// PROCESSING → FAILED, provided the job still has `observed_attempts`.
    async fn fail_job(
        &self,
        id: JobId,
        observed_attempts: u32,
        attempts: u32,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// PROCESSING jobs whose current run started before `started_before`.
    async fn stale_jobs(
        &self,
        started_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<FulfillmentJob>>;

    /// Permanently failed jobs, most recent first.
    async fn failed_jobs(&self, limit: usize) -> Result<Vec<FulfillmentJob>>;
}

/// Reseller wallets and loyalty points.
#[async_trait]
pub trait WalletStore: Send + Sync {
    async fn get_wallet(&self, account_id: AccountId) -> Result<Option<Wallet>>;

    /// Updates the wallet and appends its transaction in one atomic step.
    async fn post_wallet_entry(&self, entry: &WalletEntry, at: DateTime<Utc>)
    -> Result<WalletPosting>;

    /// Transaction history of a wallet, oldest first.
    async fn wallet_transactions(&self, account_id: AccountId) -> Result<Vec<WalletTransaction>>;

    async fn find_wallet_transaction(
        &self,
        kind: WalletEntryKind,
        reference: &str,
    ) -> Result<Option<WalletTransaction>>;

    /// Records points for an order. `false` if the order was already awarded.
    async fn award_points(&self, award: &PointAward) -> Result<bool>;

    async fn points_balance(&self, account_id: AccountId) -> Result<i64>;
}

/// Webhook endpoints and the append-only delivery log.
#[async_trait]
pub trait WebhookStore: Send + Sync {
    async fn insert_endpoint(&self, endpoint: &WebhookEndpoint) -> Result<()>;

    async fn get_endpoint(&self, id: WebhookEndpointId) -> Result<Option<WebhookEndpoint>>;

    async fn active_endpoints(&self, account_id: AccountId) -> Result<Vec<WebhookEndpoint>>;

    async fn insert_delivery(&self, delivery: &WebhookDelivery) -> Result<()>;

    async fn get_delivery(&self, id: WebhookDeliveryId) -> Result<Option<WebhookDelivery>>;

    /// Delivery attempts for an order, oldest first.
    async fn deliveries_for_order(&self, order_id: OrderId) -> Result<Vec<WebhookDelivery>>;
}

/// Key/value business settings.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn load_settings(&self) -> Result<HashMap<String, String>>;

    async fn put_setting(&self, key: &str, value: &str) -> Result<()>;
}

/// The full ledger collaborator.
pub trait LedgerStore:
    OrderStore
    + StockStore
    + PaymentStore
    + JobStore
    + WalletStore
    + WebhookStore
    + SettingsStore
    + Clone
    + 'static
{
}

// Blanket implementation for every store that covers all entities
impl<T> LedgerStore for T where
    T: OrderStore
        + StockStore
        + PaymentStore
        + JobStore
        + WalletStore
        + WebhookStore
        + SettingsStore
        + Clone
        + 'static
{
}

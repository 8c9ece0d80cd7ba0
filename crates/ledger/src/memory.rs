use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{
    AccountId, JobId, OrderId, OrderItemId, PaymentId, ProductId, WebhookDeliveryId,
    WebhookEndpointId,
};
use domain::{
    ChargeDetails, FulfillmentJob, JobStatus, Order, OrderItem, OrderStatus, Payment,
    PaymentSettlement, PaymentStatus, PointAward, StockItem, StockStatus, Wallet, WalletEntry,
    WalletEntryKind, WalletPosting, WalletTransaction, WebhookDelivery, WebhookEndpoint,
};
use tokio::sync::RwLock;

use crate::{
    LedgerError, Result,
    store::{
        JobStore, OrderStore, PaymentStore, SettingsStore, StockStore, WalletStore, WebhookStore,
    },
};

#[derive(Default)]
struct Tables {
    orders: HashMap<OrderId, Order>,
    items: Vec<OrderItem>,
    stock: Vec<StockItem>,
    payments: Vec<Payment>,
    jobs: Vec<FulfillmentJob>,
    wallets: HashMap<AccountId, Wallet>,
    wallet_transactions: Vec<WalletTransaction>,
    point_awards: Vec<PointAward>,
    endpoints: Vec<WebhookEndpoint>,
    deliveries: Vec<WebhookDelivery>,
    settings: HashMap<String, String>,
}

/// In-memory ledger for tests and local runs.
///
/// All tables sit behind one lock, so every conditional write is atomic
/// with respect to every other. Each write that changes a row bumps a
/// counter that tests use to assert that a path wrote nothing.
#[derive(Clone, Default)]
pub struct InMemoryLedger {
    tables: Arc<RwLock<Tables>>,
    mutations: Arc<AtomicU64>,
}

impl InMemoryLedger {
    /// Creates a new empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of row-changing writes performed so far.
    pub fn mutation_count(&self) -> u64 {
        self.mutations.load(Ordering::SeqCst)
    }

    /// Clears every table.
    pub async fn clear(&self) {
        *self.tables.write().await = Tables::default();
    }

    fn touched(&self) {
        self.mutations.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl OrderStore for InMemoryLedger {
    async fn insert_order(&self, order: &Order, items: &[OrderItem]) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.orders.contains_key(&order.id) {
            return Err(LedgerError::Duplicate {
                entity: "order",
                id: order.id.to_string(),
            });
        }
        tables.orders.insert(order.id, order.clone());
        tables.items.extend(items.iter().cloned());
        self.touched();
        Ok(())
    }

    async fn get_order(&self, id: OrderId) -> Result<Option<Order>> {
        Ok(self.tables.read().await.orders.get(&id).cloned())
    }

    async fn get_order_items(&self, order_id: OrderId) -> Result<Vec<OrderItem>> {
        let tables = self.tables.read().await;
        Ok(tables
            .items
            .iter()
            .filter(|i| i.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn get_order_item(&self, id: OrderItemId) -> Result<Option<OrderItem>> {
        let tables = self.tables.read().await;
        Ok(tables.items.iter().find(|i| i.id == id).cloned())
    }

    async fn transition_order(
        &self,
        id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tables = self.tables.write().await;

        if to == OrderStatus::Delivered
            && tables
                .items
                .iter()
                .any(|i| i.order_id == id && !i.is_delivered())
        {
            return Ok(false);
        }

        let Some(order) = tables.orders.get_mut(&id) else {
            return Ok(false);
        };
        if order.status != from {
            return Ok(false);
        }

        order.status = to;
        order.updated_at = at;
        match to {
            OrderStatus::Paid => order.paid_at = Some(at),
            OrderStatus::Delivered => order.delivered_at = Some(at),
            _ => {}
        }
        self.touched();
        Ok(true)
    }

    async fn orders_with_status(
        &self,
        status: OrderStatus,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Order>> {
        let tables = self.tables.read().await;
        let mut orders: Vec<_> = tables
            .orders
            .values()
            .filter(|o| o.status == status && o.updated_at < updated_before)
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.updated_at);
        orders.truncate(limit);
        Ok(orders)
    }

    async fn mark_rewards_granted(&self, id: OrderId) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.orders.get_mut(&id) {
            Some(order) if !order.rewards_granted => {
                order.rewards_granted = true;
                self.touched();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_item_delivery(
        &self,
        item_id: OrderItemId,
        delivery_data: &serde_json::Value,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.items.iter_mut().find(|i| i.id == item_id) {
            Some(item) if item.delivery_data.is_none() => {
                item.delivery_data = Some(delivery_data.clone());
                item.delivered_at = Some(at);
                self.touched();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl StockStore for InMemoryLedger {
    async fn insert_stock(&self, units: &[StockItem]) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(dup) = units
            .iter()
            .find(|u| tables.stock.iter().any(|s| s.id == u.id))
        {
            return Err(LedgerError::Duplicate {
                entity: "stock item",
                id: dup.id.to_string(),
            });
        }
        tables.stock.extend(units.iter().cloned());
        self.touched();
        Ok(())
    }

    async fn claim_stock(
        &self,
        product_id: &ProductId,
        quantity: u32,
        order_id: OrderId,
        order_item_id: OrderItemId,
        at: DateTime<Utc>,
    ) -> Result<Option<Vec<StockItem>>> {
        let mut tables = self.tables.write().await;

        // A re-run for the same item gets back what it already holds.
        let held: Vec<_> = tables
            .stock
            .iter()
            .filter(|s| s.order_item_id == Some(order_item_id))
            .cloned()
            .collect();
        if !held.is_empty() {
            return Ok(Some(held));
        }

        let closed = tables
            .orders
            .get(&order_id)
            .is_some_and(|o| o.status.is_closed());
        if closed {
            return Ok(None);
        }

        let mut candidates: Vec<usize> = tables
            .stock
            .iter()
            .enumerate()
            .filter(|(_, s)| &s.product_id == product_id && s.status == StockStatus::Available)
            .map(|(idx, _)| idx)
            .collect();
        if candidates.len() < quantity as usize {
            return Ok(None);
        }
        candidates.sort_by_key(|&idx| (tables.stock[idx].created_at, tables.stock[idx].id));
        candidates.truncate(quantity as usize);

        let mut claimed = Vec::with_capacity(candidates.len());
        for idx in candidates {
            let unit = &mut tables.stock[idx];
            unit.status = StockStatus::Reserved;
            unit.order_id = Some(order_id);
            unit.order_item_id = Some(order_item_id);
            unit.reserved_at = Some(at);
            claimed.push(unit.clone());
        }
        if !claimed.is_empty() {
            self.touched();
        }
        Ok(Some(claimed))
    }

    async fn stock_for_item(&self, order_item_id: OrderItemId) -> Result<Vec<StockItem>> {
        let tables = self.tables.read().await;
        Ok(tables
            .stock
            .iter()
            .filter(|s| s.order_item_id == Some(order_item_id))
            .cloned()
            .collect())
    }

    async fn release_stock(&self, order_id: OrderId) -> Result<u64> {
        let mut tables = self.tables.write().await;
        let mut released = 0;
        for unit in tables
            .stock
            .iter_mut()
            .filter(|s| s.order_id == Some(order_id) && s.status == StockStatus::Reserved)
        {
            unit.status = StockStatus::Available;
            unit.order_id = None;
            unit.order_item_id = None;
            unit.reserved_at = None;
            released += 1;
        }
        if released > 0 {
            self.touched();
        }
        Ok(released)
    }

    async fn finalize_stock(&self, order_id: OrderId, at: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.tables.write().await;
        let mut sold = 0;
        for unit in tables
            .stock
            .iter_mut()
            .filter(|s| s.order_id == Some(order_id) && s.status == StockStatus::Reserved)
        {
            unit.status = StockStatus::Sold;
            unit.sold_at = Some(at);
            sold += 1;
        }
        if sold > 0 {
            self.touched();
        }
        Ok(sold)
    }

    async fn finalize_item_stock(
        &self,
        order_item_id: OrderItemId,
        at: DateTime<Utc>,
    ) -> Result<u64> {
        let mut tables = self.tables.write().await;
        let mut sold = 0;
        for unit in tables.stock.iter_mut().filter(|s| {
            s.order_item_id == Some(order_item_id) && s.status == StockStatus::Reserved
        }) {
            unit.status = StockStatus::Sold;
            unit.sold_at = Some(at);
            sold += 1;
        }
        if sold > 0 {
            self.touched();
        }
        Ok(sold)
    }

    async fn count_stock(&self, product_id: &ProductId, status: StockStatus) -> Result<u64> {
        let tables = self.tables.read().await;
        Ok(tables
            .stock
            .iter()
            .filter(|s| &s.product_id == product_id && s.status == status)
            .count() as u64)
    }
}

#[async_trait]
impl PaymentStore for InMemoryLedger {
    async fn insert_payment(&self, payment: &Payment) -> Result<bool> {
        let mut tables = self.tables.write().await;
        if tables.payments.iter().any(|p| p.ref_id == payment.ref_id) {
            return Err(LedgerError::Duplicate {
                entity: "payment",
                id: payment.ref_id.clone(),
            });
        }
        if tables
            .payments
            .iter()
            .any(|p| p.order_id == payment.order_id && p.status == PaymentStatus::Pending)
        {
            return Ok(false);
        }
        tables.payments.push(payment.clone());
        self.touched();
        Ok(true)
    }

    async fn get_payment(&self, id: PaymentId) -> Result<Option<Payment>> {
        let tables = self.tables.read().await;
        Ok(tables.payments.iter().find(|p| p.id == id).cloned())
    }

    async fn payment_by_ref(&self, ref_id: &str) -> Result<Option<Payment>> {
        let tables = self.tables.read().await;
        Ok(tables.payments.iter().find(|p| p.ref_id == ref_id).cloned())
    }

    async fn pending_payment(&self, order_id: OrderId) -> Result<Option<Payment>> {
        let tables = self.tables.read().await;
        Ok(tables
            .payments
            .iter()
            .find(|p| p.order_id == order_id && p.status == PaymentStatus::Pending)
            .cloned())
    }

    async fn latest_payment(&self, order_id: OrderId) -> Result<Option<Payment>> {
        let tables = self.tables.read().await;
        Ok(tables
            .payments
            .iter()
            .filter(|p| p.order_id == order_id)
            .max_by_key(|p| p.created_at)
            .cloned())
    }

    async fn attach_charge(
        &self,
        id: PaymentId,
        charge: &ChargeDetails,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.payments.iter_mut().find(|p| p.id == id) {
            Some(payment) if payment.status == PaymentStatus::Pending => {
                payment.external_trx_id = charge.external_trx_id.clone();
                payment.qr_link = charge.qr_link.clone();
                payment.pay_url = charge.pay_url.clone();
                payment.expires_at = charge.expires_at;
                payment.updated_at = at;
                self.touched();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn settle_payment(
        &self,
        id: PaymentId,
        settlement: &PaymentSettlement,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.payments.iter_mut().find(|p| p.id == id) {
            Some(payment) if payment.status == PaymentStatus::Pending => {
                payment.status = settlement.status;
                if settlement.external_trx_id.is_some() {
                    payment.external_trx_id = settlement.external_trx_id.clone();
                }
                payment.fee = settlement.fee;
                payment.net_amount = settlement.net_amount;
                payment.paid_at = settlement.paid_at;
                payment.updated_at = at;
                self.touched();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl JobStore for InMemoryLedger {
    async fn insert_job(&self, job: &FulfillmentJob) -> Result<bool> {
        let mut tables = self.tables.write().await;
        if tables
            .jobs
            .iter()
            .any(|j| j.order_item_id == job.order_item_id)
        {
            return Ok(false);
        }
        tables.jobs.push(job.clone());
        self.touched();
        Ok(true)
    }

    async fn get_job(&self, id: JobId) -> Result<Option<FulfillmentJob>> {
        let tables = self.tables.read().await;
        Ok(tables.jobs.iter().find(|j| j.id == id).cloned())
    }

    async fn jobs_for_order(&self, order_id: OrderId) -> Result<Vec<FulfillmentJob>> {
        let tables = self.tables.read().await;
        Ok(tables
            .jobs
            .iter()
            .filter(|j| j.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn claim_due_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<FulfillmentJob>> {
        let mut tables = self.tables.write().await;

        let mut due: Vec<usize> = tables
            .jobs
            .iter()
            .enumerate()
            .filter(|(_, j)| j.is_due(now))
            .map(|(idx, _)| idx)
            .collect();
        due.sort_by_key(|&idx| tables.jobs[idx].created_at);
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for idx in due {
            let job = &mut tables.jobs[idx];
            job.status = JobStatus::Processing;
            job.started_at = Some(now);
            job.updated_at = now;
            claimed.push(job.clone());
        }
        if !claimed.is_empty() {
            self.touched();
        }
        Ok(claimed)
    }

    async fn start_job(&self, id: JobId, now: DateTime<Utc>) -> Result<Option<FulfillmentJob>> {
        let mut tables = self.tables.write().await;
        match tables.jobs.iter_mut().find(|j| j.id == id) {
            Some(job) if job.is_due(now) => {
                job.status = JobStatus::Processing;
                job.started_at = Some(now);
                job.updated_at = now;
                self.touched();
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn complete_job(
        &self,
        id: JobId,
        result: &serde_json::Value,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.jobs.iter_mut().find(|j| j.id == id) {
            Some(job) if job.status == JobStatus::Processing => {
                job.status = JobStatus::Completed;
                job.result = Some(result.clone());
                job.next_retry_at = None;
                job.completed_at = Some(at);
                job.updated_at = at;
                self.touched();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn requeue_job(
        &self,
        id: JobId,
        observed_attempts: u32,
        attempts: u32,
        error: &str,
        next_retry_at: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.jobs.iter_mut().find(|j| j.id == id) {
            Some(job)
                if job.status == JobStatus::Processing && job.attempts == observed_attempts =>
            {
                job.status = JobStatus::Pending;
                job.attempts = attempts.min(job.max_attempts);
                job.last_error = Some(error.to_string());
                job.next_retry_at = Some(next_retry_at);
                job.started_at = None;
                job.updated_at = at;
                self.touched();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fail_job(
        &self,
        id: JobId,
        observed_attempts: u32,
        attempts: u32,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.jobs.iter_mut().find(|j| j.id == id) {
            Some(job)
                if job.status == JobStatus::Processing && job.attempts == observed_attempts =>
            {
                job.status = JobStatus::Failed;
                job.attempts = attempts.min(job.max_attempts);
                job.last_error = Some(error.to_string());
                job.next_retry_at = None;
                job.updated_at = at;
                self.touched();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn stale_jobs(
        &self,
        started_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<FulfillmentJob>> {
        let tables = self.tables.read().await;
        let mut stale: Vec<_> = tables
            .jobs
            .iter()
            .filter(|j| {
                j.status == JobStatus::Processing
                    && j.started_at.is_some_and(|at| at < started_before)
            })
            .cloned()
            .collect();
        stale.sort_by_key(|j| j.started_at);
        stale.truncate(limit);
        Ok(stale)
    }

    async fn failed_jobs(&self, limit: usize) -> Result<Vec<FulfillmentJob>> {
        let tables = self.tables.read().await;
        let mut failed: Vec<_> = tables
            .jobs
            .iter()
            .filter(|j| j.status == JobStatus::Failed)
            .cloned()
            .collect();
        failed.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        failed.truncate(limit);
        Ok(failed)
    }
}

#[async_trait]
impl WalletStore for InMemoryLedger {
    async fn get_wallet(&self, account_id: AccountId) -> Result<Option<Wallet>> {
        Ok(self.tables.read().await.wallets.get(&account_id).cloned())
    }

    async fn post_wallet_entry(
        &self,
        entry: &WalletEntry,
        at: DateTime<Utc>,
    ) -> Result<WalletPosting> {
        let mut tables = self.tables.write().await;

        if let Some(existing) = tables
            .wallet_transactions
            .iter()
            .find(|t| t.kind == entry.kind && t.reference == entry.reference)
        {
            return Ok(WalletPosting::Duplicate(existing.clone()));
        }

        let current = tables
            .wallets
            .get(&entry.account_id)
            .cloned()
            .unwrap_or_else(|| Wallet::empty(entry.account_id, at));
        let Some(next) = current.posted(entry, at) else {
            return Ok(WalletPosting::InsufficientBalance {
                balance: current.balance,
            });
        };

        let txn = WalletTransaction::record(entry, next.balance, at);
        tables.wallets.insert(entry.account_id, next);
        tables.wallet_transactions.push(txn.clone());
        self.touched();
        Ok(WalletPosting::Applied(txn))
    }

    async fn wallet_transactions(&self, account_id: AccountId) -> Result<Vec<WalletTransaction>> {
        let tables = self.tables.read().await;
        Ok(tables
            .wallet_transactions
            .iter()
            .filter(|t| t.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn find_wallet_transaction(
        &self,
        kind: WalletEntryKind,
        reference: &str,
    ) -> Result<Option<WalletTransaction>> {
        let tables = self.tables.read().await;
        Ok(tables
            .wallet_transactions
            .iter()
            .find(|t| t.kind == kind && t.reference == reference)
            .cloned())
    }

    async fn award_points(&self, award: &PointAward) -> Result<bool> {
        let mut tables = self.tables.write().await;
        if tables
            .point_awards
            .iter()
            .any(|a| a.order_id == award.order_id)
        {
            return Ok(false);
        }
        tables.point_awards.push(award.clone());
        self.touched();
        Ok(true)
    }

    async fn points_balance(&self, account_id: AccountId) -> Result<i64> {
        let tables = self.tables.read().await;
        Ok(tables
            .point_awards
            .iter()
            .filter(|a| a.account_id == account_id)
            .map(|a| a.points)
            .sum())
    }
}

#[async_trait]
impl WebhookStore for InMemoryLedger {
    async fn insert_endpoint(&self, endpoint: &WebhookEndpoint) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.endpoints.iter().any(|e| e.id == endpoint.id) {
            return Err(LedgerError::Duplicate {
                entity: "webhook endpoint",
                id: endpoint.id.to_string(),
            });
        }
        tables.endpoints.push(endpoint.clone());
        self.touched();
        Ok(())
    }

    async fn get_endpoint(&self, id: WebhookEndpointId) -> Result<Option<WebhookEndpoint>> {
        let tables = self.tables.read().await;
        Ok(tables.endpoints.iter().find(|e| e.id == id).cloned())
    }

    async fn active_endpoints(&self, account_id: AccountId) -> Result<Vec<WebhookEndpoint>> {
        let tables = self.tables.read().await;
        Ok(tables
            .endpoints
            .iter()
            .filter(|e| e.account_id == account_id && e.active)
            .cloned()
            .collect())
    }

    async fn insert_delivery(&self, delivery: &WebhookDelivery) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.deliveries.iter().any(|d| d.id == delivery.id) {
            return Err(LedgerError::Duplicate {
                entity: "webhook delivery",
                id: delivery.id.to_string(),
            });
        }
        tables.deliveries.push(delivery.clone());
        self.touched();
        Ok(())
    }

    async fn get_delivery(&self, id: WebhookDeliveryId) -> Result<Option<WebhookDelivery>> {
        let tables = self.tables.read().await;
        Ok(tables.deliveries.iter().find(|d| d.id == id).cloned())
    }

    async fn deliveries_for_order(&self, order_id: OrderId) -> Result<Vec<WebhookDelivery>> {
        let tables = self.tables.read().await;
        Ok(tables
            .deliveries
            .iter()
            .filter(|d| d.order_id == order_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SettingsStore for InMemoryLedger {
    async fn load_settings(&self) -> Result<HashMap<String, String>> {
        Ok(self.tables.read().await.settings.clone())
    }

    async fn put_setting(&self, key: &str, value: &str) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.settings.insert(key.to_string(), value.to_string());
        self.touched();
        Ok(())
    }
}

//! Settlement coordinator: drives an order from checkout to delivery.
//!
//! Every component writes through the ledger with conditional updates, so
//! the coordinator can be driven concurrently by buyer polls, gateway
//! callbacks, the background worker loop and operators without any
//! in-process locking. Side effects tied to a state boundary (job
//! creation, stock settlement, rewards, notifications) run only in the
//! call whose conditional write crossed that boundary.

use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, Duration, Utc};
use common::{AccountId, JobId, OrderId, WebhookDeliveryId};
use domain::{
    BuyerStatus, FulfillmentJob, Money, Order, OrderEvent, OrderItem, OrderStatus, Payment,
    PaymentStatus, RetryPolicy, WalletTransaction, WebhookDelivery,
};
use futures_util::StreamExt;
use ledger::LedgerStore;
use serde::Serialize;

use crate::allocator::StockAllocator;
use crate::checkout::{CheckoutService, PlaceOrder};
use crate::dispatcher::NotificationDispatcher;
use crate::error::{Result, SettlementError};
use crate::machine::OrderStateMachine;
use crate::reconciler::{PaymentReconciler, ReconcileOutcome};
use crate::scheduler::{FulfillmentScheduler, JobOutcome};
use crate::services::{InviteProvider, Notifier, PaymentGateway, WebhookTransport};
use crate::settings::SettingsCache;
use crate::wallet::{WalletPayment, WalletService};
use crate::worker::FulfillmentWorker;

/// Tunables that are not business settings.
#[derive(Debug, Clone, Copy)]
pub struct CoordinatorConfig {
    pub retry_policy: RetryPolicy,
    /// How long a loaded settings snapshot is served before reloading.
    pub settings_refresh: StdDuration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            settings_refresh: StdDuration::from_secs(60),
        }
    }
}

/// Tally of one fulfillment batch pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub claimed: usize,
    pub completed: usize,
    pub retrying: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Runs that hit a ledger error; the job is left for stale recovery.
    pub errors: usize,
}

impl BatchReport {
    fn record(&mut self, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Completed => self.completed += 1,
            JobOutcome::Retrying => self.retrying += 1,
            JobOutcome::Failed => self.failed += 1,
            JobOutcome::Skipped => self.skipped += 1,
        }
    }
}

/// What a buyer may see of their order.
#[derive(Debug, Clone, Serialize)]
pub struct OrderView {
    pub order_id: OrderId,
    pub status: BuyerStatus,
    pub customer_email: String,
    pub subtotal: Money,
    pub discount_amount: Money,
    pub points_discount: Money,
    pub total_amount: Money,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub payment: Option<PaymentView>,
    pub items: Vec<ItemView>,
}

/// The buyer-facing part of the latest payment attempt.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentView {
    pub ref_id: String,
    pub status: PaymentStatus,
    pub amount: Money,
    pub qr_link: Option<String>,
    pub pay_url: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl From<Payment> for PaymentView {
    fn from(p: Payment) -> Self {
        Self {
            ref_id: p.ref_id,
            status: p.status,
            amount: p.amount,
            qr_link: p.qr_link,
            pay_url: p.pay_url,
            expires_at: p.expires_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemView {
    pub product_name: String,
    pub quantity: u32,
    pub unit_price: Money,
    pub total_price: Money,
    /// Only present once the whole order is delivered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_data: Option<serde_json::Value>,
}

impl OrderView {
    fn build(order: Order, items: Vec<OrderItem>, payment: Option<Payment>) -> Self {
        let delivered = order.status == OrderStatus::Delivered;
        Self {
            order_id: order.id,
            status: order.status.buyer_view(),
            customer_email: order.customer_email,
            subtotal: order.subtotal,
            discount_amount: order.discount_amount,
            points_discount: order.points_discount,
            total_amount: order.total_amount,
            created_at: order.created_at,
            paid_at: order.paid_at,
            delivered_at: order.delivered_at,
            payment: payment.map(PaymentView::from),
            items: items
                .into_iter()
                .map(|item| ItemView {
                    product_name: item.product_name,
                    quantity: item.quantity,
                    unit_price: item.unit_price,
                    total_price: item.total_price,
                    delivery_data: if delivered { item.delivery_data } else { None },
                })
                .collect(),
        }
    }
}

/// Orchestrates checkout, payment, fulfillment and notification.
pub struct SettlementCoordinator<L, G, P, N, T>
where
    L: LedgerStore,
    G: PaymentGateway,
    P: InviteProvider,
    N: Notifier,
    T: WebhookTransport,
{
    ledger: L,
    machine: OrderStateMachine<L>,
    checkout: CheckoutService<L>,
    reconciler: PaymentReconciler<L, G>,
    allocator: StockAllocator<L>,
    scheduler: FulfillmentScheduler<L>,
    worker: FulfillmentWorker<L, P>,
    dispatcher: NotificationDispatcher<L, N, T>,
    wallet: WalletService<L>,
    settings: SettingsCache<L>,
}

impl<L, G, P, N, T> SettlementCoordinator<L, G, P, N, T>
where
    L: LedgerStore,
    G: PaymentGateway,
    P: InviteProvider,
    N: Notifier,
    T: WebhookTransport,
{
    /// Creates a new coordinator over `ledger` and the external services.
    pub fn new(
        ledger: L,
        gateway: G,
        provider: P,
        notifier: N,
        transport: T,
        config: CoordinatorConfig,
    ) -> Self {
        let policy = config.retry_policy;
        Self {
            machine: OrderStateMachine::new(ledger.clone()),
            checkout: CheckoutService::new(ledger.clone()),
            reconciler: PaymentReconciler::new(ledger.clone(), gateway),
            allocator: StockAllocator::new(ledger.clone()),
            scheduler: FulfillmentScheduler::new(ledger.clone(), policy),
            worker: FulfillmentWorker::new(
                ledger.clone(),
                FulfillmentScheduler::new(ledger.clone(), policy),
                provider,
            ),
            dispatcher: NotificationDispatcher::new(ledger.clone(), notifier, transport),
            wallet: WalletService::new(ledger.clone()),
            settings: SettingsCache::new(ledger.clone(), config.settings_refresh),
            ledger,
        }
    }

    /// The ledger the coordinator writes through.
    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    /// The business settings cache.
    pub fn settings(&self) -> &SettingsCache<L> {
        &self.settings
    }

    /// Creates an order awaiting payment. An order discounted down to zero
    /// has nothing to pay and goes straight on to fulfillment.
    pub async fn place_order(&self, request: PlaceOrder) -> Result<(Order, Vec<OrderItem>)> {
        let (order, items) = self.checkout.place_order(request).await?;
        if !order.total_amount.is_zero() {
            return Ok((order, items));
        }

        match self.reconcile(order.id).await {
            Ok(outcome) => Ok((outcome.order, items)),
            Err(e) => {
                // the order is stored; a later reconcile settles it
                tracing::error!(order_id = %order.id, error = %e, "settling free order failed");
                Ok((order, items))
            }
        }
    }

    /// Opens (or returns the already open) gateway payment for an order.
    pub async fn open_payment(&self, order_id: OrderId) -> Result<Payment> {
        let settings = self.settings.get().await?;
        self.reconciler.open_payment(order_id, &settings).await
    }

    /// Resolves the order's payment against the gateway and, when this
    /// call is the one that moved the order to PAID, starts fulfillment.
    #[tracing::instrument(skip(self))]
    pub async fn reconcile(&self, order_id: OrderId) -> Result<ReconcileOutcome> {
        let mut outcome = self.reconciler.reconcile(order_id).await?;
        if outcome.became_paid {
            // the payment is durable either way; paid-order recovery retries
            // whatever did not happen here
            if let Err(e) = self.after_paid(order_id).await {
                tracing::error!(%order_id, error = %e, "post-payment steps failed");
            }
            outcome.order = self.machine.load(order_id).await?;
        }
        Ok(outcome)
    }

    /// Handles a gateway push notification for `ref_id`.
    ///
    /// The push body is not trusted: the payment is looked up locally and
    /// reconciled by querying the gateway.
    #[tracing::instrument(skip(self))]
    pub async fn handle_gateway_callback(&self, ref_id: &str) -> Result<ReconcileOutcome> {
        let payment = self
            .ledger
            .payment_by_ref(ref_id)
            .await?
            .ok_or_else(|| SettlementError::PaymentNotFound(ref_id.to_string()))?;
        self.reconcile(payment.order_id).await
    }

    /// Pays an order from the owning reseller's wallet.
    #[tracing::instrument(skip(self))]
    pub async fn pay_with_wallet(
        &self,
        order_id: OrderId,
        account_id: AccountId,
    ) -> Result<WalletPayment> {
        let payment = self.wallet.pay_order(order_id, account_id).await?;
        if payment.became_paid {
            if let Err(e) = self.after_paid(order_id).await {
                tracing::error!(%order_id, error = %e, "post-payment steps failed");
            }
        }
        Ok(payment)
    }

    /// Credits a reseller wallet top-up.
    pub async fn top_up(
        &self,
        account_id: AccountId,
        amount: Money,
        reference: &str,
    ) -> Result<WalletTransaction> {
        let settings = self.settings.get().await?;
        self.wallet
            .top_up(account_id, amount, reference, &settings)
            .await
    }

    /// Loyalty points an account has earned.
    pub async fn points_balance(&self, account_id: AccountId) -> Result<i64> {
        self.wallet.points_balance(account_id).await
    }

    /// Claims up to `limit` due jobs and runs them with at most
    /// `concurrency` in flight. A failing job never stops the others.
    #[tracing::instrument(skip(self))]
    pub async fn run_fulfillment_batch(
        &self,
        limit: usize,
        concurrency: usize,
    ) -> Result<BatchReport> {
        let start = Instant::now();
        let jobs = self.scheduler.claim_batch(limit).await?;
        let mut report = BatchReport {
            claimed: jobs.len(),
            ..BatchReport::default()
        };
        if jobs.is_empty() {
            return Ok(report);
        }

        let results: Vec<(JobId, Result<JobOutcome>)> = futures_util::stream::iter(jobs)
            .map(|job| async move {
                let result = self.process_job(&job).await;
                (job.id, result)
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

        for (job_id, result) in results {
            match result {
                Ok(outcome) => report.record(outcome),
                Err(e) => {
                    report.errors += 1;
                    tracing::error!(%job_id, error = %e, "fulfillment job run errored");
                }
            }
        }

        metrics::histogram!("fulfillment_batch_duration_seconds")
            .record(start.elapsed().as_secs_f64());
        tracing::info!(
            claimed = report.claimed,
            completed = report.completed,
            retrying = report.retrying,
            failed = report.failed,
            "fulfillment batch finished"
        );
        Ok(report)
    }

    /// Runs one claimed job and folds its result into the parent order.
    pub async fn process_job(&self, job: &FulfillmentJob) -> Result<JobOutcome> {
        let outcome = self.worker.run(job).await?;
        if outcome != JobOutcome::Retrying {
            self.settle_order(job.order_id).await?;
        }
        Ok(outcome)
    }

    /// Cancels an order the operator last saw in `observed`.
    ///
    /// Returns `false` if the order had already moved on. On success any
    /// reserved stock goes back to the pool and a wallet payment is refunded.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_order(&self, order_id: OrderId, observed: OrderStatus) -> Result<bool> {
        let cancelled = self
            .machine
            .transition(order_id, observed, OrderStatus::Cancelled)
            .await?;
        if !cancelled {
            return Ok(false);
        }

        let released = self.allocator.release(order_id).await?;
        let refund = self.wallet.refund(order_id).await?;
        tracing::info!(
            %order_id,
            released,
            refunded = refund.is_some(),
            "order cancelled"
        );
        Ok(true)
    }

    /// Finishes orders left in PAID by a run that stopped between the
    /// payment and job creation. Orders updated less than `older_than` ago
    /// are left to the run that is still handling them.
    #[tracing::instrument(skip(self))]
    pub async fn recover_paid_orders(&self, older_than: Duration, limit: usize) -> Result<usize> {
        let stuck = self
            .ledger
            .orders_with_status(OrderStatus::Paid, Utc::now() - older_than, limit)
            .await?;
        let mut recovered = 0;
        for order in &stuck {
            if self.after_paid(order.id).await? {
                recovered += 1;
            }
        }
        if recovered > 0 {
            tracing::warn!(recovered, "recovered orders stuck in PAID");
        }
        Ok(recovered)
    }

    /// Treats jobs PROCESSING for longer than `older_than` as a transient
    /// failure of a worker that died mid-run.
    #[tracing::instrument(skip(self))]
    pub async fn requeue_stale_jobs(&self, older_than: Duration, limit: usize) -> Result<usize> {
        let stale = self.scheduler.stale_jobs(older_than, limit).await?;
        let mut requeued = 0;
        for job in &stale {
            let error = SettlementError::transient(
                "fulfillment worker",
                format!("job abandoned after running longer than {older_than}"),
            );
            match self.scheduler.record_failure(job, &error).await? {
                JobOutcome::Skipped => {}
                JobOutcome::Failed => {
                    requeued += 1;
                    self.settle_order(job.order_id).await?;
                }
                _ => requeued += 1,
            }
        }
        Ok(requeued)
    }

    /// Re-runs aggregation for PROCESSING orders whose last job finished
    /// without the order being moved on.
    #[tracing::instrument(skip(self))]
    pub async fn resettle_processing_orders(
        &self,
        older_than: Duration,
        limit: usize,
    ) -> Result<usize> {
        let orders = self
            .ledger
            .orders_with_status(OrderStatus::Processing, Utc::now() - older_than, limit)
            .await?;
        let mut settled = 0;
        for order in &orders {
            if self.settle_order(order.id).await?.is_some() {
                settled += 1;
            }
        }
        Ok(settled)
    }

    /// Permanently failed jobs, for operators.
    pub async fn failed_jobs(&self, limit: usize) -> Result<Vec<FulfillmentJob>> {
        self.scheduler.failed_jobs(limit).await
    }

    /// Replays a failed webhook delivery.
    pub async fn retry_webhook(&self, delivery_id: WebhookDeliveryId) -> Result<WebhookDelivery> {
        self.dispatcher.retry(delivery_id).await
    }

    /// Every webhook delivery attempt for an order.
    pub async fn webhook_deliveries(&self, order_id: OrderId) -> Result<Vec<WebhookDelivery>> {
        self.dispatcher.deliveries(order_id).await
    }

    /// The buyer's view of an order.
    pub async fn order_view(&self, order_id: OrderId) -> Result<OrderView> {
        let (order, items) = self.machine.load_with_items(order_id).await?;
        let payment = self.ledger.latest_payment(order_id).await?;
        Ok(OrderView::build(order, items, payment))
    }

    /// Creates jobs for a PAID order and moves it to PROCESSING.
    ///
    /// Job creation is idempotent; the PAID notification goes out only from
    /// the call that made the move. Returns whether this call moved it.
    async fn after_paid(&self, order_id: OrderId) -> Result<bool> {
        if self.machine.load(order_id).await?.status != OrderStatus::Paid {
            return Ok(false);
        }
        let settings = self.settings.get().await?;
        self.scheduler.enqueue_jobs(order_id, &settings).await?;

        let moved = self
            .machine
            .transition(order_id, OrderStatus::Paid, OrderStatus::Processing)
            .await?;
        if moved {
            let (order, items) = self.machine.load_with_items(order_id).await?;
            self.dispatcher
                .dispatch(OrderEvent::Paid, &order, &items)
                .await?;
        }
        Ok(moved)
    }

    /// Aggregates a PROCESSING order and runs the hooks of the terminal
    /// state it reached, if any.
    async fn settle_order(&self, order_id: OrderId) -> Result<Option<OrderStatus>> {
        let reached = self.scheduler.aggregate(order_id).await?;
        match reached {
            Some(OrderStatus::Delivered) => self.after_delivered(order_id).await?,
            Some(OrderStatus::Failed) => self.after_failed(order_id).await?,
            _ => {}
        }
        Ok(reached)
    }

    async fn after_delivered(&self, order_id: OrderId) -> Result<()> {
        self.allocator.finalize(order_id).await?;

        let settings = self.settings.get().await?;
        let (order, items) = self.machine.load_with_items(order_id).await?;
        self.wallet.grant_rewards(&order, &settings).await?;

        tracing::info!(%order_id, "order delivered");
        self.dispatcher
            .dispatch(OrderEvent::Delivered, &order, &items)
            .await?;
        Ok(())
    }

    async fn after_failed(&self, order_id: OrderId) -> Result<()> {
        let released = self.allocator.release(order_id).await?;
        let refund = self.wallet.refund(order_id).await?;
        tracing::warn!(
            %order_id,
            released,
            refunded = refund.is_some(),
            "order failed"
        );

        let (order, items) = self.machine.load_with_items(order_id).await?;
        self.dispatcher
            .dispatch(OrderEvent::Failed, &order, &items)
            .await?;
        Ok(())
    }
}

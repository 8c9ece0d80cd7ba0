//! Fulfillment worker: executes one claimed job.

use chrono::Utc;
use domain::{FulfillmentJob, JobStatus, JobType, Order, OrderItem, StockItem, StockStatus};
use ledger::{JobStore, OrderStore, StockStore};
use serde_json::json;

use crate::allocator::StockAllocator;
use crate::error::{Result, SettlementError};
use crate::scheduler::{FulfillmentScheduler, JobOutcome};
use crate::services::{InviteProvider, InviteRequest};

/// Input keys checked, in order, for an INVITE item's target identifier.
const INVITE_TARGET_KEYS: [&str; 2] = ["email", "target"];

/// Runs claimed fulfillment jobs against stock and the invite provider.
///
/// Safe to call more than once for the same job: the job is re-read first
/// and anything that is no longer PROCESSING is skipped, and an item that
/// already carries delivery data is completed without new provider work.
pub struct FulfillmentWorker<L, P> {
    ledger: L,
    allocator: StockAllocator<L>,
    scheduler: FulfillmentScheduler<L>,
    provider: P,
}

impl<L, P> FulfillmentWorker<L, P>
where
    L: OrderStore + JobStore + StockStore + Clone,
    P: InviteProvider,
{
    pub fn new(ledger: L, scheduler: FulfillmentScheduler<L>, provider: P) -> Self {
        Self {
            allocator: StockAllocator::new(ledger.clone()),
            ledger,
            scheduler,
            provider,
        }
    }

    /// Executes one run of `job` and records its outcome.
    #[tracing::instrument(skip(self, job), fields(job_id = %job.id, job_type = %job.job_type))]
    pub async fn run(&self, job: &FulfillmentJob) -> Result<JobOutcome> {
        let outcome = self.execute(job).await?;
        metrics::counter!("fulfillment_jobs_total", "outcome" => outcome.as_str()).increment(1);
        Ok(outcome)
    }

    async fn execute(&self, job: &FulfillmentJob) -> Result<JobOutcome> {
        let current = self
            .ledger
            .get_job(job.id)
            .await?
            .ok_or(SettlementError::JobNotFound(job.id))?;
        if current.status != JobStatus::Processing {
            tracing::debug!(status = %current.status, "job not processing, skipping");
            return Ok(JobOutcome::Skipped);
        }

        let order = self
            .ledger
            .get_order(current.order_id)
            .await?
            .ok_or(SettlementError::OrderNotFound(current.order_id))?;
        if order.status.is_closed() {
            if current.job_type == JobType::Stock {
                // a cancel that stopped before releasing leaves units behind
                self.allocator.release(order.id).await?;
            }
            return self
                .scheduler
                .record_failure(&current, &closed_order(&order))
                .await;
        }

        let item = self
            .ledger
            .get_order_item(current.order_item_id)
            .await?
            .ok_or(SettlementError::OrderItemNotFound(current.order_item_id))?;

        if let Some(existing) = &item.delivery_data {
            // delivered by an earlier run that stopped before completing the job
            return self.complete(&current, existing).await;
        }

        match self.deliver(&current, &item).await {
            Ok(data) => {
                let written = self
                    .ledger
                    .record_item_delivery(item.id, &data, Utc::now())
                    .await?;
                let data = if written {
                    data
                } else {
                    self.ledger
                        .get_order_item(item.id)
                        .await?
                        .and_then(|i| i.delivery_data)
                        .unwrap_or(data)
                };
                self.complete(&current, &data).await
            }
            Err(e) => self.scheduler.record_failure(&current, &e).await,
        }
    }

    async fn deliver(&self, job: &FulfillmentJob, item: &OrderItem) -> Result<serde_json::Value> {
        match job.job_type {
            JobType::Stock => self.deliver_stock(item).await,
            JobType::Invite => {
                let target = INVITE_TARGET_KEYS
                    .iter()
                    .find_map(|key| item.input_str(key))
                    .filter(|t| !t.trim().is_empty())
                    .ok_or_else(|| {
                        SettlementError::Validation(format!(
                            "item {} has no invite target",
                            item.id
                        ))
                    })?;

                let request = InviteRequest {
                    order_item_id: item.id,
                    product_id: item.product_id.clone(),
                    target: target.trim().to_string(),
                    quantity: item.quantity,
                };
                self.provider.grant_access(&request).await
            }
        }
    }

    /// Claims and sells the item's units. Units are SOLD before their
    /// secrets are handed out, so a concurrent cancel can only return
    /// units to the pool that nobody has seen.
    async fn deliver_stock(&self, item: &OrderItem) -> Result<serde_json::Value> {
        self.allocator
            .claim(&item.product_id, item.quantity, item.order_id, item.id)
            .await?;

        let order = self
            .ledger
            .get_order(item.order_id)
            .await?
            .ok_or(SettlementError::OrderNotFound(item.order_id))?;
        if order.status.is_closed() {
            self.allocator.release(order.id).await?;
            return Err(closed_order(&order));
        }

        self.allocator.finalize_item(item.id).await?;
        let mut sold: Vec<StockItem> = self
            .ledger
            .stock_for_item(item.id)
            .await?
            .into_iter()
            .filter(|u| u.status == StockStatus::Sold)
            .collect();
        if sold.len() != item.quantity as usize {
            // released by a cancel that landed between the claim and the sale
            let order = self.ledger.get_order(item.order_id).await?;
            if let Some(order) = order.filter(|o| o.status.is_closed()) {
                return Err(closed_order(&order));
            }
            return Err(SettlementError::InvariantViolation(format!(
                "item {} holds {} sold units, expected {}",
                item.id,
                sold.len(),
                item.quantity
            )));
        }
        sold.sort_by_key(|u| (u.created_at, u.id));

        let secrets: Vec<&str> = sold.iter().map(|u| u.secret.as_str()).collect();
        Ok(json!({ "type": "stock", "items": secrets }))
    }

    async fn complete(&self, job: &FulfillmentJob, data: &serde_json::Value) -> Result<JobOutcome> {
        if self.ledger.complete_job(job.id, data, Utc::now()).await? {
            tracing::info!(order_id = %job.order_id, "fulfillment job completed");
            Ok(JobOutcome::Completed)
        } else {
            Ok(JobOutcome::Skipped)
        }
    }
}

fn closed_order(order: &Order) -> SettlementError {
    SettlementError::Validation(format!("order {} is {}", order.id, order.status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{InMemoryInviteProvider, ScriptedFailure};
    use chrono::Duration;
    use common::ProductId;
    use domain::{
        Customer, DeliveryType, Money, OrderOwner, OrderStatus, OrderTotals, RetryPolicy,
        Settings,
    };
    use ledger::InMemoryLedger;

    struct Fixture {
        ledger: InMemoryLedger,
        provider: InMemoryInviteProvider,
        worker: FulfillmentWorker<InMemoryLedger, InMemoryInviteProvider>,
        scheduler: FulfillmentScheduler<InMemoryLedger>,
    }

    fn fixture() -> Fixture {
        let ledger = InMemoryLedger::new();
        let provider = InMemoryInviteProvider::new();
        let policy = RetryPolicy::new(Duration::seconds(1), Duration::seconds(10));
        let worker = FulfillmentWorker::new(
            ledger.clone(),
            FulfillmentScheduler::new(ledger.clone(), policy),
            provider.clone(),
        );
        Fixture {
            scheduler: FulfillmentScheduler::new(ledger.clone(), policy),
            ledger,
            provider,
            worker,
        }
    }

    async fn paid_order(
        ledger: &InMemoryLedger,
        delivery: DeliveryType,
        quantity: u32,
        input: serde_json::Value,
    ) -> (Order, OrderItem) {
        let now = Utc::now();
        let totals =
            OrderTotals::compute(Money::from_units(1_000), Money::zero(), Money::zero()).unwrap();
        let order = Order::new(
            OrderOwner::Guest("g".to_string()),
            Customer {
                email: "b@example.com".to_string(),
                name: "B".to_string(),
            },
            totals,
            now,
        );
        let item = OrderItem::new(
            order.id,
            "SKU-1",
            "Thing",
            delivery,
            quantity,
            Money::from_units(1_000),
            input,
            now,
        );
        ledger.insert_order(&order, &[item.clone()]).await.unwrap();
        ledger
            .transition_order(order.id, OrderStatus::AwaitingPayment, OrderStatus::Paid, now)
            .await
            .unwrap();
        ledger
            .transition_order(order.id, OrderStatus::Paid, OrderStatus::Processing, now)
            .await
            .unwrap();
        (order, item)
    }

    async fn claim_one(f: &Fixture, order: &Order) -> FulfillmentJob {
        f.scheduler
            .enqueue_jobs(order.id, &Settings::default())
            .await
            .unwrap();
        f.scheduler.claim_batch(1).await.unwrap().remove(0)
    }

    #[tokio::test]
    async fn test_stock_job_delivers_and_sells_units() {
        let f = fixture();
        f.ledger
            .insert_stock(&[
                StockItem::new("SKU-1", "CODE-A"),
                StockItem::new("SKU-1", "CODE-B"),
                StockItem::new("SKU-1", "CODE-C"),
            ])
            .await
            .unwrap();
        let (order, item) = paid_order(&f.ledger, DeliveryType::Stock, 1, json!({})).await;
        let job = claim_one(&f, &order).await;

        assert_eq!(f.worker.run(&job).await.unwrap(), JobOutcome::Completed);

        let item = f.ledger.get_order_item(item.id).await.unwrap().unwrap();
        let data = item.delivery_data.unwrap();
        assert_eq!(data["type"], "stock");
        assert_eq!(data["items"].as_array().unwrap().len(), 1);

        let product = ProductId::new("SKU-1");
        assert_eq!(
            f.ledger.count_stock(&product, StockStatus::Available).await.unwrap(),
            2
        );
        assert_eq!(f.ledger.count_stock(&product, StockStatus::Sold).await.unwrap(), 1);
        let stored = f.ledger.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.result, Some(data));
    }

    #[tokio::test]
    async fn test_insufficient_stock_retries_without_reserving() {
        let f = fixture();
        f.ledger
            .insert_stock(&[StockItem::new("SKU-1", "A"), StockItem::new("SKU-1", "B")])
            .await
            .unwrap();
        let (order, item) = paid_order(&f.ledger, DeliveryType::Stock, 5, json!({})).await;
        let job = claim_one(&f, &order).await;

        assert_eq!(f.worker.run(&job).await.unwrap(), JobOutcome::Retrying);
        assert_eq!(
            f.ledger
                .count_stock(&ProductId::new("SKU-1"), StockStatus::Available)
                .await
                .unwrap(),
            2
        );
        let item = f.ledger.get_order_item(item.id).await.unwrap().unwrap();
        assert!(item.delivery_data.is_none());
    }

    #[tokio::test]
    async fn test_invite_job_stores_provider_response() {
        let f = fixture();
        let (order, item) = paid_order(
            &f.ledger,
            DeliveryType::Invite,
            1,
            json!({ "email": "friend@example.com" }),
        )
        .await;
        let job = claim_one(&f, &order).await;

        assert_eq!(f.worker.run(&job).await.unwrap(), JobOutcome::Completed);
        let requests = f.provider.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].target, "friend@example.com");

        let item = f.ledger.get_order_item(item.id).await.unwrap().unwrap();
        assert_eq!(item.delivery_data.unwrap()["status"], "invited");
    }

    #[tokio::test]
    async fn test_rerun_of_completed_job_makes_no_provider_call() {
        let f = fixture();
        let (order, _) = paid_order(
            &f.ledger,
            DeliveryType::Invite,
            1,
            json!({ "email": "friend@example.com" }),
        )
        .await;
        let job = claim_one(&f, &order).await;

        f.worker.run(&job).await.unwrap();
        assert_eq!(f.worker.run(&job).await.unwrap(), JobOutcome::Skipped);
        assert_eq!(f.provider.call_count(), 1);
    }

    #[tokio::test]
    async fn test_provider_rejection_fails_job() {
        let f = fixture();
        f.provider.push_failure(ScriptedFailure::Reject);
        let (order, _) = paid_order(
            &f.ledger,
            DeliveryType::Invite,
            1,
            json!({ "email": "nobody@example.com" }),
        )
        .await;
        let job = claim_one(&f, &order).await;

        assert_eq!(f.worker.run(&job).await.unwrap(), JobOutcome::Failed);
        let stored = f.ledger.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.last_error.unwrap().contains("cannot be invited"));
    }

    #[tokio::test]
    async fn test_missing_invite_target_fails_without_call() {
        let f = fixture();
        let (order, _) = paid_order(&f.ledger, DeliveryType::Invite, 1, json!({})).await;
        let job = claim_one(&f, &order).await;

        assert_eq!(f.worker.run(&job).await.unwrap(), JobOutcome::Failed);
        assert_eq!(f.provider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_job_of_cancelled_order_fails() {
        let f = fixture();
        let (order, _) = paid_order(&f.ledger, DeliveryType::Stock, 1, json!({})).await;
        let job = claim_one(&f, &order).await;
        f.ledger
            .transition_order(order.id, OrderStatus::Processing, OrderStatus::Cancelled, Utc::now())
            .await
            .unwrap();

        assert_eq!(f.worker.run(&job).await.unwrap(), JobOutcome::Failed);
    }

    #[tokio::test]
    async fn test_cancelled_order_gets_reserved_units_back() {
        let f = fixture();
        f.ledger
            .insert_stock(&[StockItem::new("SKU-1", "A"), StockItem::new("SKU-1", "B")])
            .await
            .unwrap();
        let (order, item) = paid_order(&f.ledger, DeliveryType::Stock, 1, json!({})).await;
        let job = claim_one(&f, &order).await;
        let product = ProductId::new("SKU-1");

        // an earlier run reserved units, then a cancel stopped before releasing them
        f.ledger
            .claim_stock(&product, 1, order.id, item.id, Utc::now())
            .await
            .unwrap()
            .unwrap();
        f.ledger
            .transition_order(order.id, OrderStatus::Processing, OrderStatus::Cancelled, Utc::now())
            .await
            .unwrap();

        assert_eq!(f.worker.run(&job).await.unwrap(), JobOutcome::Failed);
        assert_eq!(
            f.ledger.count_stock(&product, StockStatus::Available).await.unwrap(),
            2
        );
        assert_eq!(f.ledger.count_stock(&product, StockStatus::Sold).await.unwrap(), 0);
        let item = f.ledger.get_order_item(item.id).await.unwrap().unwrap();
        assert!(item.delivery_data.is_none());
    }

    #[tokio::test]
    async fn test_rerun_after_sale_hands_out_the_same_units() {
        let f = fixture();
        f.ledger
            .insert_stock(&[StockItem::new("SKU-1", "A"), StockItem::new("SKU-1", "B")])
            .await
            .unwrap();
        let (order, item) = paid_order(&f.ledger, DeliveryType::Stock, 1, json!({})).await;
        let job = claim_one(&f, &order).await;
        let product = ProductId::new("SKU-1");

        // an earlier run sold the unit and stopped before storing delivery data
        let held = f
            .ledger
            .claim_stock(&product, 1, order.id, item.id, Utc::now())
            .await
            .unwrap()
            .unwrap();
        f.ledger.finalize_item_stock(item.id, Utc::now()).await.unwrap();

        assert_eq!(f.worker.run(&job).await.unwrap(), JobOutcome::Completed);
        let item = f.ledger.get_order_item(item.id).await.unwrap().unwrap();
        assert_eq!(item.delivery_data.unwrap()["items"], json!([held[0].secret]));
        assert_eq!(f.ledger.count_stock(&product, StockStatus::Sold).await.unwrap(), 1);
        assert_eq!(
            f.ledger.count_stock(&product, StockStatus::Available).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_already_delivered_item_completes_without_work() {
        let f = fixture();
        let (order, item) = paid_order(
            &f.ledger,
            DeliveryType::Invite,
            1,
            json!({ "email": "friend@example.com" }),
        )
        .await;
        f.ledger
            .record_item_delivery(item.id, &json!({ "status": "invited" }), Utc::now())
            .await
            .unwrap();
        let job = claim_one(&f, &order).await;

        assert_eq!(f.worker.run(&job).await.unwrap(), JobOutcome::Completed);
        assert_eq!(f.provider.call_count(), 0);
    }
}

//! Fulfillment scheduler: job creation, batch selection, failure handling
//! and order aggregation.

use chrono::{Duration, Utc};
use common::OrderId;
use domain::{
    FailureDisposition, FulfillmentJob, JobStatus, OrderStatus, RetryPolicy, Settings,
};
use ledger::{JobStore, OrderStore};

use crate::error::{Result, SettlementError};
use crate::machine::OrderStateMachine;

/// What a single job run ended in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// Failed transiently; back to PENDING with a backoff.
    Retrying,
    /// Failed for good.
    Failed,
    /// Nothing to do: the job was not PROCESSING, or another run moved it first.
    Skipped,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Completed => "completed",
            JobOutcome::Retrying => "retrying",
            JobOutcome::Failed => "failed",
            JobOutcome::Skipped => "skipped",
        }
    }
}

/// Creates, claims and retires fulfillment jobs.
pub struct FulfillmentScheduler<L> {
    ledger: L,
    machine: OrderStateMachine<L>,
    policy: RetryPolicy,
}

impl<L> FulfillmentScheduler<L>
where
    L: OrderStore + JobStore + Clone,
{
    pub fn new(ledger: L, policy: RetryPolicy) -> Self {
        Self {
            machine: OrderStateMachine::new(ledger.clone()),
            ledger,
            policy,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Creates one job per item of a paid order. Items that already have a
    /// job are skipped, so calling this twice creates nothing new.
    #[tracing::instrument(skip(self, settings))]
    pub async fn enqueue_jobs(&self, order_id: OrderId, settings: &Settings) -> Result<usize> {
        let items = self.ledger.get_order_items(order_id).await?;
        let now = Utc::now();

        let mut created = 0;
        for item in &items {
            let job = FulfillmentJob::new(
                order_id,
                item.id,
                item.delivery_type.into(),
                settings.job_max_attempts,
                now,
            );
            if self.ledger.insert_job(&job).await? {
                created += 1;
            }
        }

        tracing::info!(%order_id, created, items = items.len(), "fulfillment jobs enqueued");
        Ok(created)
    }

    /// Claims up to `limit` due jobs, oldest first, moving them to PROCESSING.
    pub async fn claim_batch(&self, limit: usize) -> Result<Vec<FulfillmentJob>> {
        Ok(self.ledger.claim_due_jobs(Utc::now(), limit).await?)
    }

    /// Applies the retry policy to a failed run of `job`.
    ///
    /// Transient errors go back to PENDING with backoff until the attempt
    /// budget is spent; everything else fails the job at once. The write
    /// is conditional on the attempt count the run started with, so a
    /// job retired by another actor in the meantime is left alone.
    pub async fn record_failure(
        &self,
        job: &FulfillmentJob,
        error: &SettlementError,
    ) -> Result<JobOutcome> {
        let now = Utc::now();
        let message = error.to_string();

        match self.policy.on_failure(job, !error.is_transient(), now) {
            FailureDisposition::Retry {
                attempts,
                next_retry_at,
            } => {
                let applied = self
                    .ledger
                    .requeue_job(job.id, job.attempts, attempts, &message, next_retry_at, now)
                    .await?;
                if !applied {
                    return Ok(JobOutcome::Skipped);
                }
                tracing::warn!(
                    job_id = %job.id,
                    attempts,
                    max_attempts = job.max_attempts,
                    %next_retry_at,
                    error = %message,
                    "fulfillment job will retry"
                );
                Ok(JobOutcome::Retrying)
            }
            FailureDisposition::Fail { attempts } => {
                let applied = self
                    .ledger
                    .fail_job(job.id, job.attempts, attempts, &message, now)
                    .await?;
                if !applied {
                    return Ok(JobOutcome::Skipped);
                }
                tracing::error!(
                    job_id = %job.id,
                    order_id = %job.order_id,
                    attempts,
                    error = %message,
                    "fulfillment job failed permanently"
                );
                Ok(JobOutcome::Failed)
            }
        }
    }

    /// Recomputes a PROCESSING order's status from its items and jobs.
    ///
    /// Returns the status this call moved the order to, if any.
    #[tracing::instrument(skip(self))]
    pub async fn aggregate(&self, order_id: OrderId) -> Result<Option<OrderStatus>> {
        let (order, items) = self.machine.load_with_items(order_id).await?;
        if order.status != OrderStatus::Processing {
            return Ok(None);
        }

        if !items.is_empty() && items.iter().all(|item| item.is_delivered()) {
            let moved = self
                .machine
                .transition(order_id, OrderStatus::Processing, OrderStatus::Delivered)
                .await?;
            return Ok(moved.then_some(OrderStatus::Delivered));
        }

        let jobs = self.ledger.jobs_for_order(order_id).await?;
        let any_failed = jobs.iter().any(|j| j.status == JobStatus::Failed);
        let any_open = jobs
            .iter()
            .any(|j| matches!(j.status, JobStatus::Pending | JobStatus::Processing));

        if any_failed && !any_open {
            let moved = self
                .machine
                .transition(order_id, OrderStatus::Processing, OrderStatus::Failed)
                .await?;
            return Ok(moved.then_some(OrderStatus::Failed));
        }

        Ok(None)
    }

    /// Jobs that have been PROCESSING longer than `older_than`, as left
    /// behind by a worker that died mid-run.
    pub async fn stale_jobs(&self, older_than: Duration, limit: usize) -> Result<Vec<FulfillmentJob>> {
        Ok(self
            .ledger
            .stale_jobs(Utc::now() - older_than, limit)
            .await?)
    }

    /// Permanently failed jobs for operator review.
    pub async fn failed_jobs(&self, limit: usize) -> Result<Vec<FulfillmentJob>> {
        Ok(self.ledger.failed_jobs(limit).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{Customer, DeliveryType, Money, Order, OrderItem, OrderOwner, OrderTotals};
    use ledger::InMemoryLedger;
    use serde_json::json;

    async fn processing_order(ledger: &InMemoryLedger, items: usize) -> (Order, Vec<OrderItem>) {
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
        let items: Vec<_> = (0..items)
            .map(|i| {
                OrderItem::new(
                    order.id,
                    format!("SKU-{i}"),
                    "Thing",
                    DeliveryType::Stock,
                    1,
                    Money::from_units(1_000),
                    json!({}),
                    now,
                )
            })
            .collect();
        ledger.insert_order(&order, &items).await.unwrap();
        ledger
            .transition_order(order.id, OrderStatus::AwaitingPayment, OrderStatus::Paid, now)
            .await
            .unwrap();
        ledger
            .transition_order(order.id, OrderStatus::Paid, OrderStatus::Processing, now)
            .await
            .unwrap();
        (order, items)
    }

    fn scheduler(ledger: &InMemoryLedger) -> FulfillmentScheduler<InMemoryLedger> {
        FulfillmentScheduler::new(
            ledger.clone(),
            RetryPolicy::new(Duration::seconds(10), Duration::minutes(5)),
        )
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent() {
        let ledger = InMemoryLedger::new();
        let (order, _) = processing_order(&ledger, 2).await;
        let scheduler = scheduler(&ledger);

        assert_eq!(scheduler.enqueue_jobs(order.id, &Settings::default()).await.unwrap(), 2);
        assert_eq!(scheduler.enqueue_jobs(order.id, &Settings::default()).await.unwrap(), 0);

        let jobs = ledger.jobs_for_order(order.id).await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|j| j.max_attempts == Settings::default().job_max_attempts));
    }

    #[tokio::test]
    async fn test_transient_failure_retries_until_budget_spent() {
        let ledger = InMemoryLedger::new();
        let (order, _) = processing_order(&ledger, 1).await;
        let scheduler = scheduler(&ledger);
        let settings = Settings {
            job_max_attempts: 3,
            ..Settings::default()
        };
        scheduler.enqueue_jobs(order.id, &settings).await.unwrap();
        let error = SettlementError::transient("invite provider", "HTTP 503");

        let mut outcomes = Vec::new();
        for _ in 0..3 {
            let job = ledger.jobs_for_order(order.id).await.unwrap().remove(0);
            // force the job due and claim it
            let claimed = ledger
                .start_job(job.id, job.next_retry_at.unwrap_or_else(Utc::now))
                .await
                .unwrap()
                .unwrap();
            outcomes.push(scheduler.record_failure(&claimed, &error).await.unwrap());
        }

        assert_eq!(
            outcomes,
            vec![JobOutcome::Retrying, JobOutcome::Retrying, JobOutcome::Failed]
        );
        let job = ledger.jobs_for_order(order.id).await.unwrap().remove(0);
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 3);
        assert!(job.attempts <= job.max_attempts);
        assert_eq!(scheduler.failed_jobs(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_skips_retries() {
        let ledger = InMemoryLedger::new();
        let (order, _) = processing_order(&ledger, 1).await;
        let scheduler = scheduler(&ledger);
        scheduler.enqueue_jobs(order.id, &Settings::default()).await.unwrap();
        let job = scheduler.claim_batch(10).await.unwrap().remove(0);

        let error = SettlementError::permanent("invite provider", "unknown user");
        assert_eq!(
            scheduler.record_failure(&job, &error).await.unwrap(),
            JobOutcome::Failed
        );
        // a second report for the same run is a no-op
        assert_eq!(
            scheduler.record_failure(&job, &error).await.unwrap(),
            JobOutcome::Skipped
        );
        let stored = ledger.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.attempts, 1);
    }

    #[tokio::test]
    async fn test_aggregate_delivered_and_failed() {
        let ledger = InMemoryLedger::new();
        let scheduler = scheduler(&ledger);

        let (delivered, items) = processing_order(&ledger, 2).await;
        scheduler.enqueue_jobs(delivered.id, &Settings::default()).await.unwrap();
        ledger
            .record_item_delivery(items[0].id, &json!({ "ok": 1 }), Utc::now())
            .await
            .unwrap();
        assert_eq!(scheduler.aggregate(delivered.id).await.unwrap(), None);
        ledger
            .record_item_delivery(items[1].id, &json!({ "ok": 2 }), Utc::now())
            .await
            .unwrap();
        assert_eq!(
            scheduler.aggregate(delivered.id).await.unwrap(),
            Some(OrderStatus::Delivered)
        );
        // already aggregated
        assert_eq!(scheduler.aggregate(delivered.id).await.unwrap(), None);

        let (failed, _) = processing_order(&ledger, 2).await;
        scheduler.enqueue_jobs(failed.id, &Settings::default()).await.unwrap();
        let jobs: Vec<_> = scheduler
            .claim_batch(10)
            .await
            .unwrap()
            .into_iter()
            .filter(|j| j.order_id == failed.id)
            .collect();
        assert_eq!(jobs.len(), 2);
        let error = SettlementError::permanent("invite provider", "rejected");
        scheduler.record_failure(&jobs[0], &error).await.unwrap();
        // the sibling is still PROCESSING
        assert_eq!(scheduler.aggregate(failed.id).await.unwrap(), None);
        scheduler.record_failure(&jobs[1], &error).await.unwrap();
        assert_eq!(
            scheduler.aggregate(failed.id).await.unwrap(),
            Some(OrderStatus::Failed)
        );
    }

    #[tokio::test]
    async fn test_stale_jobs() {
        let ledger = InMemoryLedger::new();
        let (order, _) = processing_order(&ledger, 1).await;
        let scheduler = scheduler(&ledger);
        scheduler.enqueue_jobs(order.id, &Settings::default()).await.unwrap();
        scheduler.claim_batch(10).await.unwrap();

        assert!(scheduler
            .stale_jobs(Duration::minutes(10), 10)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            scheduler
                .stale_jobs(Duration::seconds(-1), 10)
                .await
                .unwrap()
                .len(),
            1
        );
    }
}

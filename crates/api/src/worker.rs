//! Background fulfillment loop.
//!
//! Each tick first recovers work a previous run left behind, then claims
//! and runs a batch of due jobs. Every step is safe to run concurrently
//! with request handlers and with other server processes.

use std::sync::Arc;
use std::time::Duration;

use ledger::LedgerStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::Coordinator;
use crate::config::Config;

/// Tunables for the background loop.
#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    pub interval: Duration,
    pub batch_size: usize,
    pub concurrency: usize,
    /// A PROCESSING job older than this is presumed abandoned.
    pub stale_job_after: chrono::Duration,
    /// A PAID order untouched for this long lost its post-payment steps.
    pub stuck_paid_after: chrono::Duration,
    /// A PROCESSING order untouched for this long gets re-aggregated.
    pub resettle_after: chrono::Duration,
}

impl WorkerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            interval: config.worker_interval,
            batch_size: config.worker_batch_size,
            concurrency: config.worker_concurrency,
            ..Self::default()
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            batch_size: 20,
            concurrency: 4,
            stale_job_after: chrono::Duration::minutes(10),
            stuck_paid_after: chrono::Duration::minutes(2),
            resettle_after: chrono::Duration::minutes(5),
        }
    }
}

/// Spawns the loop. It exits after the in-flight tick once `shutdown`
/// flips to `true` or its sender is dropped.
pub fn spawn<L: LedgerStore>(
    coordinator: Arc<Coordinator<L>>,
    config: WorkerConfig,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(interval = ?config.interval, "fulfillment worker started");

        loop {
            tokio::select! {
                _ = ticker.tick() => run_tick(&coordinator, &config).await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("fulfillment worker stopped");
    })
}

/// One pass of recovery plus a fulfillment batch. Errors are logged and
/// the next tick tries again.
pub async fn run_tick<L: LedgerStore>(coordinator: &Coordinator<L>, config: &WorkerConfig) {
    let limit = config.batch_size;

    match coordinator
        .requeue_stale_jobs(config.stale_job_after, limit)
        .await
    {
        Ok(0) => {}
        Ok(n) => tracing::warn!(requeued = n, "requeued stale fulfillment jobs"),
        Err(e) => tracing::error!(error = %e, "stale job recovery failed"),
    }

    if let Err(e) = coordinator
        .recover_paid_orders(config.stuck_paid_after, limit)
        .await
    {
        tracing::error!(error = %e, "paid order recovery failed");
    }

    match coordinator
        .resettle_processing_orders(config.resettle_after, limit)
        .await
    {
        Ok(0) => {}
        Ok(n) => tracing::info!(settled = n, "settled processing orders"),
        Err(e) => tracing::error!(error = %e, "processing order resettlement failed"),
    }

    match coordinator
        .run_fulfillment_batch(limit, config.concurrency)
        .await
    {
        Ok(report) if report.claimed > 0 => tracing::info!(
            claimed = report.claimed,
            completed = report.completed,
            retrying = report.retrying,
            failed = report.failed,
            errors = report.errors,
            "fulfillment batch finished"
        ),
        Ok(_) => {}
        Err(e) => tracing::error!(error = %e, "fulfillment batch failed"),
    }
}

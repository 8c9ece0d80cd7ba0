//! Operator endpoints: cancellation, failed-job inspection, webhook replay
//! and wallet top-ups.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use common::{AccountId, OrderId, WebhookDeliveryId};
use domain::{FulfillmentJob, Money, OrderStatus, WalletTransaction, WebhookDelivery};
use ledger::LedgerStore;
use serde::{Deserialize, Serialize};

use super::parse_id;
use crate::AppState;
use crate::error::ApiError;

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

#[derive(Debug, Deserialize)]
pub struct LimitParams {
    pub limit: Option<usize>,
}

impl LimitParams {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

/// The status the operator saw; the cancel only applies if the order is
/// still there.
#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub observed_status: OrderStatus,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub order_id: OrderId,
    pub status: OrderStatus,
}

#[derive(Debug, Deserialize)]
pub struct TopUpRequest {
    pub amount: Money,
    /// Caller's idempotency key, e.g. the bank transfer reference.
    pub reference: String,
}

/// POST /operator/orders/:id/cancel
#[tracing::instrument(skip(state, req), fields(observed = %req.observed_status))]
pub async fn cancel<L: LedgerStore>(
    State(state): State<Arc<AppState<L>>>,
    Path(id): Path<String>,
    Json(req): Json<CancelRequest>,
) -> Result<Json<CancelResponse>, ApiError> {
    let order_id: OrderId = parse_id("order", &id)?;
    let cancelled = state
        .coordinator
        .cancel_order(order_id, req.observed_status)
        .await?;

    if !cancelled {
        return Err(ApiError::Conflict(format!(
            "Order {order_id} is no longer {}",
            req.observed_status
        )));
    }
    Ok(Json(CancelResponse {
        order_id,
        status: OrderStatus::Cancelled,
    }))
}

/// GET /operator/jobs/failed?limit=N
#[tracing::instrument(skip(state))]
pub async fn failed_jobs<L: LedgerStore>(
    State(state): State<Arc<AppState<L>>>,
    Query(params): Query<LimitParams>,
) -> Result<Json<Vec<FulfillmentJob>>, ApiError> {
    Ok(Json(state.coordinator.failed_jobs(params.limit()).await?))
}

/// GET /operator/orders/:id/webhook-deliveries
#[tracing::instrument(skip(state))]
pub async fn webhook_deliveries<L: LedgerStore>(
    State(state): State<Arc<AppState<L>>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<WebhookDelivery>>, ApiError> {
    let order_id: OrderId = parse_id("order", &id)?;
    Ok(Json(state.coordinator.webhook_deliveries(order_id).await?))
}

/// POST /operator/webhook-deliveries/:id/retry — replay a delivery as a
/// new logged attempt.
#[tracing::instrument(skip(state))]
pub async fn retry_webhook<L: LedgerStore>(
    State(state): State<Arc<AppState<L>>>,
    Path(id): Path<String>,
) -> Result<Json<WebhookDelivery>, ApiError> {
    let delivery_id: WebhookDeliveryId = parse_id("webhook delivery", &id)?;
    Ok(Json(state.coordinator.retry_webhook(delivery_id).await?))
}

/// POST /operator/wallets/:account_id/top-up
#[tracing::instrument(skip(state, req), fields(amount = %req.amount))]
pub async fn top_up<L: LedgerStore>(
    State(state): State<Arc<AppState<L>>>,
    Path(account_id): Path<String>,
    Json(req): Json<TopUpRequest>,
) -> Result<Json<WalletTransaction>, ApiError> {
    let account_id: AccountId = parse_id("account", &account_id)?;
    if req.reference.trim().is_empty() {
        return Err(ApiError::BadRequest("reference must not be empty".to_string()));
    }
    let transaction = state
        .coordinator
        .top_up(account_id, req.amount, &req.reference)
        .await?;
    Ok(Json(transaction))
}

//! Payment endpoints: gateway checkout, reconciliation, wallet payment and
//! the gateway push callback.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use common::{AccountId, OrderId};
use domain::{OrderStatus, WalletTransaction};
use ledger::LedgerStore;
use serde::{Deserialize, Serialize};
use settlement::{OrderView, PaymentView};

use super::parse_id;
use crate::AppState;
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct WalletPaymentRequest {
    pub account_id: AccountId,
}

#[derive(Debug, Serialize)]
pub struct WalletPaymentResponse {
    pub order_id: OrderId,
    /// False when the order had already been paid by an earlier call.
    pub became_paid: bool,
    pub transaction: WalletTransaction,
}

/// Gateway push body. Only the reference is read; the status is always
/// fetched from the gateway.
#[derive(Debug, Deserialize)]
pub struct CallbackRequest {
    pub ref_id: String,
}

#[derive(Debug, Serialize)]
pub struct CallbackResponse {
    pub order_id: OrderId,
    pub status: OrderStatus,
}

/// POST /orders/:id/payment — open (or return the open) gateway payment.
#[tracing::instrument(skip(state))]
pub async fn open<L: LedgerStore>(
    State(state): State<Arc<AppState<L>>>,
    Path(id): Path<String>,
) -> Result<Json<PaymentView>, ApiError> {
    let order_id: OrderId = parse_id("order", &id)?;
    let payment = state.coordinator.open_payment(order_id).await?;
    Ok(Json(payment.into()))
}

/// POST /orders/:id/payment/reconcile — ask the gateway where the payment is.
///
/// Safe to poll: once the order has left AWAITING_PAYMENT this only reads.
#[tracing::instrument(skip(state))]
pub async fn reconcile<L: LedgerStore>(
    State(state): State<Arc<AppState<L>>>,
    Path(id): Path<String>,
) -> Result<Json<OrderView>, ApiError> {
    let order_id: OrderId = parse_id("order", &id)?;
    state.coordinator.reconcile(order_id).await?;
    Ok(Json(state.coordinator.order_view(order_id).await?))
}

/// POST /orders/:id/wallet-payment — pay from the reseller's wallet.
#[tracing::instrument(skip(state, req), fields(account_id = %req.account_id))]
pub async fn pay_with_wallet<L: LedgerStore>(
    State(state): State<Arc<AppState<L>>>,
    Path(id): Path<String>,
    Json(req): Json<WalletPaymentRequest>,
) -> Result<Json<WalletPaymentResponse>, ApiError> {
    let order_id: OrderId = parse_id("order", &id)?;
    let payment = state
        .coordinator
        .pay_with_wallet(order_id, req.account_id)
        .await?;

    Ok(Json(WalletPaymentResponse {
        order_id,
        became_paid: payment.became_paid,
        transaction: payment.transaction,
    }))
}

/// POST /gateway/callback — the gateway says something changed.
#[tracing::instrument(skip(state, req), fields(ref_id = %req.ref_id))]
pub async fn callback<L: LedgerStore>(
    State(state): State<Arc<AppState<L>>>,
    Json(req): Json<CallbackRequest>,
) -> Result<Json<CallbackResponse>, ApiError> {
    let outcome = state
        .coordinator
        .handle_gateway_callback(&req.ref_id)
        .await?;

    Ok(Json(CallbackResponse {
        order_id: outcome.order.id,
        status: outcome.order.status,
    }))
}

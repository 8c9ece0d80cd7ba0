//! Checkout and buyer order view endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use common::OrderId;
use domain::{Money, OrderStatus};
use ledger::LedgerStore;
use serde::Serialize;
use settlement::{OrderView, PlaceOrder};

use super::parse_id;
use crate::AppState;
use crate::error::ApiError;

#[derive(Debug, Serialize)]
pub struct OrderCreatedResponse {
    pub order_id: OrderId,
    pub status: OrderStatus,
    pub total_amount: Money,
    /// Present for guest checkouts; the buyer needs it to find the order again.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guest_token: Option<String>,
    pub items: usize,
}

/// POST /orders — place an order awaiting payment.
#[tracing::instrument(skip(state, req), fields(items = req.items.len()))]
pub async fn create<L: LedgerStore>(
    State(state): State<Arc<AppState<L>>>,
    Json(req): Json<PlaceOrder>,
) -> Result<(StatusCode, Json<OrderCreatedResponse>), ApiError> {
    let (order, items) = state.coordinator.place_order(req).await?;

    let response = OrderCreatedResponse {
        order_id: order.id,
        status: order.status,
        total_amount: order.total_amount,
        guest_token: order.guest_token,
        items: items.len(),
    };
    Ok((StatusCode::CREATED, Json(response)))
}

/// GET /orders/:id — the buyer's view of an order.
#[tracing::instrument(skip(state))]
pub async fn get<L: LedgerStore>(
    State(state): State<Arc<AppState<L>>>,
    Path(id): Path<String>,
) -> Result<Json<OrderView>, ApiError> {
    let order_id: OrderId = parse_id("order", &id)?;
    Ok(Json(state.coordinator.order_view(order_id).await?))
}

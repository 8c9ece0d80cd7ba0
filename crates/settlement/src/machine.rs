//! Order state machine.
//!
//! Every order status change in the pipeline goes through
//! [`OrderStateMachine::transition`], which validates the edge against
//! [`OrderStatus::can_transition_to`] and then applies it as one conditional
//! write keyed on the status the caller observed.

use chrono::Utc;
use common::OrderId;
use domain::{Order, OrderItem, OrderStatus};
use ledger::OrderStore;

use crate::error::{Result, SettlementError};

/// Applies order status transitions through the ledger.
#[derive(Debug, Clone)]
pub struct OrderStateMachine<L> {
    ledger: L,
}

impl<L: OrderStore> OrderStateMachine<L> {
    pub fn new(ledger: L) -> Self {
        Self { ledger }
    }

    /// Loads an order or fails with `OrderNotFound`.
    pub async fn load(&self, order_id: OrderId) -> Result<Order> {
        self.ledger
            .get_order(order_id)
            .await?
            .ok_or(SettlementError::OrderNotFound(order_id))
    }

    /// Loads an order together with its items.
    pub async fn load_with_items(&self, order_id: OrderId) -> Result<(Order, Vec<OrderItem>)> {
        let order = self.load(order_id).await?;
        let items = self.ledger.get_order_items(order_id).await?;
        Ok((order, items))
    }

    /// Moves `order_id` from `from` to `to`.
    ///
    /// Returns `Ok(true)` if this call applied the transition and `Ok(false)`
    /// if the order had already left `from`. An edge the state machine does
    /// not allow is an error and nothing is written.
    #[tracing::instrument(skip(self))]
    pub async fn transition(
        &self,
        order_id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
    ) -> Result<bool> {
        from.ensure_transition(to)?;

        let applied = self
            .ledger
            .transition_order(order_id, from, to, Utc::now())
            .await?;

        if applied {
            metrics::counter!("order_transitions_total", "to" => to.as_str()).increment(1);
            tracing::info!(%order_id, from = %from, to = %to, "order transitioned");
        } else {
            tracing::debug!(%order_id, from = %from, to = %to, "transition lost, order already moved");
        }
        Ok(applied)
    }
}

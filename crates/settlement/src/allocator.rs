//! Stock allocator: the only contended resource in the pipeline.

use chrono::Utc;
use common::{OrderId, OrderItemId, ProductId};
use domain::StockItem;
use ledger::StockStore;

use crate::error::{Result, SettlementError};

/// Claims, releases and finalizes single-use stock units.
#[derive(Debug, Clone)]
pub struct StockAllocator<L> {
    ledger: L,
}

impl<L: StockStore> StockAllocator<L> {
    pub fn new(ledger: L) -> Self {
        Self { ledger }
    }

    /// Reserves `quantity` AVAILABLE units for an order item, all or nothing.
    ///
    /// Claiming again for an item that already holds its units returns
    /// those units. Fewer available units than requested is
    /// `InsufficientStock` and nothing changes. A cancelled or failed order
    /// gets nothing either; the worker fails its job on the next run.
    #[tracing::instrument(skip(self))]
    pub async fn claim(
        &self,
        product_id: &ProductId,
        quantity: u32,
        order_id: OrderId,
        order_item_id: OrderItemId,
    ) -> Result<Vec<StockItem>> {
        if quantity == 0 {
            return Err(SettlementError::Validation(
                "claim quantity must be at least 1".to_string(),
            ));
        }

        match self
            .ledger
            .claim_stock(product_id, quantity, order_id, order_item_id, Utc::now())
            .await?
        {
            Some(units) => {
                metrics::counter!("stock_units_claimed_total").increment(units.len() as u64);
                tracing::info!(%order_item_id, units = units.len(), "stock claimed");
                Ok(units)
            }
            None => {
                tracing::warn!(%order_item_id, %product_id, quantity, "insufficient stock");
                Err(SettlementError::InsufficientStock {
                    product_id: product_id.clone(),
                    requested: quantity,
                })
            }
        }
    }

    /// Returns a cancelled or failed order's RESERVED units to the pool.
    #[tracing::instrument(skip(self))]
    pub async fn release(&self, order_id: OrderId) -> Result<u64> {
        let released = self.ledger.release_stock(order_id).await?;
        if released > 0 {
            tracing::info!(%order_id, released, "stock released");
        }
        Ok(released)
    }

    /// Marks every RESERVED unit of a delivered order SOLD.
    #[tracing::instrument(skip(self))]
    pub async fn finalize(&self, order_id: OrderId) -> Result<u64> {
        Ok(self.ledger.finalize_stock(order_id, Utc::now()).await?)
    }

    /// Marks one item's RESERVED units SOLD once its delivery data is written.
    pub async fn finalize_item(&self, order_item_id: OrderItemId) -> Result<u64> {
        Ok(self
            .ledger
            .finalize_item_stock(order_item_id, Utc::now())
            .await?)
    }
}

use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{
    AccountId, JobId, OrderId, OrderItemId, PaymentId, ProductId, StockItemId, WalletTransactionId,
    WebhookDeliveryId, WebhookEndpointId,
};
use domain::{
    ChargeDetails, FulfillmentJob, Money, Order, OrderItem, OrderStatus, Payment,
    PaymentSettlement, PointAward, StockItem, StockStatus, Wallet, WalletEntry, WalletEntryKind,
    WalletPosting, WalletTransaction, WebhookDelivery, WebhookEndpoint,
};
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    LedgerError, Result,
    store::{
        JobStore, OrderStore, PaymentStore, SettingsStore, StockStore, WalletStore, WebhookStore,
    },
};

const ORDER_COLUMNS: &str = "id, account_id, guest_token, customer_email, customer_name, \
    subtotal, discount_amount, points_discount, total_amount, status, rewards_granted, \
    created_at, updated_at, paid_at, delivered_at";

const ITEM_COLUMNS: &str = "id, order_id, product_id, product_name, delivery_type, quantity, \
    unit_price, total_price, input_data, delivery_data, delivered_at, created_at";

const STOCK_COLUMNS: &str = "id, product_id, secret, status, order_id, order_item_id, \
    created_at, reserved_at, sold_at";

const PAYMENT_COLUMNS: &str = "id, order_id, ref_id, external_trx_id, amount, fee, net_amount, \
    status, qr_link, pay_url, expires_at, paid_at, created_at, updated_at";

const JOB_COLUMNS: &str = "id, order_id, order_item_id, job_type, status, attempts, \
    max_attempts, last_error, next_retry_at, result, created_at, updated_at, started_at, \
    completed_at";

const WALLET_TXN_COLUMNS: &str =
    "id, account_id, kind, amount, balance_after, reference, description, created_at";

const DELIVERY_COLUMNS: &str = "id, endpoint_id, order_id, event, payload, timestamp, signature, \
    response_status, response_body, delivered_at, failed_at, error, retry_of, created_at";

/// PostgreSQL-backed ledger.
///
/// Every conditional write is a single `UPDATE ... WHERE status = <observed>`
/// (or an `INSERT ... ON CONFLICT DO NOTHING`) so that concurrent callers
/// serialize on the row and exactly one of them sees an affected row.
#[derive(Clone)]
pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    /// Creates a new PostgreSQL ledger.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_order(row: PgRow) -> Result<Order> {
        Ok(Order {
            id: OrderId::from_uuid(row.try_get::<Uuid, _>("id")?),
            account_id: row
                .try_get::<Option<Uuid>, _>("account_id")?
                .map(AccountId::from_uuid),
            guest_token: row.try_get("guest_token")?,
            customer_email: row.try_get("customer_email")?,
            customer_name: row.try_get("customer_name")?,
            subtotal: money(&row, "subtotal")?,
            discount_amount: money(&row, "discount_amount")?,
            points_discount: money(&row, "points_discount")?,
            total_amount: money(&row, "total_amount")?,
            status: parse_column(&row, "orders", "status")?,
            rewards_granted: row.try_get("rewards_granted")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            paid_at: row.try_get("paid_at")?,
            delivered_at: row.try_get("delivered_at")?,
        })
    }

    fn row_to_item(row: PgRow) -> Result<OrderItem> {
        Ok(OrderItem {
            id: OrderItemId::from_uuid(row.try_get::<Uuid, _>("id")?),
            order_id: OrderId::from_uuid(row.try_get::<Uuid, _>("order_id")?),
            product_id: ProductId::new(row.try_get::<String, _>("product_id")?),
            product_name: row.try_get("product_name")?,
            delivery_type: parse_column(&row, "order_items", "delivery_type")?,
            quantity: count(&row, "order_items", "quantity")?,
            unit_price: money(&row, "unit_price")?,
            total_price: money(&row, "total_price")?,
            input_data: row.try_get("input_data")?,
            delivery_data: row.try_get("delivery_data")?,
            delivered_at: row.try_get("delivered_at")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn row_to_stock(row: PgRow) -> Result<StockItem> {
        Ok(StockItem {
            id: StockItemId::from_uuid(row.try_get::<Uuid, _>("id")?),
            product_id: ProductId::new(row.try_get::<String, _>("product_id")?),
            secret: row.try_get("secret")?,
            status: parse_column(&row, "stock_items", "status")?,
            order_id: row
                .try_get::<Option<Uuid>, _>("order_id")?
                .map(OrderId::from_uuid),
            order_item_id: row
                .try_get::<Option<Uuid>, _>("order_item_id")?
                .map(OrderItemId::from_uuid),
            created_at: row.try_get("created_at")?,
            reserved_at: row.try_get("reserved_at")?,
            sold_at: row.try_get("sold_at")?,
        })
    }

    fn row_to_payment(row: PgRow) -> Result<Payment> {
        Ok(Payment {
            id: PaymentId::from_uuid(row.try_get::<Uuid, _>("id")?),
            order_id: OrderId::from_uuid(row.try_get::<Uuid, _>("order_id")?),
            ref_id: row.try_get("ref_id")?,
            external_trx_id: row.try_get("external_trx_id")?,
            amount: money(&row, "amount")?,
            fee: money(&row, "fee")?,
            net_amount: money(&row, "net_amount")?,
            status: parse_column(&row, "payments", "status")?,
            qr_link: row.try_get("qr_link")?,
            pay_url: row.try_get("pay_url")?,
            expires_at: row.try_get("expires_at")?,
            paid_at: row.try_get("paid_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_job(row: PgRow) -> Result<FulfillmentJob> {
        Ok(FulfillmentJob {
            id: JobId::from_uuid(row.try_get::<Uuid, _>("id")?),
            order_id: OrderId::from_uuid(row.try_get::<Uuid, _>("order_id")?),
            order_item_id: OrderItemId::from_uuid(row.try_get::<Uuid, _>("order_item_id")?),
            job_type: parse_column(&row, "fulfillment_jobs", "job_type")?,
            status: parse_column(&row, "fulfillment_jobs", "status")?,
            attempts: count(&row, "fulfillment_jobs", "attempts")?,
            max_attempts: count(&row, "fulfillment_jobs", "max_attempts")?,
            last_error: row.try_get("last_error")?,
            next_retry_at: row.try_get("next_retry_at")?,
            result: row.try_get("result")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn row_to_wallet(row: PgRow) -> Result<Wallet> {
        Ok(Wallet {
            account_id: AccountId::from_uuid(row.try_get::<Uuid, _>("account_id")?),
            balance: money(&row, "balance")?,
            total_topup: money(&row, "total_topup")?,
            total_spent: money(&row, "total_spent")?,
            total_cashback: money(&row, "total_cashback")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_wallet_txn(row: PgRow) -> Result<WalletTransaction> {
        Ok(WalletTransaction {
            id: WalletTransactionId::from_uuid(row.try_get::<Uuid, _>("id")?),
            account_id: AccountId::from_uuid(row.try_get::<Uuid, _>("account_id")?),
            kind: parse_column(&row, "wallet_transactions", "kind")?,
            amount: money(&row, "amount")?,
            balance_after: money(&row, "balance_after")?,
            reference: row.try_get("reference")?,
            description: row.try_get("description")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn row_to_endpoint(row: PgRow) -> Result<WebhookEndpoint> {
        Ok(WebhookEndpoint {
            id: WebhookEndpointId::from_uuid(row.try_get::<Uuid, _>("id")?),
            account_id: AccountId::from_uuid(row.try_get::<Uuid, _>("account_id")?),
            url: row.try_get("url")?,
            secret: row.try_get("secret")?,
            active: row.try_get("active")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn row_to_delivery(row: PgRow) -> Result<WebhookDelivery> {
        let response_status = row
            .try_get::<Option<i32>, _>("response_status")?
            .map(|status| {
                u16::try_from(status).map_err(|_| LedgerError::Decode {
                    table: "webhook_deliveries",
                    reason: format!("response_status out of range: {status}"),
                })
            })
            .transpose()?;

        Ok(WebhookDelivery {
            id: WebhookDeliveryId::from_uuid(row.try_get::<Uuid, _>("id")?),
            endpoint_id: WebhookEndpointId::from_uuid(row.try_get::<Uuid, _>("endpoint_id")?),
            order_id: OrderId::from_uuid(row.try_get::<Uuid, _>("order_id")?),
            event: parse_column(&row, "webhook_deliveries", "event")?,
            payload: row.try_get("payload")?,
            timestamp: row.try_get("timestamp")?,
            signature: row.try_get("signature")?,
            response_status,
            response_body: row.try_get("response_body")?,
            delivered_at: row.try_get("delivered_at")?,
            failed_at: row.try_get("failed_at")?,
            error: row.try_get("error")?,
            retry_of: row
                .try_get::<Option<Uuid>, _>("retry_of")?
                .map(WebhookDeliveryId::from_uuid),
            created_at: row.try_get("created_at")?,
        })
    }
}

fn money(row: &PgRow, column: &str) -> Result<Money> {
    Ok(Money::from_units(row.try_get::<i64, _>(column)?))
}

fn count(row: &PgRow, table: &'static str, column: &str) -> Result<u32> {
    let value: i32 = row.try_get(column)?;
    u32::try_from(value).map_err(|_| LedgerError::Decode {
        table,
        reason: format!("{column} is negative: {value}"),
    })
}

fn parse_column<T>(row: &PgRow, table: &'static str, column: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw: String = row.try_get(column)?;
    raw.parse().map_err(|e: T::Err| LedgerError::Decode {
        table,
        reason: e.to_string(),
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

fn limit(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

#[async_trait]
impl OrderStore for PostgresLedger {
    async fn insert_order(&self, order: &Order, items: &[OrderItem]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO orders (id, account_id, guest_token, customer_email, customer_name,
                subtotal, discount_amount, points_discount, total_amount, status, rewards_granted,
                created_at, updated_at, paid_at, delivered_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(order.id.as_uuid())
        .bind(order.account_id.map(|id| id.as_uuid()))
        .bind(&order.guest_token)
        .bind(&order.customer_email)
        .bind(&order.customer_name)
        .bind(order.subtotal.units())
        .bind(order.discount_amount.units())
        .bind(order.points_discount.units())
        .bind(order.total_amount.units())
        .bind(order.status.as_str())
        .bind(order.rewards_granted)
        .bind(order.created_at)
        .bind(order.updated_at)
        .bind(order.paid_at)
        .bind(order.delivered_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                return LedgerError::Duplicate {
                    entity: "order",
                    id: order.id.to_string(),
                };
            }
            LedgerError::Database(e)
        })?;

        for item in items {
            let quantity =
                i32::try_from(item.quantity).map_err(|_| LedgerError::OutOfRange {
                    column: "order_items.quantity",
                    value: item.quantity.to_string(),
                })?;
            sqlx::query(
                r#"
                INSERT INTO order_items (id, order_id, product_id, product_name, delivery_type,
                    quantity, unit_price, total_price, input_data, delivery_data, delivered_at,
                    created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                "#,
            )
            .bind(item.id.as_uuid())
            .bind(item.order_id.as_uuid())
            .bind(item.product_id.as_str())
            .bind(&item.product_name)
            .bind(item.delivery_type.as_str())
            .bind(quantity)
            .bind(item.unit_price.units())
            .bind(item.total_price.units())
            .bind(&item.input_data)
            .bind(&item.delivery_data)
            .bind(item.delivered_at)
            .bind(item.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_order(&self, id: OrderId) -> Result<Option<Order>> {
        let row = sqlx::query(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_order).transpose()
    }

    async fn get_order_items(&self, order_id: OrderId) -> Result<Vec<OrderItem>> {
        let rows = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM order_items WHERE order_id = $1 ORDER BY created_at ASC, id ASC"
        ))
        .bind(order_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_item).collect()
    }

    async fn get_order_item(&self, id: OrderItemId) -> Result<Option<OrderItem>> {
        let row = sqlx::query(&format!("SELECT {ITEM_COLUMNS} FROM order_items WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_item).transpose()
    }

    async fn transition_order(
        &self,
        id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE orders SET
                status = $3,
                updated_at = $4,
                paid_at = CASE WHEN $3 = 'PAID' THEN $4 ELSE paid_at END,
                delivered_at = CASE WHEN $3 = 'DELIVERED' THEN $4 ELSE delivered_at END
            WHERE id = $1
              AND status = $2
              AND ($3 <> 'DELIVERED' OR NOT EXISTS (
                  SELECT 1 FROM order_items WHERE order_id = $1 AND delivery_data IS NULL
              ))
            "#,
        )
        .bind(id.as_uuid())
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(at)
        .execute(&self.pool)
        .await?;

        let won = result.rows_affected() == 1;
        if !won {
            tracing::debug!(order_id = %id, %from, %to, "order transition lost");
        }
        Ok(won)
    }

    async fn orders_with_status(
        &self,
        status: OrderStatus,
        updated_before: DateTime<Utc>,
        limit_to: usize,
    ) -> Result<Vec<Order>> {
        let rows = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE status = $1 AND updated_at < $2 \
             ORDER BY updated_at ASC LIMIT $3"
        ))
        .bind(status.as_str())
        .bind(updated_before)
        .bind(limit(limit_to))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_order).collect()
    }

    async fn mark_rewards_granted(&self, id: OrderId) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE orders SET rewards_granted = TRUE WHERE id = $1 AND rewards_granted = FALSE",
        )
        .bind(id.as_uuid())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn record_item_delivery(
        &self,
        item_id: OrderItemId,
        delivery_data: &serde_json::Value,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE order_items SET delivery_data = $2, delivered_at = $3
            WHERE id = $1 AND delivery_data IS NULL
            "#,
        )
        .bind(item_id.as_uuid())
        .bind(delivery_data)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl StockStore for PostgresLedger {
    async fn insert_stock(&self, units: &[StockItem]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for unit in units {
            sqlx::query(
                r#"
                INSERT INTO stock_items (id, product_id, secret, status, order_id, order_item_id,
                    created_at, reserved_at, sold_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(unit.id.as_uuid())
            .bind(unit.product_id.as_str())
            .bind(&unit.secret)
            .bind(unit.status.as_str())
            .bind(unit.order_id.map(|id| id.as_uuid()))
            .bind(unit.order_item_id.map(|id| id.as_uuid()))
            .bind(unit.created_at)
            .bind(unit.reserved_at)
            .bind(unit.sold_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    return LedgerError::Duplicate {
                        entity: "stock item",
                        id: unit.id.to_string(),
                    };
                }
                LedgerError::Database(e)
            })?;
        }
        tx.commit().await?;
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
        let held = self.stock_for_item(order_item_id).await?;
        if !held.is_empty() {
            return Ok(Some(held));
        }

        // Pick and flip in one statement; the count guard makes it all-or-nothing.
        //
        // SKIP LOCKED passes over units another transaction is claiming, so
        // under contention this can return `None` while enough units exist.
        // Callers treat that as insufficient stock, which is retried.
        let rows = sqlx::query(
            r#"
            WITH picked AS (
                SELECT id FROM stock_items
                WHERE product_id = $1 AND status = 'AVAILABLE'
                  AND NOT EXISTS (
                      SELECT 1 FROM orders
                      WHERE id = $3 AND status IN ('CANCELLED', 'FAILED')
                  )
                ORDER BY created_at ASC, id ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            ), picked_count AS (
                SELECT COUNT(*) AS n FROM picked
            )
            UPDATE stock_items s SET
                status = 'RESERVED',
                order_id = $3,
                order_item_id = $4,
                reserved_at = $5
            FROM picked, picked_count
            WHERE s.id = picked.id AND picked_count.n = $2
            RETURNING s.id, s.product_id, s.secret, s.status, s.order_id, s.order_item_id,
                s.created_at, s.reserved_at, s.sold_at
            "#,
        )
        .bind(product_id.as_str())
        .bind(i64::from(quantity))
        .bind(order_id.as_uuid())
        .bind(order_item_id.as_uuid())
        .bind(at)
        .fetch_all(&self.pool)
        .await?;

        if rows.len() < quantity as usize {
            return Ok(None);
        }

        let mut units = rows
            .into_iter()
            .map(Self::row_to_stock)
            .collect::<Result<Vec<_>>>()?;
        units.sort_by_key(|u| (u.created_at, u.id));
        Ok(Some(units))
    }

    async fn stock_for_item(&self, order_item_id: OrderItemId) -> Result<Vec<StockItem>> {
        let rows = sqlx::query(&format!(
            "SELECT {STOCK_COLUMNS} FROM stock_items WHERE order_item_id = $1 \
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(order_item_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_stock).collect()
    }

    async fn release_stock(&self, order_id: OrderId) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE stock_items SET
                status = 'AVAILABLE', order_id = NULL, order_item_id = NULL, reserved_at = NULL
            WHERE order_id = $1 AND status = 'RESERVED'
            "#,
        )
        .bind(order_id.as_uuid())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn finalize_stock(&self, order_id: OrderId, at: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE stock_items SET status = 'SOLD', sold_at = $2 \
             WHERE order_id = $1 AND status = 'RESERVED'",
        )
        .bind(order_id.as_uuid())
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn finalize_item_stock(
        &self,
        order_item_id: OrderItemId,
        at: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE stock_items SET status = 'SOLD', sold_at = $2 \
             WHERE order_item_id = $1 AND status = 'RESERVED'",
        )
        .bind(order_item_id.as_uuid())
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn count_stock(&self, product_id: &ProductId, status: StockStatus) -> Result<u64> {
        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM stock_items WHERE product_id = $1 AND status = $2",
        )
        .bind(product_id.as_str())
        .bind(status.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(n.max(0) as u64)
    }
}

#[async_trait]
impl PaymentStore for PostgresLedger {
    async fn insert_payment(&self, payment: &Payment) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO payments (id, order_id, ref_id, external_trx_id, amount, fee, net_amount,
                status, qr_link, pay_url, expires_at, paid_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (order_id) WHERE status = 'PENDING' DO NOTHING
            "#,
        )
        .bind(payment.id.as_uuid())
        .bind(payment.order_id.as_uuid())
        .bind(&payment.ref_id)
        .bind(&payment.external_trx_id)
        .bind(payment.amount.units())
        .bind(payment.fee.units())
        .bind(payment.net_amount.units())
        .bind(payment.status.as_str())
        .bind(&payment.qr_link)
        .bind(&payment.pay_url)
        .bind(payment.expires_at)
        .bind(payment.paid_at)
        .bind(payment.created_at)
        .bind(payment.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                return LedgerError::Duplicate {
                    entity: "payment",
                    id: payment.ref_id.clone(),
                };
            }
            LedgerError::Database(e)
        })?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_payment(&self, id: PaymentId) -> Result<Option<Payment>> {
        let row = sqlx::query(&format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_payment).transpose()
    }

    async fn payment_by_ref(&self, ref_id: &str) -> Result<Option<Payment>> {
        let row = sqlx::query(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE ref_id = $1"
        ))
        .bind(ref_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_payment).transpose()
    }

    async fn pending_payment(&self, order_id: OrderId) -> Result<Option<Payment>> {
        let row = sqlx::query(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE order_id = $1 AND status = 'PENDING'"
        ))
        .bind(order_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_payment).transpose()
    }

    async fn latest_payment(&self, order_id: OrderId) -> Result<Option<Payment>> {
        let row = sqlx::query(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE order_id = $1 \
             ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(order_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_payment).transpose()
    }

    async fn attach_charge(
        &self,
        id: PaymentId,
        charge: &ChargeDetails,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE payments SET
                external_trx_id = $2, qr_link = $3, pay_url = $4, expires_at = $5, updated_at = $6
            WHERE id = $1 AND status = 'PENDING'
            "#,
        )
        .bind(id.as_uuid())
        .bind(&charge.external_trx_id)
        .bind(&charge.qr_link)
        .bind(&charge.pay_url)
        .bind(charge.expires_at)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn settle_payment(
        &self,
        id: PaymentId,
        settlement: &PaymentSettlement,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE payments SET
                status = $2,
                external_trx_id = COALESCE($3, external_trx_id),
                fee = $4,
                net_amount = $5,
                paid_at = $6,
                updated_at = $7
            WHERE id = $1 AND status = 'PENDING'
            "#,
        )
        .bind(id.as_uuid())
        .bind(settlement.status.as_str())
        .bind(&settlement.external_trx_id)
        .bind(settlement.fee.units())
        .bind(settlement.net_amount.units())
        .bind(settlement.paid_at)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl JobStore for PostgresLedger {
    async fn insert_job(&self, job: &FulfillmentJob) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO fulfillment_jobs (id, order_id, order_item_id, job_type, status, attempts,
                max_attempts, last_error, next_retry_at, result, created_at, updated_at,
                started_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (order_item_id) DO NOTHING
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.order_id.as_uuid())
        .bind(job.order_item_id.as_uuid())
        .bind(job.job_type.as_str())
        .bind(job.status.as_str())
        .bind(job.attempts as i32)
        .bind(job.max_attempts as i32)
        .bind(&job.last_error)
        .bind(job.next_retry_at)
        .bind(&job.result)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_job(&self, id: JobId) -> Result<Option<FulfillmentJob>> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM fulfillment_jobs WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_job).transpose()
    }

    async fn jobs_for_order(&self, order_id: OrderId) -> Result<Vec<FulfillmentJob>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM fulfillment_jobs WHERE order_id = $1 ORDER BY created_at ASC"
        ))
        .bind(order_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_job).collect()
    }

    async fn claim_due_jobs(
        &self,
        now: DateTime<Utc>,
        limit_to: usize,
    ) -> Result<Vec<FulfillmentJob>> {
        let rows = sqlx::query(&format!(
            r#"
            UPDATE fulfillment_jobs SET status = 'PROCESSING', started_at = $1, updated_at = $1
            WHERE id IN (
                SELECT id FROM fulfillment_jobs
                WHERE status = 'PENDING' AND (next_retry_at IS NULL OR next_retry_at <= $1)
                ORDER BY created_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(now)
        .bind(limit(limit_to))
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = rows
            .into_iter()
            .map(Self::row_to_job)
            .collect::<Result<Vec<_>>>()?;
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    async fn start_job(&self, id: JobId, now: DateTime<Utc>) -> Result<Option<FulfillmentJob>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE fulfillment_jobs SET status = 'PROCESSING', started_at = $2, updated_at = $2
            WHERE id = $1 AND status = 'PENDING' AND (next_retry_at IS NULL OR next_retry_at <= $2)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_job).transpose()
    }

    async fn complete_job(
        &self,
        id: JobId,
        result: &serde_json::Value,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let outcome = sqlx::query(
            r#"
            UPDATE fulfillment_jobs SET
                status = 'COMPLETED', result = $2, next_retry_at = NULL,
                completed_at = $3, updated_at = $3
            WHERE id = $1 AND status = 'PROCESSING'
            "#,
        )
        .bind(id.as_uuid())
        .bind(result)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(outcome.rows_affected() == 1)
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
        let result = sqlx::query(
            r#"
            UPDATE fulfillment_jobs SET
                status = 'PENDING',
                attempts = LEAST($3, max_attempts),
                last_error = $4,
                next_retry_at = $5,
                started_at = NULL,
                updated_at = $6
            WHERE id = $1 AND status = 'PROCESSING' AND attempts = $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(observed_attempts as i32)
        .bind(attempts as i32)
        .bind(error)
        .bind(next_retry_at)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn fail_job(
        &self,
        id: JobId,
        observed_attempts: u32,
        attempts: u32,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE fulfillment_jobs SET
                status = 'FAILED',
                attempts = LEAST($3, max_attempts),
                last_error = $4,
                next_retry_at = NULL,
                updated_at = $5
            WHERE id = $1 AND status = 'PROCESSING' AND attempts = $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(observed_attempts as i32)
        .bind(attempts as i32)
        .bind(error)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn stale_jobs(
        &self,
        started_before: DateTime<Utc>,
        limit_to: usize,
    ) -> Result<Vec<FulfillmentJob>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM fulfillment_jobs \
             WHERE status = 'PROCESSING' AND started_at < $1 \
             ORDER BY started_at ASC LIMIT $2"
        ))
        .bind(started_before)
        .bind(limit(limit_to))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_job).collect()
    }

    async fn failed_jobs(&self, limit_to: usize) -> Result<Vec<FulfillmentJob>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM fulfillment_jobs WHERE status = 'FAILED' \
             ORDER BY updated_at DESC LIMIT $1"
        ))
        .bind(limit(limit_to))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_job).collect()
    }
}

#[async_trait]
impl WalletStore for PostgresLedger {
    async fn get_wallet(&self, account_id: AccountId) -> Result<Option<Wallet>> {
        let row = sqlx::query(
            r#"
            SELECT account_id, balance, total_topup, total_spent, total_cashback, updated_at
            FROM wallets WHERE account_id = $1
            "#,
        )
        .bind(account_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_wallet).transpose()
    }

    async fn post_wallet_entry(
        &self,
        entry: &WalletEntry,
        at: DateTime<Utc>,
    ) -> Result<WalletPosting> {
        sqlx::query(
            r#"
            INSERT INTO wallets (account_id, balance, total_topup, total_spent, total_cashback, updated_at)
            VALUES ($1, 0, 0, 0, 0, $2)
            ON CONFLICT (account_id) DO NOTHING
            "#,
        )
        .bind(entry.account_id.as_uuid())
        .bind(at)
        .execute(&self.pool)
        .await?;

        let txn_id = WalletTransactionId::new();

        // Balance update and history row land together or not at all.
        let posted = sqlx::query(&format!(
            r#"
            WITH w AS (
                UPDATE wallets SET
                    balance = balance + $2,
                    total_topup = total_topup + CASE WHEN $3 = 'TOPUP' THEN $4 ELSE 0 END,
                    total_spent = CASE
                        WHEN $3 = 'PURCHASE' THEN total_spent + $4
                        WHEN $3 = 'REFUND' THEN GREATEST(total_spent - $4, 0)
                        ELSE total_spent
                    END,
                    total_cashback = total_cashback + CASE WHEN $3 = 'CASHBACK' THEN $4 ELSE 0 END,
                    updated_at = $5
                WHERE account_id = $1
                  AND balance + $2 >= 0
                  AND NOT EXISTS (
                      SELECT 1 FROM wallet_transactions WHERE kind = $3 AND reference = $6
                  )
                RETURNING balance
            )
            INSERT INTO wallet_transactions ({WALLET_TXN_COLUMNS})
            SELECT $7, $1, $3, $2, w.balance, $6, $8, $5 FROM w
            RETURNING {WALLET_TXN_COLUMNS}
            "#
        ))
        .bind(entry.account_id.as_uuid())
        .bind(entry.signed_amount().units())
        .bind(entry.kind.as_str())
        .bind(entry.amount.units())
        .bind(at)
        .bind(&entry.reference)
        .bind(txn_id.as_uuid())
        .bind(&entry.description)
        .fetch_optional(&self.pool)
        .await;

        match posted {
            Ok(Some(row)) => Ok(WalletPosting::Applied(Self::row_to_wallet_txn(row)?)),
            Ok(None) => {
                if let Some(existing) = self
                    .find_wallet_transaction(entry.kind, &entry.reference)
                    .await?
                {
                    return Ok(WalletPosting::Duplicate(existing));
                }
                let balance = self
                    .get_wallet(entry.account_id)
                    .await?
                    .map(|w| w.balance)
                    .unwrap_or_else(Money::zero);
                Ok(WalletPosting::InsufficientBalance { balance })
            }
            Err(e) if is_unique_violation(&e) => {
                tracing::debug!(
                    kind = %entry.kind,
                    reference = %entry.reference,
                    "concurrent duplicate wallet posting"
                );
                match self
                    .find_wallet_transaction(entry.kind, &entry.reference)
                    .await?
                {
                    Some(existing) => Ok(WalletPosting::Duplicate(existing)),
                    None => Err(LedgerError::Database(e)),
                }
            }
            Err(e) => Err(LedgerError::Database(e)),
        }
    }

    async fn wallet_transactions(&self, account_id: AccountId) -> Result<Vec<WalletTransaction>> {
        let rows = sqlx::query(&format!(
            "SELECT {WALLET_TXN_COLUMNS} FROM wallet_transactions WHERE account_id = $1 \
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(account_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_wallet_txn).collect()
    }

    async fn find_wallet_transaction(
        &self,
        kind: WalletEntryKind,
        reference: &str,
    ) -> Result<Option<WalletTransaction>> {
        let row = sqlx::query(&format!(
            "SELECT {WALLET_TXN_COLUMNS} FROM wallet_transactions WHERE kind = $1 AND reference = $2"
        ))
        .bind(kind.as_str())
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_wallet_txn).transpose()
    }

    async fn award_points(&self, award: &PointAward) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO point_awards (order_id, account_id, points, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (order_id) DO NOTHING
            "#,
        )
        .bind(award.order_id.as_uuid())
        .bind(award.account_id.as_uuid())
        .bind(award.points)
        .bind(award.created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn points_balance(&self, account_id: AccountId) -> Result<i64> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(points), 0)::BIGINT FROM point_awards WHERE account_id = $1",
        )
        .bind(account_id.as_uuid())
        .fetch_one(&self.pool)
        .await?;

        Ok(total)
    }
}

#[async_trait]
impl WebhookStore for PostgresLedger {
    async fn insert_endpoint(&self, endpoint: &WebhookEndpoint) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO webhook_endpoints (id, account_id, url, secret, active, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(endpoint.id.as_uuid())
        .bind(endpoint.account_id.as_uuid())
        .bind(&endpoint.url)
        .bind(&endpoint.secret)
        .bind(endpoint.active)
        .bind(endpoint.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                return LedgerError::Duplicate {
                    entity: "webhook endpoint",
                    id: endpoint.id.to_string(),
                };
            }
            LedgerError::Database(e)
        })?;

        Ok(())
    }

    async fn get_endpoint(&self, id: WebhookEndpointId) -> Result<Option<WebhookEndpoint>> {
        let row = sqlx::query(
            "SELECT id, account_id, url, secret, active, created_at FROM webhook_endpoints WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_endpoint).transpose()
    }

    async fn active_endpoints(&self, account_id: AccountId) -> Result<Vec<WebhookEndpoint>> {
        let rows = sqlx::query(
            r#"
            SELECT id, account_id, url, secret, active, created_at
            FROM webhook_endpoints
            WHERE account_id = $1 AND active = TRUE
            ORDER BY created_at ASC
            "#,
        )
        .bind(account_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_endpoint).collect()
    }

    async fn insert_delivery(&self, delivery: &WebhookDelivery) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO webhook_deliveries ({DELIVERY_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)"
        ))
        .bind(delivery.id.as_uuid())
        .bind(delivery.endpoint_id.as_uuid())
        .bind(delivery.order_id.as_uuid())
        .bind(delivery.event.as_str())
        .bind(&delivery.payload)
        .bind(delivery.timestamp)
        .bind(&delivery.signature)
        .bind(delivery.response_status.map(i32::from))
        .bind(&delivery.response_body)
        .bind(delivery.delivered_at)
        .bind(delivery.failed_at)
        .bind(&delivery.error)
        .bind(delivery.retry_of.map(|id| id.as_uuid()))
        .bind(delivery.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                return LedgerError::Duplicate {
                    entity: "webhook delivery",
                    id: delivery.id.to_string(),
                };
            }
            LedgerError::Database(e)
        })?;

        Ok(())
    }

    async fn get_delivery(&self, id: WebhookDeliveryId) -> Result<Option<WebhookDelivery>> {
        let row = sqlx::query(&format!(
            "SELECT {DELIVERY_COLUMNS} FROM webhook_deliveries WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_delivery).transpose()
    }

    async fn deliveries_for_order(&self, order_id: OrderId) -> Result<Vec<WebhookDelivery>> {
        let rows = sqlx::query(&format!(
            "SELECT {DELIVERY_COLUMNS} FROM webhook_deliveries WHERE order_id = $1 \
             ORDER BY created_at ASC"
        ))
        .bind(order_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_delivery).collect()
    }
}

#[async_trait]
impl SettingsStore for PostgresLedger {
    async fn load_settings(&self) -> Result<HashMap<String, String>> {
        let rows = sqlx::query("SELECT key, value FROM settings")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| -> Result<(String, String)> {
                Ok((row.try_get("key")?, row.try_get("value")?))
            })
            .collect()
    }

    async fn put_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO settings (key, value, updated_at) VALUES ($1, $2, NOW())
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

//! Checkout: turns a validated cart into an order awaiting payment.

use chrono::Utc;
use common::{AccountId, ProductId};
use domain::{Customer, DeliveryType, Money, Order, OrderItem, OrderOwner, OrderTotals};
use ledger::OrderStore;
use serde::Deserialize;

use crate::error::{Result, SettlementError};

/// Largest quantity a single cart line may ask for.
pub const MAX_LINE_QUANTITY: u32 = 10_000;

/// One cart line. Name and delivery type are the catalog's values at
/// checkout time and are stored on the item as a snapshot.
#[derive(Debug, Clone, Deserialize)]
pub struct PlaceOrderItem {
    pub product_id: ProductId,
    pub product_name: String,
    pub delivery_type: DeliveryType,
    pub quantity: u32,
    pub unit_price: Money,
    #[serde(default)]
    pub input_data: serde_json::Value,
}

/// A checkout request.
#[derive(Debug, Clone, Deserialize)]
pub struct PlaceOrder {
    #[serde(default)]
    pub account_id: Option<AccountId>,
    #[serde(default)]
    pub guest_token: Option<String>,
    pub customer: Customer,
    pub items: Vec<PlaceOrderItem>,
    #[serde(default)]
    pub discount_amount: Money,
    #[serde(default)]
    pub points_discount: Money,
}

/// Mints an opaque token identifying a guest's order.
pub fn mint_guest_token() -> String {
    format!("guest_{}", uuid::Uuid::new_v4().simple())
}

/// Creates orders.
#[derive(Debug, Clone)]
pub struct CheckoutService<L> {
    ledger: L,
}

impl<L: OrderStore> CheckoutService<L> {
    pub fn new(ledger: L) -> Self {
        Self { ledger }
    }

    /// Validates the request, computes totals once and stores the order
    /// with its items as AWAITING_PAYMENT.
    #[tracing::instrument(skip(self, request), fields(items = request.items.len()))]
    pub async fn place_order(&self, request: PlaceOrder) -> Result<(Order, Vec<OrderItem>)> {
        let owner = owner(&request)?;
        validate_customer(&request.customer)?;
        if request.items.is_empty() {
            return Err(SettlementError::Validation(
                "an order needs at least one item".to_string(),
            ));
        }
        for line in &request.items {
            validate_line(line)?;
        }

        let subtotal = request
            .items
            .iter()
            .try_fold(Money::zero(), |acc, line| {
                line.unit_price
                    .checked_multiply(line.quantity)
                    .and_then(|total| acc.checked_add(total))
            })
            .ok_or_else(|| SettlementError::Validation("order amounts overflow".to_string()))?;
        let totals = OrderTotals::compute(subtotal, request.discount_amount, request.points_discount)
            .map_err(|e| SettlementError::Validation(e.to_string()))?;

        let now = Utc::now();
        let order = Order::new(owner, request.customer, totals, now);
        let items: Vec<OrderItem> = request
            .items
            .into_iter()
            .map(|line| {
                OrderItem::new(
                    order.id,
                    line.product_id,
                    line.product_name,
                    line.delivery_type,
                    line.quantity,
                    line.unit_price,
                    line.input_data,
                    now,
                )
            })
            .collect();

        self.ledger.insert_order(&order, &items).await?;
        tracing::info!(order_id = %order.id, total = %order.total_amount, "order placed");
        Ok((order, items))
    }
}

fn owner(request: &PlaceOrder) -> Result<OrderOwner> {
    match (&request.account_id, &request.guest_token) {
        (Some(_), Some(_)) => Err(SettlementError::Validation(
            "an order belongs to an account or a guest, not both".to_string(),
        )),
        (Some(account), None) => Ok(OrderOwner::Account(*account)),
        (None, Some(token)) if token.trim().is_empty() => Err(SettlementError::Validation(
            "guest token must not be blank".to_string(),
        )),
        (None, Some(token)) => Ok(OrderOwner::Guest(token.clone())),
        (None, None) => Ok(OrderOwner::Guest(mint_guest_token())),
    }
}

fn validate_customer(customer: &Customer) -> Result<()> {
    let email = customer.email.trim();
    if email.is_empty() || !email.contains('@') {
        return Err(SettlementError::Validation(format!(
            "invalid customer email {:?}",
            customer.email
        )));
    }
    if customer.name.trim().is_empty() {
        return Err(SettlementError::Validation(
            "customer name is required".to_string(),
        ));
    }
    Ok(())
}

fn validate_line(line: &PlaceOrderItem) -> Result<()> {
    if line.quantity == 0 {
        return Err(SettlementError::Validation(format!(
            "quantity for {} must be at least 1",
            line.product_id
        )));
    }
    if line.quantity > MAX_LINE_QUANTITY {
        return Err(SettlementError::Validation(format!(
            "quantity for {} exceeds {MAX_LINE_QUANTITY}",
            line.product_id
        )));
    }
    if line.unit_price.is_negative() {
        return Err(SettlementError::Validation(format!(
            "unit price for {} must not be negative",
            line.product_id
        )));
    }
    if line.product_name.trim().is_empty() {
        return Err(SettlementError::Validation(format!(
            "product {} has no name",
            line.product_id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::OrderStatus;
    use ledger::InMemoryLedger;
    use serde_json::json;

    fn line(sku: &str, quantity: u32, price: i64) -> PlaceOrderItem {
        PlaceOrderItem {
            product_id: ProductId::new(sku),
            product_name: format!("Product {sku}"),
            delivery_type: DeliveryType::Stock,
            quantity,
            unit_price: Money::from_units(price),
            input_data: json!({}),
        }
    }

    fn request(items: Vec<PlaceOrderItem>) -> PlaceOrder {
        PlaceOrder {
            account_id: None,
            guest_token: None,
            customer: Customer {
                email: "buyer@example.com".to_string(),
                name: "Buyer".to_string(),
            },
            items,
            discount_amount: Money::zero(),
            points_discount: Money::zero(),
        }
    }

    #[tokio::test]
    async fn test_totals_computed_once() {
        let ledger = InMemoryLedger::new();
        let checkout = CheckoutService::new(ledger.clone());
        let mut req = request(vec![line("A", 2, 10_000), line("B", 1, 5_000)]);
        req.discount_amount = Money::from_units(3_000);
        req.points_discount = Money::from_units(1_000);

        let (order, items) = checkout.place_order(req).await.unwrap();
        assert_eq!(order.subtotal.units(), 25_000);
        assert_eq!(order.total_amount.units(), 21_000);
        assert_eq!(order.status, OrderStatus::AwaitingPayment);
        assert!(order.totals_consistent());
        assert_eq!(items[0].total_price.units(), 20_000);

        let stored = ledger.get_order(order.id).await.unwrap().unwrap();
        assert_eq!(stored.total_amount, order.total_amount);
        assert_eq!(ledger.get_order_items(order.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_total_clamped_at_zero() {
        let checkout = CheckoutService::new(InMemoryLedger::new());
        let mut req = request(vec![line("A", 1, 1_000)]);
        req.discount_amount = Money::from_units(5_000);

        let (order, _) = checkout.place_order(req).await.unwrap();
        assert_eq!(order.total_amount, Money::zero());
    }

    #[tokio::test]
    async fn test_guest_token_minted() {
        let checkout = CheckoutService::new(InMemoryLedger::new());
        let (order, _) = checkout
            .place_order(request(vec![line("A", 1, 1_000)]))
            .await
            .unwrap();
        assert!(order.guest_token.unwrap().starts_with("guest_"));
        assert_eq!(order.account_id, None);
    }

    #[tokio::test]
    async fn test_invalid_requests_write_nothing() {
        let ledger = InMemoryLedger::new();
        let checkout = CheckoutService::new(ledger.clone());

        let mut both = request(vec![line("A", 1, 1)]);
        both.account_id = Some(AccountId::new());
        both.guest_token = Some("tok".to_string());

        let mut bad_email = request(vec![line("A", 1, 1)]);
        bad_email.customer.email = "nope".to_string();

        let mut negative_discount = request(vec![line("A", 1, 1)]);
        negative_discount.discount_amount = Money::from_units(-1);

        let cases = vec![
            request(vec![]),
            request(vec![line("A", 0, 1_000)]),
            request(vec![line("A", 1, -5)]),
            both,
            bad_email,
            negative_discount,
        ];
        for case in cases {
            let err = checkout.place_order(case).await.unwrap_err();
            assert!(matches!(err, SettlementError::Validation(_)), "{err}");
        }
        assert_eq!(ledger.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_overflowing_amounts_rejected() {
        let ledger = InMemoryLedger::new();
        let checkout = CheckoutService::new(ledger.clone());

        let cases = vec![
            request(vec![line("A", 3, i64::MAX / 2)]),
            request(vec![line("A", 1, i64::MAX), line("B", 1, 1)]),
            request(vec![line("A", MAX_LINE_QUANTITY + 1, 1)]),
        ];
        for case in cases {
            let err = checkout.place_order(case).await.unwrap_err();
            assert!(matches!(err, SettlementError::Validation(_)), "{err}");
        }
        assert_eq!(ledger.mutation_count(), 0);

        let (order, _) = checkout
            .place_order(request(vec![line("A", MAX_LINE_QUANTITY, 2)]))
            .await
            .unwrap();
        assert_eq!(order.subtotal.units(), 20_000);
    }
}

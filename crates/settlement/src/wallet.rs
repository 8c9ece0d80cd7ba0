//! Reseller wallet payments, refunds and delivery rewards.

use chrono::Utc;
use common::{AccountId, OrderId};
use domain::{
    Money, Order, OrderStatus, PointAward, Settings, WalletEntry, WalletEntryKind, WalletPosting,
    WalletTransaction,
};
use ledger::{OrderStore, WalletStore};

use crate::error::{Result, SettlementError};
use crate::machine::OrderStateMachine;

/// Result of paying an order from a wallet.
#[derive(Debug, Clone)]
pub struct WalletPayment {
    pub transaction: WalletTransaction,
    /// True only for the call that moved the order to PAID.
    pub became_paid: bool,
}

/// What an order earned on delivery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rewards {
    pub points: i64,
    pub cashback: Money,
}

/// Wallet postings keyed by order so each one happens at most once.
pub struct WalletService<L> {
    ledger: L,
    machine: OrderStateMachine<L>,
}

impl<L> WalletService<L>
where
    L: OrderStore + WalletStore + Clone,
{
    pub fn new(ledger: L) -> Self {
        Self {
            machine: OrderStateMachine::new(ledger.clone()),
            ledger,
        }
    }

    /// Credits a top-up. `reference` identifies the external transfer so a
    /// replayed top-up is not credited twice.
    #[tracing::instrument(skip(self, settings))]
    pub async fn top_up(
        &self,
        account_id: AccountId,
        amount: Money,
        reference: &str,
        settings: &Settings,
    ) -> Result<WalletTransaction> {
        if amount < settings.min_topup {
            return Err(SettlementError::Validation(format!(
                "top-up {amount} is below the minimum of {}",
                settings.min_topup
            )));
        }

        let entry = WalletEntry::new(
            account_id,
            WalletEntryKind::Topup,
            amount,
            reference,
            "Wallet top-up",
        )?;
        let transaction = self.post_credit(&entry).await?;
        tracing::info!(%account_id, %amount, "wallet topped up");
        Ok(transaction)
    }

    /// Pays an order from the owning account's wallet.
    ///
    /// The debit and its `Purchase` row are one conditional write keyed by
    /// the order id, so a repeated call never debits twice. If the order
    /// left AWAITING_PAYMENT between the debit and the transition (for
    /// example it was cancelled), the debit is refunded.
    #[tracing::instrument(skip(self))]
    pub async fn pay_order(&self, order_id: OrderId, account_id: AccountId) -> Result<WalletPayment> {
        let order = self.machine.load(order_id).await?;
        if order.account_id != Some(account_id) {
            return Err(SettlementError::Validation(format!(
                "order {order_id} does not belong to account {account_id}"
            )));
        }

        let reference = order_id.to_string();
        if order.status != OrderStatus::AwaitingPayment {
            // a repeated call for an order this wallet already paid
            let live = !matches!(order.status, OrderStatus::Cancelled | OrderStatus::Failed);
            if let Some(transaction) = self
                .ledger
                .find_wallet_transaction(WalletEntryKind::Purchase, &reference)
                .await?
                .filter(|_| live)
            {
                return Ok(WalletPayment {
                    transaction,
                    became_paid: false,
                });
            }
            return Err(SettlementError::Validation(format!(
                "order {order_id} is {}, not awaiting payment",
                order.status
            )));
        }

        let entry = WalletEntry::new(
            account_id,
            WalletEntryKind::Purchase,
            order.total_amount,
            reference,
            format!("Payment for order {order_id}"),
        )
        .map_err(|_| SettlementError::Validation(format!("order {order_id} has nothing to charge")))?;

        let (transaction, fresh) = match self.ledger.post_wallet_entry(&entry, Utc::now()).await? {
            WalletPosting::Applied(tx) => (tx, true),
            WalletPosting::Duplicate(tx) => (tx, false),
            WalletPosting::InsufficientBalance { balance } => {
                return Err(SettlementError::Validation(format!(
                    "wallet balance {balance} is less than {}",
                    order.total_amount
                )));
            }
        };

        let became_paid = self
            .machine
            .transition(order_id, OrderStatus::AwaitingPayment, OrderStatus::Paid)
            .await?;

        if fresh && !became_paid {
            let current = self.machine.load(order_id).await?;
            if current.status == OrderStatus::Cancelled || current.status == OrderStatus::Failed {
                self.refund(order_id).await?;
                return Err(SettlementError::Validation(format!(
                    "order {order_id} was {} before the wallet payment landed; debit refunded",
                    current.status
                )));
            }
        }

        if became_paid {
            tracing::info!(%order_id, %account_id, "order paid from wallet");
        }
        Ok(WalletPayment {
            transaction,
            became_paid,
        })
    }

    /// Refunds a wallet-paid order once. Returns `None` for orders that were
    /// not paid from a wallet.
    #[tracing::instrument(skip(self))]
    pub async fn refund(&self, order_id: OrderId) -> Result<Option<WalletTransaction>> {
        let reference = order_id.to_string();
        let Some(purchase) = self
            .ledger
            .find_wallet_transaction(WalletEntryKind::Purchase, &reference)
            .await?
        else {
            return Ok(None);
        };

        let entry = WalletEntry::new(
            purchase.account_id,
            WalletEntryKind::Refund,
            Money::from_units(purchase.amount.units().abs()),
            reference,
            format!("Refund for order {order_id}"),
        )?;
        let transaction = self.post_credit(&entry).await?;
        tracing::info!(%order_id, amount = %entry.amount, "wallet payment refunded");
        Ok(Some(transaction))
    }

    /// Grants loyalty points and wallet cashback for a delivered order.
    ///
    /// Each grant is keyed by the order so a repeat is a no-op, and the
    /// order is flagged afterwards so later calls skip the work entirely.
    #[tracing::instrument(skip(self, order, settings), fields(order_id = %order.id))]
    pub async fn grant_rewards(&self, order: &Order, settings: &Settings) -> Result<Rewards> {
        if order.rewards_granted || order.status != OrderStatus::Delivered {
            return Ok(Rewards::default());
        }
        let Some(account_id) = order.account_id else {
            self.ledger.mark_rewards_granted(order.id).await?;
            return Ok(Rewards::default());
        };

        let mut rewards = Rewards::default();

        let points = order
            .total_amount
            .apply_basis_points(settings.point_earn_rate_bps)
            .units();
        if points > 0 {
            let award = PointAward {
                account_id,
                order_id: order.id,
                points,
                created_at: Utc::now(),
            };
            if self.ledger.award_points(&award).await? {
                rewards.points = points;
            }
        }

        let reference = order.id.to_string();
        let wallet_paid = self
            .ledger
            .find_wallet_transaction(WalletEntryKind::Purchase, &reference)
            .await?
            .is_some();
        let cashback = order
            .total_amount
            .apply_basis_points(settings.cashback_rate_bps);
        if wallet_paid && cashback.is_positive() {
            let entry = WalletEntry::new(
                account_id,
                WalletEntryKind::Cashback,
                cashback,
                reference,
                format!("Cashback for order {}", order.id),
            )?;
            if let WalletPosting::Applied(_) = self.ledger.post_wallet_entry(&entry, Utc::now()).await? {
                rewards.cashback = cashback;
            }
        }

        self.ledger.mark_rewards_granted(order.id).await?;
        tracing::info!(points = rewards.points, cashback = %rewards.cashback, "rewards granted");
        Ok(rewards)
    }

    pub async fn points_balance(&self, account_id: AccountId) -> Result<i64> {
        Ok(self.ledger.points_balance(account_id).await?)
    }

    async fn post_credit(&self, entry: &WalletEntry) -> Result<WalletTransaction> {
        match self.ledger.post_wallet_entry(entry, Utc::now()).await? {
            WalletPosting::Applied(tx) | WalletPosting::Duplicate(tx) => Ok(tx),
            WalletPosting::InsufficientBalance { .. } => Err(SettlementError::InvariantViolation(
                format!("credit {} rejected for insufficient balance", entry.kind),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{Customer, DeliveryType, OrderItem, OrderOwner, OrderTotals};
    use ledger::InMemoryLedger;
    use serde_json::json;

    async fn reseller_order(ledger: &InMemoryLedger, account: AccountId, total: i64) -> Order {
        let now = Utc::now();
        let totals =
            OrderTotals::compute(Money::from_units(total), Money::zero(), Money::zero()).unwrap();
        let order = Order::new(
            OrderOwner::Account(account),
            Customer {
                email: "r@example.com".to_string(),
                name: "R".to_string(),
            },
            totals,
            now,
        );
        let item = OrderItem::new(
            order.id,
            "SKU-1",
            "Thing",
            DeliveryType::Stock,
            1,
            Money::from_units(total),
            json!({}),
            now,
        );
        ledger.insert_order(&order, &[item]).await.unwrap();
        order
    }

    async fn funded(service: &WalletService<InMemoryLedger>, amount: i64) -> AccountId {
        let account = AccountId::new();
        service
            .top_up(
                account,
                Money::from_units(amount),
                &format!("TOPUP-{account}"),
                &Settings::default(),
            )
            .await
            .unwrap();
        account
    }

    #[tokio::test]
    async fn test_top_up_minimum_and_replay() {
        let ledger = InMemoryLedger::new();
        let service = WalletService::new(ledger.clone());
        let account = AccountId::new();
        let settings = Settings::default();

        let err = service
            .top_up(account, Money::from_units(1), "T-0", &settings)
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::Validation(_)));

        service
            .top_up(account, Money::from_units(50_000), "T-1", &settings)
            .await
            .unwrap();
        service
            .top_up(account, Money::from_units(50_000), "T-1", &settings)
            .await
            .unwrap();

        let wallet = ledger.get_wallet(account).await.unwrap().unwrap();
        assert_eq!(wallet.balance.units(), 50_000);
        assert_eq!(wallet.total_topup.units(), 50_000);
    }

    #[tokio::test]
    async fn test_pay_order_debits_once() {
        let ledger = InMemoryLedger::new();
        let service = WalletService::new(ledger.clone());
        let account = funded(&service, 100_000).await;
        let order = reseller_order(&ledger, account, 30_000).await;

        let first = service.pay_order(order.id, account).await.unwrap();
        assert!(first.became_paid);
        assert_eq!(first.transaction.amount.units(), -30_000);

        let second = service.pay_order(order.id, account).await.unwrap();
        assert!(!second.became_paid);
        assert_eq!(second.transaction.id, first.transaction.id);

        let wallet = ledger.get_wallet(account).await.unwrap().unwrap();
        assert_eq!(wallet.balance.units(), 70_000);
        assert_eq!(wallet.total_spent.units(), 30_000);
        assert_eq!(
            ledger.get_order(order.id).await.unwrap().unwrap().status,
            OrderStatus::Paid
        );
    }

    #[tokio::test]
    async fn test_insufficient_balance_changes_nothing() {
        let ledger = InMemoryLedger::new();
        let service = WalletService::new(ledger.clone());
        let account = funded(&service, 10_000).await;
        let order = reseller_order(&ledger, account, 30_000).await;
        let before = ledger.mutation_count();

        let err = service.pay_order(order.id, account).await.unwrap_err();
        assert!(matches!(err, SettlementError::Validation(_)));
        assert_eq!(ledger.mutation_count(), before);
    }

    #[tokio::test]
    async fn test_foreign_account_rejected() {
        let ledger = InMemoryLedger::new();
        let service = WalletService::new(ledger.clone());
        let owner = funded(&service, 100_000).await;
        let stranger = funded(&service, 100_000).await;
        let order = reseller_order(&ledger, owner, 1_000).await;

        assert!(service.pay_order(order.id, stranger).await.is_err());
    }

    #[tokio::test]
    async fn test_refund_once() {
        let ledger = InMemoryLedger::new();
        let service = WalletService::new(ledger.clone());
        let account = funded(&service, 100_000).await;
        let order = reseller_order(&ledger, account, 30_000).await;
        service.pay_order(order.id, account).await.unwrap();

        let refund = service.refund(order.id).await.unwrap().unwrap();
        assert_eq!(refund.amount.units(), 30_000);
        let again = service.refund(order.id).await.unwrap().unwrap();
        assert_eq!(again.id, refund.id);

        let wallet = ledger.get_wallet(account).await.unwrap().unwrap();
        assert_eq!(wallet.balance.units(), 100_000);
        let history = ledger.wallet_transactions(account).await.unwrap();
        let sum: i64 = history.iter().map(|t| t.amount.units()).sum();
        assert_eq!(sum, wallet.balance.units());

        // not wallet-paid: nothing to refund
        let other = reseller_order(&ledger, account, 1_000).await;
        assert!(service.refund(other.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rewards_granted_once() {
        let ledger = InMemoryLedger::new();
        let service = WalletService::new(ledger.clone());
        let account = funded(&service, 100_000).await;
        let order = reseller_order(&ledger, account, 25_050).await;
        service.pay_order(order.id, account).await.unwrap();

        let items = ledger.get_order_items(order.id).await.unwrap();
        ledger
            .record_item_delivery(items[0].id, &json!({ "ok": true }), Utc::now())
            .await
            .unwrap();
        let now = Utc::now();
        ledger
            .transition_order(order.id, OrderStatus::Paid, OrderStatus::Processing, now)
            .await
            .unwrap();
        ledger
            .transition_order(order.id, OrderStatus::Processing, OrderStatus::Delivered, now)
            .await
            .unwrap();

        let settings = Settings {
            point_earn_rate_bps: 100,
            cashback_rate_bps: 200,
            ..Settings::default()
        };
        let delivered = ledger.get_order(order.id).await.unwrap().unwrap();
        let rewards = service.grant_rewards(&delivered, &settings).await.unwrap();
        // floor(25_050 * 1%) and floor(25_050 * 2%)
        assert_eq!(rewards.points, 250);
        assert_eq!(rewards.cashback.units(), 501);

        let flagged = ledger.get_order(order.id).await.unwrap().unwrap();
        assert!(flagged.rewards_granted);
        assert_eq!(
            service.grant_rewards(&flagged, &settings).await.unwrap(),
            Rewards::default()
        );
        // replay with a stale snapshot is still a no-op
        assert_eq!(
            service.grant_rewards(&delivered, &settings).await.unwrap(),
            Rewards::default()
        );

        assert_eq!(service.points_balance(account).await.unwrap(), 250);
        let wallet = ledger.get_wallet(account).await.unwrap().unwrap();
        assert_eq!(wallet.total_cashback.units(), 501);
    }
}

//! Reseller wallets and loyalty points.

use chrono::{DateTime, Utc};
use common::{AccountId, OrderId, WalletTransactionId};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::money::Money;

/// Kind of wallet mutation.
///
/// `(kind, reference)` is unique: the same top-up, purchase, cashback or
/// refund is never posted twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WalletEntryKind {
    Topup,
    Purchase,
    Cashback,
    Refund,
}

impl WalletEntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WalletEntryKind::Topup => "TOPUP",
            WalletEntryKind::Purchase => "PURCHASE",
            WalletEntryKind::Cashback => "CASHBACK",
            WalletEntryKind::Refund => "REFUND",
        }
    }

    /// Returns true for kinds that take money out of the wallet.
    pub fn is_debit(&self) -> bool {
        matches!(self, WalletEntryKind::Purchase)
    }
}

impl std::fmt::Display for WalletEntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for WalletEntryKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TOPUP" => Ok(WalletEntryKind::Topup),
            "PURCHASE" => Ok(WalletEntryKind::Purchase),
            "CASHBACK" => Ok(WalletEntryKind::Cashback),
            "REFUND" => Ok(WalletEntryKind::Refund),
            other => Err(DomainError::unknown("wallet entry kind", other)),
        }
    }
}

/// Running totals of a reseller's wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    pub account_id: AccountId,
    pub balance: Money,
    pub total_topup: Money,
    pub total_spent: Money,
    pub total_cashback: Money,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    /// An empty wallet.
    pub fn empty(account_id: AccountId, now: DateTime<Utc>) -> Self {
        Self {
            account_id,
            balance: Money::zero(),
            total_topup: Money::zero(),
            total_spent: Money::zero(),
            total_cashback: Money::zero(),
            updated_at: now,
        }
    }

    /// Applies a posting to the running totals.
    ///
    /// Returns `None` when a debit would take the balance below zero.
    pub fn posted(&self, entry: &WalletEntry, now: DateTime<Utc>) -> Option<Wallet> {
        let signed = entry.signed_amount();
        let balance = self.balance + signed;
        if balance.is_negative() {
            return None;
        }

        let mut next = self.clone();
        next.balance = balance;
        next.updated_at = now;
        match entry.kind {
            WalletEntryKind::Topup => next.total_topup += entry.amount,
            WalletEntryKind::Purchase => next.total_spent += entry.amount,
            WalletEntryKind::Cashback => next.total_cashback += entry.amount,
            WalletEntryKind::Refund => next.total_spent = next.total_spent.saturating_sub(entry.amount),
        }
        Some(next)
    }
}

/// A requested wallet mutation. `amount` is always positive; the sign
/// comes from the kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletEntry {
    pub account_id: AccountId,
    pub kind: WalletEntryKind,
    pub amount: Money,
    pub reference: String,
    pub description: String,
}

impl WalletEntry {
    pub fn new(
        account_id: AccountId,
        kind: WalletEntryKind,
        amount: Money,
        reference: impl Into<String>,
        description: impl Into<String>,
    ) -> Result<Self, DomainError> {
        if !amount.is_positive() {
            return Err(DomainError::InvalidOrder(format!(
                "wallet {kind} amount must be positive, got {amount}"
            )));
        }
        Ok(Self {
            account_id,
            kind,
            amount,
            reference: reference.into(),
            description: description.into(),
        })
    }

    /// Amount as it lands on the balance.
    pub fn signed_amount(&self) -> Money {
        if self.kind.is_debit() {
            self.amount.negate()
        } else {
            self.amount
        }
    }
}

/// Immutable audit row for one wallet mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletTransaction {
    pub id: WalletTransactionId,
    pub account_id: AccountId,
    pub kind: WalletEntryKind,
    /// Signed: negative for debits.
    pub amount: Money,
    pub balance_after: Money,
    pub reference: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl WalletTransaction {
    pub fn record(entry: &WalletEntry, balance_after: Money, now: DateTime<Utc>) -> Self {
        Self {
            id: WalletTransactionId::new(),
            account_id: entry.account_id,
            kind: entry.kind,
            amount: entry.signed_amount(),
            balance_after,
            reference: entry.reference.clone(),
            description: entry.description.clone(),
            created_at: now,
        }
    }
}

/// Result of posting a wallet entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletPosting {
    /// Balance and history updated.
    Applied(WalletTransaction),
    /// An entry with the same kind and reference already exists; nothing changed.
    Duplicate(WalletTransaction),
    /// A debit larger than the balance; nothing changed.
    InsufficientBalance { balance: Money },
}

/// Loyalty points granted for a delivered order. One per order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointAward {
    pub account_id: AccountId,
    pub order_id: OrderId,
    pub points: i64,
    pub created_at: DateTime<Utc>,
}

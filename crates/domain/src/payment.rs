//! Gateway payment attempts.

use chrono::{DateTime, Duration, Utc};
use common::{OrderId, PaymentId};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::money::Money;

/// Local view of a gateway payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Paid,
    /// Cancelled by policy once `expires_at` passed; irreversible.
    Expired,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Paid => "PAID",
            PaymentStatus::Expired => "EXPIRED",
            PaymentStatus::Failed => "FAILED",
        }
    }

    /// Returns true once the payment has left PENDING.
    pub fn is_final(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PaymentStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(PaymentStatus::Pending),
            "PAID" => Ok(PaymentStatus::Paid),
            "EXPIRED" => Ok(PaymentStatus::Expired),
            "FAILED" => Ok(PaymentStatus::Failed),
            other => Err(DomainError::unknown("payment status", other)),
        }
    }
}

/// Charge details returned by the gateway when a payment is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeDetails {
    pub external_trx_id: Option<String>,
    pub qr_link: Option<String>,
    pub pay_url: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// Outcome written when a payment leaves PENDING.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentSettlement {
    pub status: PaymentStatus,
    pub external_trx_id: Option<String>,
    pub fee: Money,
    pub net_amount: Money,
    pub paid_at: Option<DateTime<Utc>>,
}

/// One payment attempt for an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    pub order_id: OrderId,
    /// Externally visible idempotency key sent to the gateway.
    pub ref_id: String,
    pub external_trx_id: Option<String>,
    pub amount: Money,
    pub fee: Money,
    pub net_amount: Money,
    pub status: PaymentStatus,
    pub qr_link: Option<String>,
    pub pay_url: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    /// Creates a PENDING attempt before the gateway charge is attached.
    ///
    /// `expires_at` starts at the fallback window and is replaced by the
    /// gateway's own expiry once the charge exists.
    pub fn pending(
        order_id: OrderId,
        amount: Money,
        fallback_window: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: PaymentId::new(),
            order_id,
            ref_id: mint_ref_id(),
            external_trx_id: None,
            amount,
            fee: Money::zero(),
            net_amount: Money::zero(),
            status: PaymentStatus::Pending,
            qr_link: None,
            pay_url: None,
            expires_at: now + fallback_window,
            paid_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns true if this attempt is PENDING and not yet past its expiry.
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.status == PaymentStatus::Pending && self.expires_at > now
    }

    /// Returns true if the gateway charge has been attached.
    pub fn has_charge(&self) -> bool {
        self.qr_link.is_some() || self.pay_url.is_some() || self.external_trx_id.is_some()
    }
}

/// Mints a fresh, externally unique payment reference.
pub fn mint_ref_id() -> String {
    format!("PAY-{}", uuid::Uuid::new_v4().simple()).to_uppercase()
}

/// Gateway fee: what the buyer was charged beyond what the merchant receives.
pub fn gateway_fee(amount_charged: Money, amount_settled: Money) -> Money {
    amount_charged.saturating_sub(amount_settled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_payment_defaults() {
        let now = Utc::now();
        let payment = Payment::pending(
            OrderId::new(),
            Money::from_units(25_000),
            Duration::minutes(15),
            now,
        );
        assert_eq!(payment.status, PaymentStatus::Pending);
        assert_eq!(payment.expires_at, now + Duration::minutes(15));
        assert!(payment.ref_id.starts_with("PAY-"));
        assert!(!payment.has_charge());
        assert!(payment.is_open(now));
        assert!(!payment.is_open(now + Duration::minutes(16)));
    }

    #[test]
    fn test_ref_ids_are_unique() {
        assert_ne!(mint_ref_id(), mint_ref_id());
    }

    #[test]
    fn test_fee_never_negative() {
        let fee = gateway_fee(Money::from_units(10_070), Money::from_units(10_000));
        assert_eq!(fee.units(), 70);
        let fee = gateway_fee(Money::from_units(10_000), Money::from_units(10_500));
        assert_eq!(fee, Money::zero());
    }

    #[test]
    fn test_final_statuses() {
        assert!(!PaymentStatus::Pending.is_final());
        assert!(PaymentStatus::Paid.is_final());
        assert!(PaymentStatus::Expired.is_final());
        assert!(PaymentStatus::Failed.is_final());
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("EXPIRED".parse::<PaymentStatus>().unwrap(), PaymentStatus::Expired);
        assert!("REFUNDED".parse::<PaymentStatus>().is_err());
    }
}

//! Business settings snapshot.

use std::collections::HashMap;

use chrono::Duration;

use crate::error::DomainError;
use crate::money::Money;

pub const POINT_EARN_RATE_BPS: &str = "point_earn_rate_bps";
pub const CASHBACK_RATE_BPS: &str = "cashback_rate_bps";
pub const MIN_TOPUP: &str = "min_topup";
pub const PAYMENT_EXPIRY_MINUTES: &str = "payment_expiry_minutes";
pub const JOB_MAX_ATTEMPTS: &str = "job_max_attempts";

/// Operator-tunable business configuration, loaded from the ledger's
/// settings table and treated as immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Loyalty points per delivered order, as basis points of the total.
    pub point_earn_rate_bps: u32,
    /// Reseller cashback per delivered order, as basis points of the total.
    pub cashback_rate_bps: u32,
    /// Smallest accepted wallet top-up.
    pub min_topup: Money,
    /// Expiry applied when the gateway does not report one.
    pub payment_expiry_fallback: Duration,
    /// Attempts a fulfillment job gets before it fails for good.
    pub job_max_attempts: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            point_earn_rate_bps: 100,
            cashback_rate_bps: 200,
            min_topup: Money::from_units(10_000),
            payment_expiry_fallback: Duration::minutes(15),
            job_max_attempts: 5,
        }
    }
}

impl Settings {
    /// Builds a snapshot from stored key/value rows.
    ///
    /// Missing keys keep their defaults; unknown keys are ignored; values
    /// that do not parse are an error rather than silently defaulted.
    pub fn from_pairs(pairs: &HashMap<String, String>) -> Result<Self, DomainError> {
        let mut settings = Settings::default();

        if let Some(v) = pairs.get(POINT_EARN_RATE_BPS) {
            settings.point_earn_rate_bps = parse(POINT_EARN_RATE_BPS, v)?;
        }
        if let Some(v) = pairs.get(CASHBACK_RATE_BPS) {
            settings.cashback_rate_bps = parse(CASHBACK_RATE_BPS, v)?;
        }
        if let Some(v) = pairs.get(MIN_TOPUP) {
            settings.min_topup = Money::from_units(parse(MIN_TOPUP, v)?);
        }
        if let Some(v) = pairs.get(PAYMENT_EXPIRY_MINUTES) {
            let minutes: i64 = parse(PAYMENT_EXPIRY_MINUTES, v)?;
            if minutes <= 0 {
                return Err(invalid(PAYMENT_EXPIRY_MINUTES, v));
            }
            settings.payment_expiry_fallback = Duration::minutes(minutes);
        }
        if let Some(v) = pairs.get(JOB_MAX_ATTEMPTS) {
            let attempts: u32 = parse(JOB_MAX_ATTEMPTS, v)?;
            if attempts == 0 {
                return Err(invalid(JOB_MAX_ATTEMPTS, v));
            }
            settings.job_max_attempts = attempts;
        }

        Ok(settings)
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, DomainError> {
    value.trim().parse().map_err(|_| invalid(key, value))
}

fn invalid(key: &str, value: &str) -> DomainError {
    DomainError::InvalidSetting {
        key: key.to_string(),
        value: value.to_string(),
    }
}

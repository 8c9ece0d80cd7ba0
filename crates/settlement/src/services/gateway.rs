//! Payment gateway trait with in-memory and HTTP implementations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use domain::Money;
use serde::{Deserialize, Serialize};

use super::{lock, status_error, transport_error};
use crate::error::{Result, SettlementError};

const SERVICE: &str = "payment gateway";

/// A charge to open with the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChargeRequest {
    pub ref_id: String,
    pub amount: Money,
    pub customer_email: String,
    pub customer_name: String,
}

/// What the gateway returned for a new charge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayCharge {
    pub external_trx_id: Option<String>,
    pub qr_link: Option<String>,
    pub pay_url: Option<String>,
    /// Gateway-side expiry; `None` when the gateway does not report one.
    pub expires_at: Option<DateTime<Utc>>,
    pub amount_charged: Money,
    pub amount_settled: Money,
}

/// The gateway's view of a charge, in its own status vocabulary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayStatusReport {
    pub status: String,
    pub external_trx_id: Option<String>,
    pub amount_charged: Option<Money>,
    pub amount_settled: Option<Money>,
}

/// Trait for the external payment gateway.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Opens a charge keyed by the caller's `ref_id`.
    async fn create_charge(&self, request: &ChargeRequest) -> Result<GatewayCharge>;

    /// Looks up the current status of the charge opened for `ref_id`.
    async fn query_status(&self, ref_id: &str) -> Result<GatewayStatusReport>;
}

#[async_trait]
impl<T: PaymentGateway + ?Sized> PaymentGateway for Arc<T> {
    async fn create_charge(&self, request: &ChargeRequest) -> Result<GatewayCharge> {
        (**self).create_charge(request).await
    }

    async fn query_status(&self, ref_id: &str) -> Result<GatewayStatusReport> {
        (**self).query_status(ref_id).await
    }
}

#[derive(Debug, Clone)]
struct ChargeRecord {
    external_trx_id: String,
    amount: Money,
    status: String,
}

#[derive(Debug)]
struct InMemoryGatewayState {
    charges: HashMap<String, ChargeRecord>,
    create_calls: usize,
    query_calls: usize,
    unreachable: bool,
    fee: Money,
    charge_ttl: Option<Duration>,
    next_trx: u32,
}

impl Default for InMemoryGatewayState {
    fn default() -> Self {
        Self {
            charges: HashMap::new(),
            create_calls: 0,
            query_calls: 0,
            unreachable: false,
            fee: Money::zero(),
            charge_ttl: Some(Duration::minutes(30)),
            next_trx: 0,
        }
    }
}

/// In-memory gateway for tests and the default binary.
///
/// Charges start out `pending`; tests move them along with [`set_status`].
///
/// [`set_status`]: InMemoryPaymentGateway::set_status
#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentGateway {
    state: Arc<Mutex<InMemoryGatewayState>>,
}

impl InMemoryPaymentGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the gateway-side status of the charge for `ref_id`.
    pub fn set_status(&self, ref_id: &str, status: &str) {
        if let Some(charge) = lock(&self.state).charges.get_mut(ref_id) {
            charge.status = status.to_string();
        }
    }

    /// Makes every call fail as if the gateway could not be reached.
    pub fn set_unreachable(&self, unreachable: bool) {
        lock(&self.state).unreachable = unreachable;
    }

    /// Fee withheld from every settled amount.
    pub fn set_fee(&self, fee: Money) {
        lock(&self.state).fee = fee;
    }

    /// Expiry reported for new charges; `None` reports no expiry.
    pub fn set_charge_ttl(&self, ttl: Option<Duration>) {
        lock(&self.state).charge_ttl = ttl;
    }

    pub fn create_calls(&self) -> usize {
        lock(&self.state).create_calls
    }

    pub fn query_calls(&self) -> usize {
        lock(&self.state).query_calls
    }

    pub fn charge_count(&self) -> usize {
        lock(&self.state).charges.len()
    }

    /// Amount the charge for `ref_id` was opened for.
    pub fn charged_amount(&self, ref_id: &str) -> Option<Money> {
        lock(&self.state).charges.get(ref_id).map(|c| c.amount)
    }
}

#[async_trait]
impl PaymentGateway for InMemoryPaymentGateway {
    async fn create_charge(&self, request: &ChargeRequest) -> Result<GatewayCharge> {
        let mut state = lock(&self.state);
        state.create_calls += 1;

        if state.unreachable {
            return Err(SettlementError::transient(SERVICE, "connection refused"));
        }
        if state.charges.contains_key(&request.ref_id) {
            return Err(SettlementError::permanent(
                SERVICE,
                format!("duplicate ref_id {}", request.ref_id),
            ));
        }

        state.next_trx += 1;
        let external_trx_id = format!("TRX-{:06}", state.next_trx);
        let fee = state.fee;
        let expires_at = state.charge_ttl.map(|ttl| Utc::now() + ttl);
        state.charges.insert(
            request.ref_id.clone(),
            ChargeRecord {
                external_trx_id: external_trx_id.clone(),
                amount: request.amount,
                status: "pending".to_string(),
            },
        );

        Ok(GatewayCharge {
            qr_link: Some(format!("https://pay.test/qr/{}", request.ref_id)),
            pay_url: Some(format!("https://pay.test/checkout/{}", request.ref_id)),
            external_trx_id: Some(external_trx_id),
            expires_at,
            amount_charged: request.amount,
            amount_settled: request.amount.saturating_sub(fee),
        })
    }

    async fn query_status(&self, ref_id: &str) -> Result<GatewayStatusReport> {
        let mut state = lock(&self.state);
        state.query_calls += 1;

        if state.unreachable {
            return Err(SettlementError::transient(SERVICE, "connection refused"));
        }

        let fee = state.fee;
        let charge = state
            .charges
            .get(ref_id)
            .ok_or_else(|| SettlementError::permanent(SERVICE, format!("unknown ref_id {ref_id}")))?;

        Ok(GatewayStatusReport {
            status: charge.status.clone(),
            external_trx_id: Some(charge.external_trx_id.clone()),
            amount_charged: Some(charge.amount),
            amount_settled: Some(charge.amount.saturating_sub(fee)),
        })
    }
}

/// Request body of `POST {base}/charges`.
#[derive(Debug, Serialize)]
struct CreateChargeBody<'a> {
    ref_id: &'a str,
    amount: i64,
    customer_email: &'a str,
    customer_name: &'a str,
}

/// Response body of both gateway endpoints.
#[derive(Debug, Deserialize)]
struct ChargeBody {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    trx_id: Option<String>,
    #[serde(default)]
    qr_link: Option<String>,
    #[serde(default)]
    pay_url: Option<String>,
    #[serde(default)]
    expired_at: Option<DateTime<Utc>>,
    #[serde(default)]
    amount: Option<i64>,
    #[serde(default)]
    amount_received: Option<i64>,
}

/// Gateway client speaking JSON over HTTPS with a bearer API key.
#[derive(Debug, Clone)]
pub struct HttpPaymentGateway {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpPaymentGateway {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    async fn read_body(response: reqwest::Response) -> Result<ChargeBody> {
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| transport_error(SERVICE, e))?;
        if !status.is_success() {
            return Err(status_error(SERVICE, status, &text));
        }
        serde_json::from_str(&text).map_err(|e| {
            SettlementError::permanent(SERVICE, format!("malformed response: {e}"))
        })
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    #[tracing::instrument(skip(self, request), fields(ref_id = %request.ref_id))]
    async fn create_charge(&self, request: &ChargeRequest) -> Result<GatewayCharge> {
        let response = self
            .client
            .post(format!("{}/charges", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&CreateChargeBody {
                ref_id: &request.ref_id,
                amount: request.amount.units(),
                customer_email: &request.customer_email,
                customer_name: &request.customer_name,
            })
            .send()
            .await
            .map_err(|e| transport_error(SERVICE, e))?;

        let body = Self::read_body(response).await?;
        if body.qr_link.is_none() && body.pay_url.is_none() {
            return Err(SettlementError::permanent(
                SERVICE,
                "malformed response: no payment link",
            ));
        }

        let amount_charged = body.amount.map(Money::from_units).unwrap_or(request.amount);
        Ok(GatewayCharge {
            external_trx_id: body.trx_id,
            qr_link: body.qr_link,
            pay_url: body.pay_url,
            expires_at: body.expired_at,
            amount_charged,
            amount_settled: body
                .amount_received
                .map(Money::from_units)
                .unwrap_or(amount_charged),
        })
    }

    #[tracing::instrument(skip(self))]
    async fn query_status(&self, ref_id: &str) -> Result<GatewayStatusReport> {
        let response = self
            .client
            .get(format!("{}/charges/{}", self.base_url, ref_id))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| transport_error(SERVICE, e))?;

        let body = Self::read_body(response).await?;
        let status = body.status.ok_or_else(|| {
            SettlementError::permanent(SERVICE, "malformed response: missing status")
        })?;

        Ok(GatewayStatusReport {
            status,
            external_trx_id: body.trx_id,
            amount_charged: body.amount.map(Money::from_units),
            amount_settled: body.amount_received.map(Money::from_units),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(ref_id: &str, amount: i64) -> ChargeRequest {
        ChargeRequest {
            ref_id: ref_id.to_string(),
            amount: Money::from_units(amount),
            customer_email: "buyer@example.com".to_string(),
            customer_name: "Buyer".to_string(),
        }
    }

    #[tokio::test]
    async fn test_charge_then_status() {
        let gateway = InMemoryPaymentGateway::new();
        gateway.set_fee(Money::from_units(700));

        let charge = gateway.create_charge(&request("PAY-1", 25_000)).await.unwrap();
        assert!(charge.qr_link.is_some());
        assert_eq!(charge.amount_settled.units(), 24_300);

        let report = gateway.query_status("PAY-1").await.unwrap();
        assert_eq!(report.status, "pending");

        gateway.set_status("PAY-1", "paid");
        let report = gateway.query_status("PAY-1").await.unwrap();
        assert_eq!(report.status, "paid");
        assert_eq!(report.amount_charged, Some(Money::from_units(25_000)));
        assert_eq!(gateway.create_calls(), 1);
        assert_eq!(gateway.query_calls(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_is_transient() {
        let gateway = InMemoryPaymentGateway::new();
        gateway.set_unreachable(true);

        let err = gateway.create_charge(&request("PAY-1", 1)).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(gateway.charge_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_ref_is_permanent() {
        let gateway = InMemoryPaymentGateway::new();
        let err = gateway.query_status("missing").await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_duplicate_ref_rejected() {
        let gateway = InMemoryPaymentGateway::new();
        gateway.create_charge(&request("PAY-1", 1)).await.unwrap();
        assert!(gateway.create_charge(&request("PAY-1", 1)).await.is_err());
        assert_eq!(gateway.charge_count(), 1);
    }
}

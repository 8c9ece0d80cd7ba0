//! External collaborators of the pipeline: traits plus in-memory and HTTP
//! implementations.

pub mod gateway;
pub mod invite;
pub mod notifier;
pub mod webhook;

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub use gateway::{
    ChargeRequest, GatewayCharge, GatewayStatusReport, HttpPaymentGateway, InMemoryPaymentGateway,
    PaymentGateway,
};
pub use invite::{
    HttpInviteProvider, InMemoryInviteProvider, InviteProvider, InviteRequest, ScriptedFailure,
};
pub use notifier::{HttpEmailNotifier, InMemoryNotifier, LogNotifier, Notification, Notifier};
pub use webhook::{
    HttpWebhookTransport, InMemoryWebhookTransport, SIGNATURE_HEADER, TIMESTAMP_HEADER,
    WebhookRequest, WebhookResponse, WebhookTransport,
};

use crate::error::SettlementError;

/// Builds the shared reqwest client used by the HTTP implementations.
pub fn http_client(timeout: Duration) -> Result<reqwest::Client, SettlementError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| SettlementError::InvariantViolation(format!("http client: {e}")))
}

/// Maps a transport-level reqwest failure onto the error taxonomy.
pub(crate) fn transport_error(service: &'static str, err: reqwest::Error) -> SettlementError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        SettlementError::transient(service, err.to_string())
    } else {
        SettlementError::permanent(service, err.to_string())
    }
}

/// Maps a non-2xx response onto the error taxonomy: 5xx and 429 are worth
/// retrying, any other status is a rejection.
pub(crate) fn status_error(
    service: &'static str,
    status: reqwest::StatusCode,
    body: &str,
) -> SettlementError {
    let reason = format!("HTTP {}: {}", status.as_u16(), truncate(body, 256));
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        SettlementError::transient(service, reason)
    } else {
        SettlementError::permanent(service, reason)
    }
}

/// Cuts `s` to at most `max` bytes on a char boundary.
pub(crate) fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Locks a test double's state, recovering from a poisoned lock.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

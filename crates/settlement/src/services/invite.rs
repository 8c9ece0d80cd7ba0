//! Invite-type delivery provider.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use common::{OrderItemId, ProductId};
use serde::Serialize;
use serde_json::json;

use super::{lock, status_error, transport_error};
use crate::error::{Result, SettlementError};

const SERVICE: &str = "invite provider";

/// Access grant requested for one order item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InviteRequest {
    pub order_item_id: OrderItemId,
    pub product_id: ProductId,
    /// Buyer-supplied identifier on the provider's platform.
    pub target: String,
    pub quantity: u32,
}

/// Trait for the external account-management API behind INVITE products.
#[async_trait]
pub trait InviteProvider: Send + Sync {
    /// Grants access and returns the provider's response, which is stored
    /// verbatim as the item's delivery data.
    async fn grant_access(&self, request: &InviteRequest) -> Result<serde_json::Value>;
}

#[async_trait]
impl<T: InviteProvider + ?Sized> InviteProvider for Arc<T> {
    async fn grant_access(&self, request: &InviteRequest) -> Result<serde_json::Value> {
        (**self).grant_access(request).await
    }
}

/// Scripted failure for the in-memory provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedFailure {
    Transient,
    Reject,
}

#[derive(Debug, Default)]
struct InMemoryInviteState {
    requests: Vec<InviteRequest>,
    failures: VecDeque<ScriptedFailure>,
}

/// In-memory provider for tests and the default binary.
#[derive(Debug, Clone, Default)]
pub struct InMemoryInviteProvider {
    state: Arc<Mutex<InMemoryInviteState>>,
}

impl InMemoryInviteProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a failure for the next call; queued failures are consumed in order.
    pub fn push_failure(&self, failure: ScriptedFailure) {
        lock(&self.state).failures.push_back(failure);
    }

    /// Every request the provider received, including failed ones.
    pub fn requests(&self) -> Vec<InviteRequest> {
        lock(&self.state).requests.clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.state).requests.len()
    }
}

#[async_trait]
impl InviteProvider for InMemoryInviteProvider {
    async fn grant_access(&self, request: &InviteRequest) -> Result<serde_json::Value> {
        let mut state = lock(&self.state);
        state.requests.push(request.clone());

        match state.failures.pop_front() {
            Some(ScriptedFailure::Transient) => {
                Err(SettlementError::transient(SERVICE, "HTTP 503"))
            }
            Some(ScriptedFailure::Reject) => Err(SettlementError::permanent(
                SERVICE,
                format!("{} cannot be invited", request.target),
            )),
            None => Ok(json!({
                "status": "invited",
                "target": request.target,
                "invite_id": format!("INV-{}", request.order_item_id),
            })),
        }
    }
}

/// Provider client: `POST {base}/invites` with a bearer token.
#[derive(Debug, Clone)]
pub struct HttpInviteProvider {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpInviteProvider {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }
}

#[async_trait]
impl InviteProvider for HttpInviteProvider {
    #[tracing::instrument(skip(self, request), fields(order_item_id = %request.order_item_id))]
    async fn grant_access(&self, request: &InviteRequest) -> Result<serde_json::Value> {
        let response = self
            .client
            .post(format!("{}/invites", self.base_url))
            .bearer_auth(&self.token)
            .json(request)
            .send()
            .await
            .map_err(|e| transport_error(SERVICE, e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| transport_error(SERVICE, e))?;
        if !status.is_success() {
            return Err(status_error(SERVICE, status, &text));
        }

        serde_json::from_str(&text)
            .map_err(|e| SettlementError::permanent(SERVICE, format!("malformed response: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> InviteRequest {
        InviteRequest {
            order_item_id: OrderItemId::new(),
            product_id: ProductId::new("SKU-INV"),
            target: "friend@example.com".to_string(),
            quantity: 1,
        }
    }

    #[tokio::test]
    async fn test_scripted_failures_then_success() {
        let provider = InMemoryInviteProvider::new();
        provider.push_failure(ScriptedFailure::Transient);
        provider.push_failure(ScriptedFailure::Reject);

        let first = provider.grant_access(&request()).await.unwrap_err();
        assert!(first.is_transient());

        let second = provider.grant_access(&request()).await.unwrap_err();
        assert!(!second.is_transient());

        let third = provider.grant_access(&request()).await.unwrap();
        assert_eq!(third["status"], "invited");
        assert_eq!(provider.call_count(), 3);
    }
}

//! Outbound webhook transport.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{lock, transport_error};
use crate::error::{Result, SettlementError};

const SERVICE: &str = "webhook endpoint";

pub const TIMESTAMP_HEADER: &str = "X-Webhook-Timestamp";
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// One signed POST to a subscriber endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookRequest {
    pub url: String,
    pub timestamp: i64,
    pub signature: String,
    pub body: String,
}

/// What the subscriber answered. Any status, including 4xx and 5xx, is a
/// response; only a failure to get one at all is an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookResponse {
    pub status: u16,
    pub body: String,
}

impl WebhookResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Trait for delivering signed webhook payloads.
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn post(&self, request: &WebhookRequest) -> Result<WebhookResponse>;
}

#[async_trait]
impl<T: WebhookTransport + ?Sized> WebhookTransport for Arc<T> {
    async fn post(&self, request: &WebhookRequest) -> Result<WebhookResponse> {
        (**self).post(request).await
    }
}

/// Posts JSON payloads with the timestamp and signature headers.
#[derive(Debug, Clone)]
pub struct HttpWebhookTransport {
    client: reqwest::Client,
}

impl HttpWebhookTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WebhookTransport for HttpWebhookTransport {
    #[tracing::instrument(skip(self, request), fields(url = %request.url))]
    async fn post(&self, request: &WebhookRequest) -> Result<WebhookResponse> {
        let response = self
            .client
            .post(&request.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(TIMESTAMP_HEADER, request.timestamp.to_string())
            .header(SIGNATURE_HEADER, &request.signature)
            .body(request.body.clone())
            .send()
            .await
            .map_err(|e| transport_error(SERVICE, e))?;

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Ok(WebhookResponse { status, body })
    }
}

#[derive(Debug, Default)]
struct InMemoryWebhookState {
    requests: Vec<WebhookRequest>,
    /// Scripted replies; `None` simulates an unreachable endpoint.
    replies: VecDeque<Option<u16>>,
}

/// Records requests and answers with scripted statuses (200 by default).
#[derive(Debug, Clone, Default)]
pub struct InMemoryWebhookTransport {
    state: Arc<Mutex<InMemoryWebhookState>>,
}

impl InMemoryWebhookTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the status code of the next response.
    pub fn push_status(&self, status: u16) {
        lock(&self.state).replies.push_back(Some(status));
    }

    /// Queues a connection failure for the next request.
    pub fn push_unreachable(&self) {
        lock(&self.state).replies.push_back(None);
    }

    pub fn requests(&self) -> Vec<WebhookRequest> {
        lock(&self.state).requests.clone()
    }
}

#[async_trait]
impl WebhookTransport for InMemoryWebhookTransport {
    async fn post(&self, request: &WebhookRequest) -> Result<WebhookResponse> {
        let mut state = lock(&self.state);
        state.requests.push(request.clone());

        match state.replies.pop_front() {
            Some(None) => Err(SettlementError::transient(SERVICE, "connection refused")),
            Some(Some(status)) => Ok(WebhookResponse {
                status,
                body: format!("status {status}"),
            }),
            None => Ok(WebhookResponse {
                status: 200,
                body: "ok".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> WebhookRequest {
        WebhookRequest {
            url: "https://reseller.test/hook".to_string(),
            timestamp: 1_700_000_000,
            signature: "sha256=00".to_string(),
            body: "{}".to_string(),
        }
    }

    #[tokio::test]
    async fn test_scripted_replies() {
        let transport = InMemoryWebhookTransport::new();
        transport.push_status(500);
        transport.push_unreachable();

        let first = transport.post(&request()).await.unwrap();
        assert_eq!(first.status, 500);
        assert!(!first.is_success());

        assert!(transport.post(&request()).await.is_err());

        let third = transport.post(&request()).await.unwrap();
        assert!(third.is_success());
        assert_eq!(transport.requests().len(), 3);
    }
}

//! Notification dispatcher: buyer messages and signed reseller webhooks.

use chrono::Utc;
use common::{OrderId, WebhookDeliveryId};
use domain::{Order, OrderEvent, OrderEventPayload, OrderItem, WebhookDelivery, WebhookEndpoint};
use ledger::WebhookStore;

use crate::error::{Result, SettlementError};
use crate::services::{Notifier, WebhookRequest, WebhookTransport, truncate};
use crate::{signing, templates};

/// Longest response body kept on a delivery row.
const MAX_RESPONSE_BODY: usize = 2048;

/// What a dispatch produced.
#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    /// Whether the buyer message went out.
    pub notified: bool,
    /// One row per webhook attempt made.
    pub deliveries: Vec<WebhookDelivery>,
}

/// Fans order events out to the buyer and to reseller endpoints.
pub struct NotificationDispatcher<L, N, T> {
    ledger: L,
    notifier: N,
    transport: T,
}

impl<L, N, T> NotificationDispatcher<L, N, T>
where
    L: WebhookStore,
    N: Notifier,
    T: WebhookTransport,
{
    pub fn new(ledger: L, notifier: N, transport: T) -> Self {
        Self {
            ledger,
            notifier,
            transport,
        }
    }

    /// Sends `event` for `order` on both channels.
    ///
    /// Neither channel can fail the call: a failed buyer message is logged
    /// and a failed webhook is logged as a delivery row for operators to
    /// retry. Only ledger errors are returned.
    #[tracing::instrument(skip(self, order, items), fields(order_id = %order.id, event = %event))]
    pub async fn dispatch(
        &self,
        event: OrderEvent,
        order: &Order,
        items: &[OrderItem],
    ) -> Result<DispatchReport> {
        let mut report = DispatchReport {
            notified: self.notify(event, order, items).await,
            deliveries: Vec::new(),
        };

        let Some(account_id) = order.account_id else {
            return Ok(report);
        };
        let endpoints = self.ledger.active_endpoints(account_id).await?;
        if endpoints.is_empty() {
            return Ok(report);
        }

        let payload = serde_json::to_string(&OrderEventPayload::new(event, order, items))?;
        for endpoint in &endpoints {
            let delivery = self
                .deliver(endpoint, order.id, event, &payload, None)
                .await?;
            report.deliveries.push(delivery);
        }
        Ok(report)
    }

    /// Replays a failed delivery with a fresh timestamp and signature.
    ///
    /// The original row is left untouched; the replay is logged as a new
    /// row pointing back at it.
    #[tracing::instrument(skip(self))]
    pub async fn retry(&self, delivery_id: WebhookDeliveryId) -> Result<WebhookDelivery> {
        let original = self
            .ledger
            .get_delivery(delivery_id)
            .await?
            .ok_or(SettlementError::DeliveryNotFound(delivery_id))?;
        if original.succeeded() {
            return Err(SettlementError::Validation(format!(
                "delivery {delivery_id} already succeeded"
            )));
        }

        let endpoint = self
            .ledger
            .get_endpoint(original.endpoint_id)
            .await?
            .ok_or(SettlementError::EndpointNotFound(original.endpoint_id))?;

        self.deliver(
            &endpoint,
            original.order_id,
            original.event,
            &original.payload,
            Some(original.id),
        )
        .await
    }

    /// Every delivery attempt logged for an order.
    pub async fn deliveries(&self, order_id: OrderId) -> Result<Vec<WebhookDelivery>> {
        Ok(self.ledger.deliveries_for_order(order_id).await?)
    }

    async fn notify(&self, event: OrderEvent, order: &Order, items: &[OrderItem]) -> bool {
        let message = templates::render(event, order, items);
        match self.notifier.send(&message).await {
            Ok(()) => {
                metrics::counter!("notifications_total", "outcome" => "sent").increment(1);
                true
            }
            Err(e) => {
                metrics::counter!("notifications_total", "outcome" => "failed").increment(1);
                tracing::warn!(to = %message.to, error = %e, "buyer notification failed");
                false
            }
        }
    }

    async fn deliver(
        &self,
        endpoint: &WebhookEndpoint,
        order_id: OrderId,
        event: OrderEvent,
        payload: &str,
        retry_of: Option<WebhookDeliveryId>,
    ) -> Result<WebhookDelivery> {
        let timestamp = Utc::now().timestamp();
        let signature = signing::sign(&endpoint.secret, timestamp, payload);
        let request = WebhookRequest {
            url: endpoint.url.clone(),
            timestamp,
            signature: signature.clone(),
            body: payload.to_string(),
        };

        let result = self.transport.post(&request).await;
        let now = Utc::now();
        let mut delivery = WebhookDelivery {
            id: WebhookDeliveryId::new(),
            endpoint_id: endpoint.id,
            order_id,
            event,
            payload: payload.to_string(),
            timestamp,
            signature,
            response_status: None,
            response_body: None,
            delivered_at: None,
            failed_at: None,
            error: None,
            retry_of,
            created_at: now,
        };

        match result {
            Ok(response) => {
                delivery.response_status = Some(response.status);
                delivery.response_body = Some(truncate(&response.body, MAX_RESPONSE_BODY).to_string());
                if response.is_success() {
                    delivery.delivered_at = Some(now);
                } else {
                    delivery.failed_at = Some(now);
                    delivery.error = Some(format!("HTTP {}", response.status));
                }
            }
            Err(e) => {
                delivery.failed_at = Some(now);
                delivery.error = Some(e.to_string());
            }
        }

        self.ledger.insert_delivery(&delivery).await?;

        if delivery.succeeded() {
            metrics::counter!("webhook_deliveries_total", "outcome" => "delivered").increment(1);
            tracing::info!(endpoint_id = %endpoint.id, "webhook delivered");
        } else {
            metrics::counter!("webhook_deliveries_total", "outcome" => "failed").increment(1);
            tracing::warn!(
                endpoint_id = %endpoint.id,
                error = delivery.error.as_deref().unwrap_or_default(),
                "webhook delivery failed"
            );
        }
        Ok(delivery)
    }
}

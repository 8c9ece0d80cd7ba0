//! Integration tests for the API server.

use std::sync::{Arc, OnceLock};

use axum::body::Body;
use axum::http::{Request, StatusCode};
use domain::StockItem;
use ledger::{InMemoryLedger, StockStore};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::{Value, json};
use settlement::{
    InMemoryInviteProvider, InMemoryNotifier, InMemoryPaymentGateway, InMemoryWebhookTransport,
};
use tower::ServiceExt;

use api::config::Config;
use api::worker::{WorkerConfig, run_tick};
use api::{AppState, Services};

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            builder
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

struct TestApp {
    app: axum::Router,
    state: Arc<AppState<InMemoryLedger>>,
    ledger: InMemoryLedger,
    gateway: InMemoryPaymentGateway,
}

impl TestApp {
    fn new() -> Self {
        let ledger = InMemoryLedger::new();
        let gateway = InMemoryPaymentGateway::new();
        let services = Services {
            gateway: Arc::new(gateway.clone()),
            provider: Arc::new(InMemoryInviteProvider::new()),
            notifier: Arc::new(InMemoryNotifier::new()),
            transport: Arc::new(InMemoryWebhookTransport::new()),
        };
        let state = api::create_state(ledger.clone(), services, &Config::default());
        let app = api::create_app(state.clone(), get_metrics_handle());
        Self {
            app,
            state,
            ledger,
            gateway,
        }
    }

    async fn send(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, json)
    }

    async fn stock(&self, sku: &str, units: usize) {
        let items: Vec<StockItem> = (0..units)
            .map(|i| StockItem::new(sku, format!("{sku}-CODE-{i}")))
            .collect();
        self.ledger.insert_stock(&items).await.unwrap();
    }

    /// Places a one-line stock order and returns its id.
    async fn place(&self, body: Value) -> String {
        let (status, json) = self.send("POST", "/orders", Some(body)).await;
        assert_eq!(status, StatusCode::CREATED, "{json}");
        json["order_id"].as_str().unwrap().to_string()
    }
}

fn order_body(sku: &str, quantity: u32, price: i64) -> Value {
    json!({
        "customer": { "email": "buyer@example.com", "name": "Buyer" },
        "items": [{
            "product_id": sku,
            "product_name": format!("Voucher {sku}"),
            "delivery_type": "STOCK",
            "quantity": quantity,
            "unit_price": price,
        }],
    })
}

#[tokio::test]
async fn test_health_check() {
    let t = TestApp::new();
    let (status, json) = t.send("GET", "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let t = TestApp::new();
    let response = t
        .app
        .clone()
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()["content-type"].to_str().unwrap();
    assert!(content_type.starts_with("text/plain"));
}

#[tokio::test]
async fn test_unknown_route_is_json_404() {
    let t = TestApp::new();
    let (status, json) = t.send("GET", "/nope", None).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(json["error"].as_str().unwrap().contains("/nope"));
}

#[tokio::test]
async fn test_guest_checkout() {
    let t = TestApp::new();
    let mut body = order_body("SKU-1", 2, 15_000);
    body["discount_amount"] = json!(5_000);

    let (status, json) = t.send("POST", "/orders", Some(body)).await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(json["status"], "AWAITING_PAYMENT");
    assert_eq!(json["total_amount"], 25_000);
    assert!(json["guest_token"].as_str().unwrap().starts_with("guest_"));
}

#[tokio::test]
async fn test_invalid_checkout_is_bad_request() {
    let t = TestApp::new();
    let mut body = order_body("SKU-1", 0, 15_000);
    body["customer"]["email"] = json!("not-an-email");

    let (status, json) = t.send("POST", "/orders", Some(body)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].is_string());
}

#[tokio::test]
async fn test_get_order_bad_and_unknown_ids() {
    let t = TestApp::new();

    let (status, _) = t.send("GET", "/orders/not-a-uuid", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let unknown = common::OrderId::new();
    let (status, _) = t.send("GET", &format!("/orders/{unknown}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_pay_and_deliver_through_http() {
    let t = TestApp::new();
    t.stock("SKU-1", 2).await;
    let order_id = t.place(order_body("SKU-1", 1, 25_000)).await;

    let (status, payment) = t
        .send("POST", &format!("/orders/{order_id}/payment"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payment["status"], "PENDING");
    let ref_id = payment["ref_id"].as_str().unwrap().to_string();

    // still pending at the gateway
    let (_, view) = t
        .send("POST", &format!("/orders/{order_id}/payment/reconcile"), None)
        .await;
    assert_eq!(view["status"], "awaiting_payment");

    t.gateway.set_status(&ref_id, "paid");
    let (status, view) = t
        .send("POST", &format!("/orders/{order_id}/payment/reconcile"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["status"], "processing");
    assert!(view["items"][0].get("delivery_data").is_none());

    run_tick(&t.state.coordinator, &WorkerConfig::default()).await;

    let (_, view) = t.send("GET", &format!("/orders/{order_id}"), None).await;
    assert_eq!(view["status"], "delivered");
    assert!(view["items"][0]["delivery_data"].is_object());
}

#[tokio::test]
async fn test_gateway_callback() {
    let t = TestApp::new();
    let order_id = t.place(order_body("SKU-1", 1, 25_000)).await;
    let (_, payment) = t
        .send("POST", &format!("/orders/{order_id}/payment"), None)
        .await;
    let ref_id = payment["ref_id"].as_str().unwrap();
    t.gateway.set_status(ref_id, "paid");

    let (status, json) = t
        .send("POST", "/gateway/callback", Some(json!({ "ref_id": ref_id })))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["order_id"], order_id.as_str());
    assert_eq!(json["status"], "PROCESSING");

    let (status, _) = t
        .send("POST", "/gateway/callback", Some(json!({ "ref_id": "PAY-UNKNOWN" })))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_wallet_top_up_and_payment() {
    let t = TestApp::new();
    let account_id = common::AccountId::new();

    let (status, _) = t
        .send(
            "POST",
            &format!("/operator/wallets/{account_id}/top-up"),
            Some(json!({ "amount": 100, "reference": "BANK-1" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "below the minimum top-up");

    let (status, topup) = t
        .send(
            "POST",
            &format!("/operator/wallets/{account_id}/top-up"),
            Some(json!({ "amount": 50_000, "reference": "BANK-2" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(topup["balance_after"], 50_000);

    let mut body = order_body("SKU-1", 1, 20_000);
    body["account_id"] = json!(account_id.to_string());
    let order_id = t.place(body).await;

    let (status, paid) = t
        .send(
            "POST",
            &format!("/orders/{order_id}/wallet-payment"),
            Some(json!({ "account_id": account_id.to_string() })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(paid["became_paid"], true);
    assert_eq!(paid["transaction"]["kind"], "PURCHASE");
    assert_eq!(paid["transaction"]["balance_after"], 30_000);
}

#[tokio::test]
async fn test_operator_cancel_checks_observed_status() {
    let t = TestApp::new();
    let order_id = t.place(order_body("SKU-1", 1, 25_000)).await;
    let uri = format!("/operator/orders/{order_id}/cancel");

    let (status, _) = t
        .send("POST", &uri, Some(json!({ "observed_status": "PROCESSING" })))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, json) = t
        .send("POST", &uri, Some(json!({ "observed_status": "AWAITING_PAYMENT" })))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "CANCELLED");

    let (_, view) = t.send("GET", &format!("/orders/{order_id}"), None).await;
    assert_eq!(view["status"], "cancelled");
}

#[tokio::test]
async fn test_operator_lists_and_retries() {
    let t = TestApp::new();

    let (status, jobs) = t.send("GET", "/operator/jobs/failed?limit=10", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(jobs, json!([]));

    let unknown = common::WebhookDeliveryId::new();
    let (status, _) = t
        .send(
            "POST",
            &format!("/operator/webhook-deliveries/{unknown}/retry"),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

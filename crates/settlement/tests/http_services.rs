//! HTTP service clients against in-process axum servers.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use common::{OrderItemId, ProductId};
use domain::Money;
use serde_json::{Value, json};
use settlement::services::{
    ChargeRequest, InviteRequest, Notification, SIGNATURE_HEADER, TIMESTAMP_HEADER,
    WebhookRequest, http_client,
};
use settlement::{
    HttpEmailNotifier, HttpInviteProvider, HttpPaymentGateway, HttpWebhookTransport,
    InviteProvider, Notifier, PaymentGateway, WebhookTransport, signing,
};

#[derive(Clone, Default)]
struct Recorder {
    bodies: Arc<Mutex<Vec<Value>>>,
    headers: Arc<Mutex<Vec<HeaderMap>>>,
}

impl Recorder {
    fn push(&self, headers: HeaderMap, body: Value) {
        self.headers.lock().unwrap().push(headers);
        self.bodies.lock().unwrap().push(body);
    }

    fn bodies(&self) -> Vec<Value> {
        self.bodies.lock().unwrap().clone()
    }

    fn headers(&self) -> Vec<HeaderMap> {
        self.headers.lock().unwrap().clone()
    }
}

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn client() -> reqwest::Client {
    http_client(Duration::from_secs(5)).unwrap()
}

fn charge_request() -> ChargeRequest {
    ChargeRequest {
        ref_id: "PAY-ABC".to_string(),
        amount: Money::from_units(25_000),
        customer_email: "buyer@example.com".to_string(),
        customer_name: "Buyer".to_string(),
    }
}

fn gateway_app(recorder: Recorder) -> Router {
    Router::new()
        .route(
            "/charges",
            post(
                |State(rec): State<Recorder>, headers: HeaderMap, Json(body): Json<Value>| async move {
                    rec.push(headers, body.clone());
                    Json(json!({
                        "trx_id": "TRX-9",
                        "qr_link": format!("https://qr.test/{}", body["ref_id"].as_str().unwrap()),
                        "expired_at": "2030-01-01T00:00:00Z",
                        "amount": body["amount"],
                        "amount_received": body["amount"].as_i64().unwrap() - 700,
                    }))
                },
            ),
        )
        .route(
            "/charges/{ref_id}",
            get(|Path(ref_id): Path<String>| async move {
                match ref_id.as_str() {
                    "PAY-ABC" => (
                        StatusCode::OK,
                        Json(json!({
                            "status": "PAID",
                            "trx_id": "TRX-9",
                            "amount": 25_000,
                            "amount_received": 24_300,
                        })),
                    ),
                    "PAY-BROKEN" => (StatusCode::OK, Json(json!({ "trx_id": "TRX-0" }))),
                    "PAY-DOWN" => (
                        StatusCode::BAD_GATEWAY,
                        Json(json!({ "error": "upstream" })),
                    ),
                    _ => (StatusCode::NOT_FOUND, Json(json!({ "error": "unknown" }))),
                }
            }),
        )
        .with_state(recorder)
}

#[tokio::test]
async fn test_gateway_charge_and_status() {
    let recorder = Recorder::default();
    let base = serve(gateway_app(recorder.clone())).await;
    let gateway = HttpPaymentGateway::new(client(), format!("{base}/"), "key_123");

    let charge = gateway.create_charge(&charge_request()).await.unwrap();
    assert_eq!(charge.external_trx_id.as_deref(), Some("TRX-9"));
    assert_eq!(charge.qr_link.as_deref(), Some("https://qr.test/PAY-ABC"));
    assert_eq!(charge.amount_settled.units(), 24_300);
    assert!(charge.expires_at.is_some());

    let sent = recorder.bodies().remove(0);
    assert_eq!(sent["ref_id"], "PAY-ABC");
    assert_eq!(sent["amount"], 25_000);
    let auth = recorder.headers()[0]["authorization"].to_str().unwrap().to_string();
    assert_eq!(auth, "Bearer key_123");

    let report = gateway.query_status("PAY-ABC").await.unwrap();
    assert_eq!(report.status, "PAID");
    assert_eq!(report.amount_charged, Some(Money::from_units(25_000)));
    assert_eq!(report.amount_settled, Some(Money::from_units(24_300)));
}

#[tokio::test]
async fn test_gateway_error_classification() {
    let base = serve(gateway_app(Recorder::default())).await;
    let gateway = HttpPaymentGateway::new(client(), base, "key");

    let missing_status = gateway.query_status("PAY-BROKEN").await.unwrap_err();
    assert!(!missing_status.is_transient());

    let upstream = gateway.query_status("PAY-DOWN").await.unwrap_err();
    assert!(upstream.is_transient());

    let unknown = gateway.query_status("PAY-NOPE").await.unwrap_err();
    assert!(!unknown.is_transient());
}

#[tokio::test]
async fn test_gateway_unreachable_is_transient() {
    // bind then drop to get a port nobody listens on
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let gateway = HttpPaymentGateway::new(client(), format!("http://{addr}"), "key");
    let err = gateway.create_charge(&charge_request()).await.unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_invite_provider_response_returned_verbatim() {
    let recorder = Recorder::default();
    let app = Router::new()
        .route(
            "/invites",
            post(
                |State(rec): State<Recorder>, headers: HeaderMap, Json(body): Json<Value>| async move {
                    rec.push(headers, body.clone());
                    if body["target"] == "blocked@example.com" {
                        return (
                            StatusCode::UNPROCESSABLE_ENTITY,
                            Json(json!({ "error": "blocked" })),
                        );
                    }
                    (
                        StatusCode::OK,
                        Json(json!({ "status": "invited", "seat": 7, "target": body["target"] })),
                    )
                },
            ),
        )
        .with_state(recorder.clone());
    let base = serve(app).await;
    let provider = HttpInviteProvider::new(client(), base, "tok");

    let mut request = InviteRequest {
        order_item_id: OrderItemId::new(),
        product_id: ProductId::new("TEAM-SEAT"),
        target: "member@example.com".to_string(),
        quantity: 1,
    };
    let response = provider.grant_access(&request).await.unwrap();
    assert_eq!(
        response,
        json!({ "status": "invited", "seat": 7, "target": "member@example.com" })
    );
    assert_eq!(recorder.bodies()[0]["product_id"], "TEAM-SEAT");

    request.target = "blocked@example.com".to_string();
    let err = provider.grant_access(&request).await.unwrap_err();
    assert!(!err.is_transient());
}

#[tokio::test]
async fn test_email_notifier_posts_message() {
    let recorder = Recorder::default();
    let app = Router::new()
        .route(
            "/send",
            post(
                |State(rec): State<Recorder>, headers: HeaderMap, Json(body): Json<Value>| async move {
                    rec.push(headers, body);
                    StatusCode::ACCEPTED
                },
            ),
        )
        .route("/down", post(|| async { StatusCode::SERVICE_UNAVAILABLE }))
        .with_state(recorder.clone());
    let base = serve(app).await;

    let message = Notification {
        to: "buyer@example.com".to_string(),
        subject: "Payment received".to_string(),
        body: "Hi".to_string(),
    };
    let notifier =
        HttpEmailNotifier::new(client(), format!("{base}/send"), "mail_key", "shop@example.com");
    notifier.send(&message).await.unwrap();

    let sent = recorder.bodies().remove(0);
    assert_eq!(sent["from"], "shop@example.com");
    assert_eq!(sent["to"], "buyer@example.com");
    assert_eq!(sent["subject"], "Payment received");

    let down =
        HttpEmailNotifier::new(client(), format!("{base}/down"), "mail_key", "shop@example.com");
    assert!(down.send(&message).await.unwrap_err().is_transient());
}

#[tokio::test]
async fn test_webhook_transport_sends_signed_request() {
    let recorder = Recorder::default();
    let app = Router::new()
        .route(
            "/hook",
            post(
                |State(rec): State<Recorder>, headers: HeaderMap, body: String| async move {
                    rec.push(headers, Value::String(body));
                    (StatusCode::INTERNAL_SERVER_ERROR, "try later")
                },
            ),
        )
        .with_state(recorder.clone());
    let base = serve(app).await;

    let payload = r#"{"event":"order.paid"}"#;
    let timestamp = 1_700_000_000;
    let request = WebhookRequest {
        url: format!("{base}/hook"),
        timestamp,
        signature: signing::sign("whsec_x", timestamp, payload),
        body: payload.to_string(),
    };

    // a non-2xx answer is a response, not an error
    let response = HttpWebhookTransport::new(client())
        .post(&request)
        .await
        .unwrap();
    assert_eq!(response.status, 500);
    assert_eq!(response.body, "try later");
    assert!(!response.is_success());

    let headers = recorder.headers().remove(0);
    let received_ts: i64 = headers[TIMESTAMP_HEADER].to_str().unwrap().parse().unwrap();
    let received_sig = headers[SIGNATURE_HEADER].to_str().unwrap();
    let received_body = recorder.bodies().remove(0);
    assert!(signing::verify(
        "whsec_x",
        received_ts,
        received_body.as_str().unwrap(),
        received_sig
    ));
}

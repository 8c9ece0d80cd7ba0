//! HTTP API server for the order settlement pipeline.
//!
//! Exposes checkout, payment and order views to buyers, the gateway push
//! callback, and a small operator surface, with structured logging
//! (tracing) and Prometheus metrics. A background worker drives
//! fulfillment and recovery.

pub mod config;
pub mod error;
pub mod routes;
pub mod worker;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use ledger::LedgerStore;
use metrics_exporter_prometheus::PrometheusHandle;
use settlement::services::http_client;
use settlement::{
    CoordinatorConfig, HttpEmailNotifier, HttpInviteProvider, HttpPaymentGateway,
    HttpWebhookTransport, InMemoryInviteProvider, InMemoryPaymentGateway, InviteProvider,
    LogNotifier, Notifier, PaymentGateway, SettlementCoordinator, SettlementError,
    WebhookTransport,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::Config;

/// The coordinator as the server runs it: external services picked at
/// start-up from configuration.
pub type Coordinator<L> = SettlementCoordinator<
    L,
    Arc<dyn PaymentGateway>,
    Arc<dyn InviteProvider>,
    Arc<dyn Notifier>,
    Arc<dyn WebhookTransport>,
>;

/// Shared application state.
pub struct AppState<L: LedgerStore> {
    pub coordinator: Arc<Coordinator<L>>,
}

/// External service implementations chosen for this process.
#[derive(Clone)]
pub struct Services {
    pub gateway: Arc<dyn PaymentGateway>,
    pub provider: Arc<dyn InviteProvider>,
    pub notifier: Arc<dyn Notifier>,
    pub transport: Arc<dyn WebhookTransport>,
}

impl Services {
    /// HTTP clients for every configured service; an unconfigured gateway
    /// or invite provider falls back to its in-memory double, and mail
    /// without a mail API is only logged.
    pub fn from_config(config: &Config) -> Result<Self, SettlementError> {
        let client = http_client(config.http_timeout)?;

        let gateway: Arc<dyn PaymentGateway> = match &config.gateway_base_url {
            Some(url) => Arc::new(HttpPaymentGateway::new(
                client.clone(),
                url.clone(),
                config.gateway_api_key.clone(),
            )),
            None => {
                tracing::warn!("GATEWAY_BASE_URL not set, using in-memory payment gateway");
                Arc::new(InMemoryPaymentGateway::new())
            }
        };

        let provider: Arc<dyn InviteProvider> = match &config.invite_provider_url {
            Some(url) => Arc::new(HttpInviteProvider::new(
                client.clone(),
                url.clone(),
                config.invite_provider_token.clone(),
            )),
            None => {
                tracing::warn!("INVITE_PROVIDER_URL not set, using in-memory invite provider");
                Arc::new(InMemoryInviteProvider::new())
            }
        };

        let notifier: Arc<dyn Notifier> = match &config.mail_api_url {
            Some(url) => Arc::new(HttpEmailNotifier::new(
                client.clone(),
                url.clone(),
                config.mail_api_key.clone(),
                config.mail_from.clone(),
            )),
            None => Arc::new(LogNotifier),
        };

        Ok(Self {
            gateway,
            provider,
            notifier,
            transport: Arc::new(HttpWebhookTransport::new(client)),
        })
    }
}

/// Builds the coordinator and wraps it in application state.
pub fn create_state<L: LedgerStore>(
    ledger: L,
    services: Services,
    config: &Config,
) -> Arc<AppState<L>> {
    let coordinator = SettlementCoordinator::new(
        ledger,
        services.gateway,
        services.provider,
        services.notifier,
        services.transport,
        CoordinatorConfig {
            settings_refresh: config.settings_refresh,
            ..CoordinatorConfig::default()
        },
    );
    Arc::new(AppState {
        coordinator: Arc::new(coordinator),
    })
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<L: LedgerStore>(
    state: Arc<AppState<L>>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/orders", post(routes::orders::create::<L>))
        .route("/orders/{id}", get(routes::orders::get::<L>))
        .route("/orders/{id}/payment", post(routes::payments::open::<L>))
        .route(
            "/orders/{id}/payment/reconcile",
            post(routes::payments::reconcile::<L>),
        )
        .route(
            "/orders/{id}/wallet-payment",
            post(routes::payments::pay_with_wallet::<L>),
        )
        .route("/gateway/callback", post(routes::payments::callback::<L>))
        .route(
            "/operator/orders/{id}/cancel",
            post(routes::operator::cancel::<L>),
        )
        .route(
            "/operator/orders/{id}/webhook-deliveries",
            get(routes::operator::webhook_deliveries::<L>),
        )
        .route("/operator/jobs/failed", get(routes::operator::failed_jobs::<L>))
        .route(
            "/operator/webhook-deliveries/{id}/retry",
            post(routes::operator::retry_webhook::<L>),
        )
        .route(
            "/operator/wallets/{account_id}/top-up",
            post(routes::operator::top_up::<L>),
        )
        .with_state(state)
        .merge(metrics_router)
        .fallback(routes::not_found)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

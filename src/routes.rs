use axum::{routing::{get, post}, Extension, Router};

use crate::billing::{self, BillingEngine};
use crate::webhooks::{self, WebhookSecret};

pub async fn root() -> &'static str {
    "Entitlement Engine API"
}

pub async fn healthz() -> &'static str {
    "ok"
}

pub fn api_routes() -> Router {
    Router::new()
        .route("/", get(root))
        .route("/healthz", get(healthz))
        .merge(billing::api::routes())
        .route(
            "/api/billing/webhooks/payment-processor",
            post(webhooks::payment_processor_webhook),
        )
}

/// Router with the engine and webhook secret attached; `main` adds metrics.
pub fn app(engine: BillingEngine, secret: WebhookSecret) -> Router {
    api_routes()
        .layer(Extension(engine))
        .layer(Extension(secret))
}

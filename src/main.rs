use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::routing::get;
use axum_prometheus::PrometheusMetricLayer;
use entitlement_engine::billing::{self, BillingEngine, EngineSettings, PlanCatalog};
use entitlement_engine::{config, routes, webhooks::WebhookSecret};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    let catalog = match config::PLAN_CATALOG_PATH.as_deref() {
        Some(path) => PlanCatalog::from_path(path)
            .with_context(|| format!("loading plan catalog from {path}"))?,
        None => PlanCatalog::default(),
    };
    let catalog = Arc::new(catalog);
    let settings = EngineSettings {
        period: *config::BILLING_CYCLE_PERIOD,
        retry: config::billing_retry_policy(),
    };

    let engine = match config::DATABASE_URL.as_deref() {
        Some(db_url) => {
            let pool = PgPoolOptions::new()
                .max_connections(5)
                .connect(db_url)
                .await
                .context("connecting to Postgres")?;

            // Run migrations if available
            if let Err(error) = sqlx::migrate!().run(&pool).await {
                if *config::ALLOW_MIGRATION_FAILURE {
                    tracing::warn!(
                        ?error,
                        "Database migrations failed but continuing due to ALLOW_MIGRATION_FAILURE"
                    );
                } else {
                    return Err(error.into());
                }
            }
            BillingEngine::postgres(pool, catalog.clone(), settings)
        }
        None => {
            tracing::warn!("DATABASE_URL not set; billing state is kept in memory");
            BillingEngine::in_memory(catalog.clone(), settings)
        }
    };
    tracing::info!(
        plans = catalog.list().len(),
        period = settings.period.as_str(),
        "billing engine ready"
    );

    billing::spawn_cycle_scheduler(
        engine.scheduler().clone(),
        Duration::from_secs(*config::BILLING_ROLLOVER_SCAN_INTERVAL_SECS),
        *config::BILLING_ROLLOVER_BATCH_SIZE,
    );

    let secret = WebhookSecret::new(config::BILLING_WEBHOOK_SECRET.clone());
    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    let app = routes::app(engine, secret)
        .route(
            "/metrics",
            get(move || async move { metrics_handle.render() }),
        )
        .layer(prometheus_layer);

    let addr: SocketAddr = format!("{}:{}", config::BIND_ADDRESS.as_str(), *config::BIND_PORT)
        .parse()
        .context("parsing bind address")?;
    tracing::info!(%addr, "Listening for incoming connections");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}

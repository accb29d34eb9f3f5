use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

use super::{
    BillingEngine, CycleWindow, Decision, Plan, PlanChange, Subscription, TenantId, UsageSnapshot,
};

/// key: billing-api -> rest endpoints
pub fn routes() -> Router {
    Router::new()
        .route("/api/billing/plans", get(list_plans))
        .route(
            "/api/billing/tenants/:tenant_id/subscription",
            get(get_subscription).post(provision_subscription),
        )
        .route("/api/billing/tenants/:tenant_id/usage", get(get_usage))
        .route(
            "/api/billing/tenants/:tenant_id/usage/:metric",
            get(peek_usage),
        )
        .route("/api/billing/tenants/:tenant_id/consume", post(consume))
        .route("/api/billing/tenants/:tenant_id/plan", post(change_plan))
        .route("/api/billing/tenants/:tenant_id/cancel", post(cancel))
        .route(
            "/api/billing/tenants/:tenant_id/reactivate",
            post(reactivate),
        )
}

pub async fn list_plans(Extension(engine): Extension<BillingEngine>) -> Json<Vec<Plan>> {
    Json(engine.catalog().list())
}

pub async fn get_subscription(
    Extension(engine): Extension<BillingEngine>,
    Path(tenant_id): Path<TenantId>,
) -> AppResult<Json<SubscriptionEnvelope>> {
    let subscription = engine.subscriptions().get(tenant_id).await?;
    Ok(Json(envelope(&engine, subscription, Utc::now())?))
}

pub async fn provision_subscription(
    Extension(engine): Extension<BillingEngine>,
    Path(tenant_id): Path<TenantId>,
    Json(payload): Json<ProvisionRequest>,
) -> AppResult<(StatusCode, Json<SubscriptionEnvelope>)> {
    let now = Utc::now();
    let anchor = payload.cycle_anchor.unwrap_or(now);
    let subscription = engine
        .subscriptions()
        .provision(tenant_id, &payload.plan_id, anchor, now)
        .await?;
    Ok((StatusCode::CREATED, Json(envelope(&engine, subscription, now)?)))
}

pub async fn get_usage(
    Extension(engine): Extension<BillingEngine>,
    Path(tenant_id): Path<TenantId>,
) -> AppResult<Json<Vec<UsageSnapshot>>> {
    let usage = engine.entitlements().usage(tenant_id, Utc::now()).await?;
    Ok(Json(usage))
}

pub async fn peek_usage(
    Extension(engine): Extension<BillingEngine>,
    Path((tenant_id, metric)): Path<(TenantId, String)>,
) -> AppResult<Json<UsageSnapshot>> {
    let snapshot = engine
        .entitlements()
        .peek(tenant_id, &metric, Utc::now())
        .await?;
    Ok(Json(snapshot))
}

pub async fn consume(
    Extension(engine): Extension<BillingEngine>,
    Path(tenant_id): Path<TenantId>,
    Json(payload): Json<ConsumeRequest>,
) -> AppResult<Json<Decision>> {
    if payload.metric.trim().is_empty() {
        return Err(AppError::BadRequest("metric must not be empty".to_string()));
    }
    let decision = engine
        .entitlements()
        .check_and_consume(tenant_id, &payload.metric, payload.amount)
        .await?;
    Ok(Json(decision))
}

pub async fn change_plan(
    Extension(engine): Extension<BillingEngine>,
    Path(tenant_id): Path<TenantId>,
    Json(payload): Json<PlanChangeRequest>,
) -> AppResult<Json<PlanChangeEnvelope>> {
    let now = Utc::now();
    let change = engine
        .plan_changes()
        .request_change(tenant_id, &payload.plan_id, now)
        .await?;
    plan_change_envelope(&engine, change, now).await
}

pub async fn cancel(
    Extension(engine): Extension<BillingEngine>,
    Path(tenant_id): Path<TenantId>,
) -> AppResult<Json<PlanChangeEnvelope>> {
    let now = Utc::now();
    let change = engine.plan_changes().cancel(tenant_id, now).await?;
    plan_change_envelope(&engine, change, now).await
}

pub async fn reactivate(
    Extension(engine): Extension<BillingEngine>,
    Path(tenant_id): Path<TenantId>,
    Json(payload): Json<ReactivateRequest>,
) -> AppResult<Json<PlanChangeEnvelope>> {
    let now = Utc::now();
    let plan_id = match payload.plan_id {
        Some(plan_id) => plan_id,
        None => engine.subscriptions().get(tenant_id).await?.plan_id,
    };
    let change = engine
        .plan_changes()
        .reactivate(tenant_id, &plan_id, now)
        .await?;
    plan_change_envelope(&engine, change, now).await
}

fn envelope(
    engine: &BillingEngine,
    subscription: Subscription,
    now: DateTime<Utc>,
) -> AppResult<SubscriptionEnvelope> {
    let plan = engine.subscriptions().plan(&subscription.plan_id)?.clone();
    let cycle = engine.scheduler().window_for(&subscription, now);
    Ok(SubscriptionEnvelope {
        subscription,
        plan,
        cycle,
    })
}

async fn plan_change_envelope(
    engine: &BillingEngine,
    change: PlanChange,
    now: DateTime<Utc>,
) -> AppResult<Json<PlanChangeEnvelope>> {
    let subscription = engine.subscriptions().get(change.tenant_id).await?;
    Ok(Json(PlanChangeEnvelope {
        change,
        subscription: envelope(engine, subscription, now)?,
    }))
}

#[derive(Debug, Serialize)]
pub struct SubscriptionEnvelope {
    pub subscription: Subscription,
    pub plan: Plan,
    pub cycle: CycleWindow,
}

#[derive(Debug, Serialize)]
pub struct PlanChangeEnvelope {
    pub change: PlanChange,
    pub subscription: SubscriptionEnvelope,
}

#[derive(Debug, Deserialize)]
pub struct ProvisionRequest {
    pub plan_id: String,
    #[serde(default)]
    pub cycle_anchor: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct ConsumeRequest {
    pub metric: String,
    #[serde(default = "default_amount")]
    pub amount: i64,
}

fn default_amount() -> i64 {
    1
}

#[derive(Debug, Deserialize)]
pub struct PlanChangeRequest {
    pub plan_id: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReactivateRequest {
    #[serde(default)]
    pub plan_id: Option<String>,
}

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use entitlement_engine::billing::{BillingEngine, EngineSettings, PlanCatalog};
use entitlement_engine::webhooks::{sign, WebhookSecret, SIGNATURE_HEADER};
use serde_json::{json, Value};
use tower::ServiceExt; // for `oneshot`
use uuid::Uuid;

const SECRET: &str = "whsec_test";

fn app() -> Router {
    let engine = BillingEngine::in_memory(Arc::new(PlanCatalog::default()), EngineSettings::default());
    entitlement_engine::app(engine, WebhookSecret::new(Some(SECRET.to_string())))
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap_or_else(|_| Value::String(
            String::from_utf8_lossy(&body).into_owned(),
        ))
    };
    (status, value)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn webhook(body: &Value, signature: Option<String>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/api/billing/webhooks/payment-processor")
        .header("content-type", "application/json");
    if let Some(signature) = signature {
        builder = builder.header(SIGNATURE_HEADER, signature);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn provision(app: &Router, plan: &str) -> Uuid {
    let tenant = Uuid::new_v4();
    let (status, body) = send(
        app,
        post_json(
            &format!("/api/billing/tenants/{tenant}/subscription"),
            json!({ "plan_id": plan }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    tenant
}

async fn consume(app: &Router, tenant: Uuid, metric: &str, amount: i64) -> (StatusCode, Value) {
    send(
        app,
        post_json(
            &format!("/api/billing/tenants/{tenant}/consume"),
            json!({ "metric": metric, "amount": amount }),
        ),
    )
    .await
}

#[tokio::test]
async fn root_and_health_respond_ok() {
    let app = app();
    let response = app.clone().oneshot(get("/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    assert_eq!(body, "Entitlement Engine API".as_bytes());

    let (status, _) = send(&app, get("/healthz")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn plans_are_listed_by_price() {
    let app = app();
    let (status, body) = send(&app, get("/api/billing/plans")).await;
    assert_eq!(status, StatusCode::OK);
    let ids: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|plan| plan["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["free", "pro", "agency"]);
    assert_eq!(body[2]["quotas"]["sites"], Value::Null);
}

#[tokio::test]
async fn subscription_lifecycle_status_codes() {
    let app = app();
    let tenant = provision(&app, "free").await;

    let (status, body) = send(&app, get(&format!("/api/billing/tenants/{tenant}/subscription"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["subscription"]["plan_id"], "free");
    assert_eq!(body["subscription"]["status"], "active");
    assert_eq!(body["plan"]["quotas"]["fixes"], 500);

    let (status, _) = send(
        &app,
        post_json(
            &format!("/api/billing/tenants/{tenant}/subscription"),
            json!({ "plan_id": "pro" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = send(
        &app,
        post_json(
            &format!("/api/billing/tenants/{}/subscription", Uuid::new_v4()),
            json!({ "plan_id": "enterprise" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, body) = send(
        &app,
        get(&format!("/api/billing/tenants/{}/subscription", Uuid::new_v4())),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("no subscription"));
}

#[tokio::test]
async fn quota_denial_is_a_successful_response() {
    let app = app();
    let tenant = provision(&app, "free").await;

    for _ in 0..3 {
        let (status, body) = consume(&app, tenant, "sites", 1).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "allowed");
    }
    let (status, body) = consume(&app, tenant, "sites", 1).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "denied");
    assert_eq!(body["reason"], "quota_exceeded");
    assert_eq!(body["remaining"], 0);
    assert_eq!(body["usage"]["consumed"], 3);

    let (status, _) = consume(&app, tenant, "sites", -1).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(&app, get(&format!("/api/billing/tenants/{tenant}/usage"))).await;
    assert_eq!(status, StatusCode::OK);
    let sites = body
        .as_array()
        .unwrap()
        .iter()
        .find(|snapshot| snapshot["metric"] == "sites")
        .unwrap();
    assert_eq!(sites["consumed"], 3);
    assert_eq!(sites["limit"], 3);

    let (status, body) = send(
        &app,
        get(&format!("/api/billing/tenants/{tenant}/usage/fixes")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["remaining"], 500);
}

#[tokio::test]
async fn plan_change_cancel_and_reactivate() {
    let app = app();
    let tenant = provision(&app, "free").await;

    let (status, body) = send(
        &app,
        post_json(
            &format!("/api/billing/tenants/{tenant}/plan"),
            json!({ "plan_id": "pro" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["change"]["kind"], "upgrade");
    assert_eq!(body["change"]["state"], "applied");
    assert_eq!(body["subscription"]["plan"]["id"], "pro");

    let (status, body) = send(
        &app,
        post_json(
            &format!("/api/billing/tenants/{tenant}/plan"),
            json!({ "plan_id": "free" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["change"]["kind"], "downgrade");
    assert_eq!(body["change"]["state"], "pending_effective_date");
    assert_eq!(
        body["subscription"]["subscription"]["pending_change"]["plan_id"],
        "free"
    );

    let (status, _) = send(
        &app,
        post_json(&format!("/api/billing/tenants/{tenant}/cancel"), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = consume(&app, tenant, "fixes", 1).await;
    assert_eq!(body["reason"], "subscription_inactive");

    let (status, _) = send(
        &app,
        post_json(
            &format!("/api/billing/tenants/{tenant}/plan"),
            json!({ "plan_id": "agency" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = send(
        &app,
        post_json(
            &format!("/api/billing/tenants/{tenant}/reactivate"),
            json!({}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["change"]["kind"], "reactivation");
    assert_eq!(body["subscription"]["subscription"]["status"], "active");
    let (_, body) = consume(&app, tenant, "fixes", 1).await;
    assert_eq!(body["outcome"], "allowed");
}

#[tokio::test]
async fn webhook_requires_valid_signature() {
    let app = app();
    let tenant = provision(&app, "pro").await;
    let event = json!({ "type": "invoice.payment_failed", "tenant_id": tenant });

    let (status, _) = send(&app, webhook(&event, None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let forged = sign("not-the-secret", event.to_string().as_bytes());
    let (status, _) = send(&app, webhook(&event, Some(forged))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (_, body) = consume(&app, tenant, "sites", 1).await;
    assert_eq!(body["outcome"], "allowed");
}

#[tokio::test]
async fn webhook_events_drive_subscription_status() {
    let app = app();
    let tenant = provision(&app, "pro").await;
    let signed = |event: &Value| webhook(event, Some(sign(SECRET, event.to_string().as_bytes())));

    let failed = json!({ "type": "invoice.payment_failed", "tenant_id": tenant });
    let (status, _) = send(&app, signed(&failed)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let (_, body) = consume(&app, tenant, "sites", 1).await;
    assert_eq!(body["reason"], "subscription_inactive");

    let paid = json!({ "type": "invoice.paid", "tenant_id": tenant });
    let (status, _) = send(&app, signed(&paid)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let (_, body) = consume(&app, tenant, "sites", 1).await;
    assert_eq!(body["outcome"], "allowed");

    let updated = json!({ "type": "subscription.updated", "tenant_id": tenant, "plan_id": "agency" });
    let (status, _) = send(&app, signed(&updated)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let (_, body) = send(&app, get(&format!("/api/billing/tenants/{tenant}/subscription"))).await;
    assert_eq!(body["plan"]["id"], "agency");

    let canceled = json!({ "type": "subscription.canceled", "tenant_id": tenant });
    let (status, _) = send(&app, signed(&canceled)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let (_, body) = send(&app, get(&format!("/api/billing/tenants/{tenant}/subscription"))).await;
    assert_eq!(body["subscription"]["status"], "canceled");

    let ignored = json!({ "type": "customer.created", "tenant_id": tenant });
    let (status, _) = send(&app, signed(&ignored)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
}

#[tokio::test]
async fn webhook_rejected_without_configured_secret() {
    let engine = BillingEngine::in_memory(Arc::new(PlanCatalog::default()), EngineSettings::default());
    let app = entitlement_engine::app(engine, WebhookSecret::default());
    let event = json!({ "type": "invoice.paid", "tenant_id": Uuid::new_v4() });
    let (status, _) = send(&app, webhook(&event, Some(sign(SECRET, event.to_string().as_bytes())))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

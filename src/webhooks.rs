use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::Extension,
    http::{HeaderMap, StatusCode},
};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{info, warn};

use crate::billing::{BillingEngine, TenantId};
use crate::error::{AppError, AppResult};

pub const SIGNATURE_HEADER: &str = "x-billing-signature";

type HmacSha256 = Hmac<Sha256>;

/// Shared secret used to verify processor signatures. `None` rejects every call.
#[derive(Clone, Default)]
pub struct WebhookSecret(pub Option<Arc<str>>);

impl WebhookSecret {
    pub fn new(secret: Option<String>) -> Self {
        Self(secret.map(Arc::from))
    }
}

/// key: webhooks-billing -> payment processor confirmations
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ProcessorEvent {
    #[serde(rename = "subscription.updated")]
    SubscriptionUpdated { tenant_id: TenantId, plan_id: String },
    #[serde(rename = "subscription.canceled")]
    SubscriptionCanceled { tenant_id: TenantId },
    #[serde(rename = "invoice.payment_failed")]
    PaymentFailed { tenant_id: TenantId },
    #[serde(rename = "invoice.paid")]
    InvoicePaid { tenant_id: TenantId },
    #[serde(other)]
    Unknown,
}

pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Checks a `sha256=<hex>` header value against the body in constant time.
pub fn verify_signature(secret: &str, body: &[u8], header: &str) -> bool {
    let Some(encoded) = header.trim().strip_prefix("sha256=") else {
        return false;
    };
    let Ok(signature) = hex::decode(encoded) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature).is_ok()
}

pub async fn payment_processor_webhook(
    Extension(engine): Extension<BillingEngine>,
    Extension(secret): Extension<WebhookSecret>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<StatusCode> {
    let Some(secret) = secret.0.as_deref() else {
        warn!("payment processor webhook received but BILLING_WEBHOOK_SECRET is unset");
        return Err(AppError::Unauthorized);
    };
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| AppError::BadRequest("missing signature".into()))?;
    if !verify_signature(secret, &body, signature) {
        warn!("payment processor webhook signature mismatch");
        return Err(AppError::Unauthorized);
    }

    let event: ProcessorEvent = serde_json::from_slice(&body)
        .map_err(|err| AppError::BadRequest(format!("invalid event payload: {err}")))?;
    let now = Utc::now();
    let plan_changes = engine.plan_changes();
    match event {
        ProcessorEvent::SubscriptionUpdated { tenant_id, plan_id } => {
            let subscription = engine.subscriptions().get(tenant_id).await?;
            if subscription.is_entitled() {
                plan_changes.request_change(tenant_id, &plan_id, now).await?;
            } else {
                plan_changes.reactivate(tenant_id, &plan_id, now).await?;
            }
        }
        ProcessorEvent::SubscriptionCanceled { tenant_id } => {
            plan_changes.cancel(tenant_id, now).await?;
        }
        ProcessorEvent::PaymentFailed { tenant_id } => {
            plan_changes.mark_past_due(tenant_id, now).await?;
        }
        ProcessorEvent::InvoicePaid { tenant_id } => {
            plan_changes.mark_paid(tenant_id, now).await?;
        }
        ProcessorEvent::Unknown => {
            info!("ignoring unhandled payment processor event");
        }
    }
    Ok(StatusCode::ACCEPTED)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signatures_round_trip() {
        let body = br#"{"type":"invoice.paid"}"#;
        let header = sign("topsecret", body);
        assert!(header.starts_with("sha256="));
        assert!(verify_signature("topsecret", body, &header));
        assert!(!verify_signature("other", body, &header));
        assert!(!verify_signature("topsecret", b"{}", &header));
        assert!(!verify_signature("topsecret", body, "sha256=zz"));
    }

    #[test]
    fn unknown_event_types_are_tolerated() {
        let event: ProcessorEvent =
            serde_json::from_str(r#"{"type":"customer.created","id":"cus_1"}"#).unwrap();
        assert!(matches!(event, ProcessorEvent::Unknown));
    }
}

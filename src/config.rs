use once_cell::sync::Lazy;
use std::time::Duration;

use crate::billing::{BillingPeriod, RetryPolicy};

/// Address the HTTP server binds to. Defaults to `0.0.0.0`.
pub static BIND_ADDRESS: Lazy<String> =
    Lazy::new(|| std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string()));

/// Port the HTTP server should listen on. Defaults to `3000`.
pub static BIND_PORT: Lazy<u16> = Lazy::new(|| {
    std::env::var("BIND_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(3000)
});

/// Postgres connection string. When unset the engine keeps its state in memory.
pub static DATABASE_URL: Lazy<Option<String>> = Lazy::new(|| read_optional_env("DATABASE_URL"));

/// When set to a truthy value, allows the application to continue running even if database
/// migrations fail. Defaults to `false`.
pub static ALLOW_MIGRATION_FAILURE: Lazy<bool> = Lazy::new(|| {
    std::env::var("ALLOW_MIGRATION_FAILURE")
        .ok()
        .map(|value| {
            let normalized = value.trim().to_ascii_lowercase();
            matches!(normalized.as_str(), "1" | "true" | "yes")
        })
        .unwrap_or(false)
});

/// key: billing-config -> JSON plan catalog; the built-in tiers are used when unset
pub static PLAN_CATALOG_PATH: Lazy<Option<String>> =
    Lazy::new(|| read_optional_env("PLAN_CATALOG_PATH"));

/// key: billing-config -> cycle length stepped from each subscription's anchor
pub static BILLING_CYCLE_PERIOD: Lazy<BillingPeriod> = Lazy::new(|| {
    read_optional_env("BILLING_CYCLE_PERIOD")
        .and_then(|value| {
            let parsed = BillingPeriod::parse(&value);
            if parsed.is_none() {
                tracing::warn!(value = %value, "unknown BILLING_CYCLE_PERIOD; using monthly");
            }
            parsed
        })
        .unwrap_or_default()
});

/// key: billing-config -> proactive rollover scan cadence
pub static BILLING_ROLLOVER_SCAN_INTERVAL_SECS: Lazy<u64> = Lazy::new(|| {
    std::env::var("BILLING_ROLLOVER_SCAN_INTERVAL_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(300)
});

/// key: billing-config -> stale counters handled per scheduler tick
pub static BILLING_ROLLOVER_BATCH_SIZE: Lazy<usize> = Lazy::new(|| {
    std::env::var("BILLING_ROLLOVER_BATCH_SIZE")
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(500)
});

/// key: billing-config -> attempts before a transient store fault surfaces
pub static BILLING_STORE_RETRY_ATTEMPTS: Lazy<u32> = Lazy::new(|| {
    std::env::var("BILLING_STORE_RETRY_ATTEMPTS")
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(5)
});

pub static BILLING_STORE_RETRY_BASE_DELAY_MS: Lazy<u64> = Lazy::new(|| {
    std::env::var("BILLING_STORE_RETRY_BASE_DELAY_MS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(10)
});

/// Shared secret for payment processor webhook signatures. Webhooks are rejected
/// while it is unset.
pub static BILLING_WEBHOOK_SECRET: Lazy<Option<String>> =
    Lazy::new(|| read_optional_env("BILLING_WEBHOOK_SECRET"));

pub fn billing_retry_policy() -> RetryPolicy {
    RetryPolicy::new(
        *BILLING_STORE_RETRY_ATTEMPTS,
        Duration::from_millis(*BILLING_STORE_RETRY_BASE_DELAY_MS),
    )
}

fn read_optional_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

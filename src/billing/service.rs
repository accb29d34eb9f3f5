use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use tracing::debug;

use super::counters::{ConsumeOutcome, UsageCounterStore};
use super::error::{BillingError, BillingResult};
use super::models::{Decision, DenialReason, TenantId, UsageSnapshot};
use super::subscriptions::SubscriptionStore;

/// key: billing-entitlements -> gate for metered actions
#[derive(Clone)]
pub struct EntitlementService {
    subscriptions: SubscriptionStore,
    counters: UsageCounterStore,
}

impl EntitlementService {
    pub fn new(subscriptions: SubscriptionStore, counters: UsageCounterStore) -> Self {
        Self {
            subscriptions,
            counters,
        }
    }

    pub async fn check_and_consume(
        &self,
        tenant_id: TenantId,
        metric: &str,
        amount: i64,
    ) -> BillingResult<Decision> {
        self.check_and_consume_at(tenant_id, metric, amount, Utc::now())
            .await
    }

    /// Atomically checks the tenant's entitlement and records `amount` units
    /// of `metric`. Quota and status denials come back as `Decision::Denied`.
    pub async fn check_and_consume_at(
        &self,
        tenant_id: TenantId,
        metric: &str,
        amount: i64,
        now: DateTime<Utc>,
    ) -> BillingResult<Decision> {
        if amount < 0 {
            return Err(BillingError::InvalidAmount(amount));
        }
        let subscription = self.subscriptions.get(tenant_id).await?;
        if !subscription.is_entitled() {
            let usage = self.counters.peek(&subscription, metric, now).await?;
            debug!(
                %tenant_id,
                metric,
                status = subscription.status.as_str(),
                "metered action denied for inactive subscription"
            );
            return Ok(Decision::Denied {
                reason: DenialReason::SubscriptionInactive,
                remaining: usage.remaining,
                usage,
            });
        }

        match self
            .counters
            .consume_for(&subscription, metric, amount, now)
            .await?
        {
            ConsumeOutcome::Allowed(counter) => {
                let usage = counter.snapshot();
                Ok(Decision::Allowed {
                    remaining: usage.remaining,
                    usage,
                })
            }
            ConsumeOutcome::Denied(counter) => {
                let usage = counter.snapshot();
                debug!(
                    %tenant_id,
                    metric,
                    amount,
                    consumed = usage.consumed,
                    limit = ?usage.limit,
                    "metered action denied: quota exceeded"
                );
                Ok(Decision::Denied {
                    reason: DenialReason::QuotaExceeded,
                    remaining: usage.remaining,
                    usage,
                })
            }
        }
    }

    pub async fn peek(
        &self,
        tenant_id: TenantId,
        metric: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<UsageSnapshot> {
        let subscription = self.subscriptions.get(tenant_id).await?;
        self.counters.peek(&subscription, metric, now).await
    }

    /// Usage for every metric the current plan defines plus any metric that
    /// already has a live counter, sorted by metric name.
    pub async fn usage(
        &self,
        tenant_id: TenantId,
        now: DateTime<Utc>,
    ) -> BillingResult<Vec<UsageSnapshot>> {
        let subscription = self.subscriptions.get(tenant_id).await?;
        let mut metrics: BTreeSet<String> = self
            .counters
            .live_counters(tenant_id, now)
            .await?
            .into_iter()
            .map(|counter| counter.metric)
            .collect();
        if let Some(plan) = self.subscriptions.catalog().get(&subscription.plan_id) {
            metrics.extend(plan.metrics().map(str::to_string));
        }

        let mut snapshots = Vec::with_capacity(metrics.len());
        for metric in &metrics {
            snapshots.push(self.counters.peek(&subscription, metric, now).await?);
        }
        Ok(snapshots)
    }
}

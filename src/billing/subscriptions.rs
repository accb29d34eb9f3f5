use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

use super::catalog::PlanCatalog;
use super::error::{BillingError, BillingResult};
use super::models::{PendingPlanChange, Plan, Subscription, SubscriptionStatus, TenantId};
use super::retry::RetryPolicy;
use super::store::SubscriptionBackend;

/// A pending change that has just taken effect.
#[derive(Debug, Clone)]
pub struct PromotedChange {
    pub subscription: Subscription,
    pub from_plan: String,
    pub pending: PendingPlanChange,
}

struct Revision {
    before: Subscription,
    after: Subscription,
    changed: bool,
}

/// key: billing-subscription-store -> plan, anchor and status per tenant
#[derive(Clone)]
pub struct SubscriptionStore {
    backend: Arc<dyn SubscriptionBackend>,
    catalog: Arc<PlanCatalog>,
    retry: RetryPolicy,
}

impl SubscriptionStore {
    pub fn new(
        backend: Arc<dyn SubscriptionBackend>,
        catalog: Arc<PlanCatalog>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            backend,
            catalog,
            retry,
        }
    }

    pub fn catalog(&self) -> &PlanCatalog {
        &self.catalog
    }

    pub fn plan(&self, plan_id: &str) -> BillingResult<&Plan> {
        self.catalog
            .get(plan_id)
            .ok_or_else(|| BillingError::UnknownPlan(plan_id.to_string()))
    }

    pub async fn get(&self, tenant_id: TenantId) -> BillingResult<Subscription> {
        let backend = self.backend.as_ref();
        self.retry
            .run("load subscription", move || async move {
                Ok(backend.fetch_subscription(tenant_id).await?)
            })
            .await?
            .ok_or(BillingError::NotFound(tenant_id))
    }

    /// Signup: one subscription per tenant, anchored at `anchor`.
    pub async fn provision(
        &self,
        tenant_id: TenantId,
        plan_id: &str,
        anchor: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> BillingResult<Subscription> {
        self.plan(plan_id)?;
        let subscription = Subscription {
            tenant_id,
            plan_id: plan_id.to_string(),
            status: SubscriptionStatus::Active,
            cycle_anchor: anchor,
            pending_change: None,
            canceled_at: None,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        let backend = self.backend.as_ref();
        let record = &subscription;
        let inserted = self
            .retry
            .run("provision subscription", move || async move {
                Ok(backend.insert_subscription(record).await?)
            })
            .await?;
        if !inserted {
            return Err(BillingError::AlreadyExists(tenant_id));
        }
        info!(%tenant_id, plan = plan_id, anchor = %anchor, "provisioned subscription");
        Ok(subscription)
    }

    /// Switches the tenant to `new_plan_id` now when `effective_at <= now`,
    /// otherwise records it as the pending change for `effective_at`.
    pub async fn transition_plan(
        &self,
        tenant_id: TenantId,
        new_plan_id: &str,
        effective_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> BillingResult<Subscription> {
        self.plan(new_plan_id)?;
        let revision = self
            .update(tenant_id, now, |subscription| {
                if subscription.status == SubscriptionStatus::Canceled {
                    return Err(BillingError::InvalidTransition {
                        status: subscription.status,
                        action: "change the plan of",
                    });
                }
                if effective_at <= now {
                    subscription.plan_id = new_plan_id.to_string();
                    subscription.pending_change = None;
                } else {
                    subscription.pending_change = Some(PendingPlanChange {
                        plan_id: new_plan_id.to_string(),
                        effective_at,
                        requested_at: now,
                    });
                }
                Ok(true)
            })
            .await?;
        Ok(revision.after)
    }

    /// Moves the subscription to `status`, enforcing the allowed transitions.
    /// Re-entering the current status is a no-op.
    pub async fn set_status(
        &self,
        tenant_id: TenantId,
        status: SubscriptionStatus,
        now: DateTime<Utc>,
    ) -> BillingResult<Subscription> {
        let revision = self
            .update(tenant_id, now, |subscription| {
                if subscription.status == status {
                    return Ok(false);
                }
                match (subscription.status, status) {
                    (SubscriptionStatus::Canceled, SubscriptionStatus::PastDue) => {
                        Err(BillingError::InvalidTransition {
                            status: subscription.status,
                            action: "mark past due",
                        })
                    }
                    (SubscriptionStatus::Canceled, SubscriptionStatus::Active) => {
                        Err(BillingError::InvalidTransition {
                            status: subscription.status,
                            action: "mark paid",
                        })
                    }
                    (_, SubscriptionStatus::Canceled) => {
                        subscription.status = SubscriptionStatus::Canceled;
                        subscription.canceled_at = Some(now);
                        subscription.pending_change = None;
                        Ok(true)
                    }
                    (_, next) => {
                        subscription.status = next;
                        subscription.canceled_at = None;
                        Ok(true)
                    }
                }
            })
            .await?;
        Ok(revision.after)
    }

    /// Returns the tenant to `active` on `plan_id`, keeping its cycle anchor.
    pub async fn reactivate(
        &self,
        tenant_id: TenantId,
        plan_id: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<Subscription> {
        self.plan(plan_id)?;
        let revision = self
            .update(tenant_id, now, |subscription| {
                if subscription.status == SubscriptionStatus::Active {
                    return Err(BillingError::InvalidTransition {
                        status: subscription.status,
                        action: "reactivate",
                    });
                }
                subscription.status = SubscriptionStatus::Active;
                subscription.plan_id = plan_id.to_string();
                subscription.pending_change = None;
                subscription.canceled_at = None;
                Ok(true)
            })
            .await?;
        Ok(revision.after)
    }

    /// Applies a pending change whose effective date has passed.
    pub async fn promote_due_change(
        &self,
        tenant_id: TenantId,
        now: DateTime<Utc>,
    ) -> BillingResult<Option<PromotedChange>> {
        let revision = self
            .update(tenant_id, now, |subscription| {
                let Some(pending) = subscription.pending_change.clone() else {
                    return Ok(false);
                };
                if pending.effective_at > now {
                    return Ok(false);
                }
                subscription.plan_id = pending.plan_id;
                subscription.pending_change = None;
                Ok(true)
            })
            .await?;
        if !revision.changed {
            return Ok(None);
        }
        let Revision { before, after, .. } = revision;
        let Some(pending) = before.pending_change else {
            return Ok(None);
        };
        info!(%tenant_id, from = %before.plan_id, plan = %after.plan_id, "applied pending plan change");
        Ok(Some(PromotedChange {
            subscription: after,
            from_plan: before.plan_id,
            pending,
        }))
    }

    pub async fn tenants_with_due_changes(&self, now: DateTime<Utc>) -> BillingResult<Vec<TenantId>> {
        let backend = self.backend.as_ref();
        self.retry
            .run("scan pending plan changes", move || async move {
                Ok(backend.tenants_with_due_changes(now).await?)
            })
            .await
    }

    /// Optimistic read-modify-write. `mutate` returns `false` to leave the
    /// record untouched; a lost version race is retried with backoff.
    async fn update<F>(
        &self,
        tenant_id: TenantId,
        now: DateTime<Utc>,
        mutate: F,
    ) -> BillingResult<Revision>
    where
        F: Fn(&mut Subscription) -> BillingResult<bool> + Send + Sync,
    {
        let backend = self.backend.as_ref();
        let mutate = &mutate;
        self.retry
            .run("update subscription", move || async move {
                let current = backend
                    .fetch_subscription(tenant_id)
                    .await?
                    .ok_or(BillingError::NotFound(tenant_id))?;
                let mut next = current.clone();
                if !mutate(&mut next)? {
                    return Ok(Revision {
                        after: current.clone(),
                        before: current,
                        changed: false,
                    });
                }
                next.updated_at = now;
                if !backend.replace_subscription(&next, current.version).await? {
                    return Err(BillingError::Contention(format!("subscription {tenant_id}")));
                }
                next.version = current.version + 1;
                Ok(Revision {
                    before: current,
                    after: next,
                    changed: true,
                })
            })
            .await
    }
}

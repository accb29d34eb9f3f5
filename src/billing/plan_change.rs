use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use super::counters::UsageCounterStore;
use super::error::{BillingError, BillingResult};
use super::models::{
    PlanChange, PlanChangeKind, PlanChangeState, Subscription, SubscriptionStatus, TenantId,
};
use super::scheduler::CycleScheduler;
use super::subscriptions::SubscriptionStore;

/// key: billing-plan-changes -> upgrades now, downgrades at the boundary
#[derive(Clone)]
pub struct PlanChangeCoordinator {
    subscriptions: SubscriptionStore,
    counters: UsageCounterStore,
    scheduler: CycleScheduler,
}

impl PlanChangeCoordinator {
    pub fn new(
        subscriptions: SubscriptionStore,
        counters: UsageCounterStore,
        scheduler: CycleScheduler,
    ) -> Self {
        Self {
            subscriptions,
            counters,
            scheduler,
        }
    }

    /// Moves the tenant to `plan_id`. A plan that lowers no limit applies at
    /// once and lifts the live counters; anything else waits for the end of
    /// the current cycle.
    pub async fn request_change(
        &self,
        tenant_id: TenantId,
        plan_id: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<PlanChange> {
        let target = self.subscriptions.plan(plan_id)?.clone();
        self.apply_due(tenant_id, now).await?;
        let subscription = self.subscriptions.get(tenant_id).await?;
        if subscription.status == SubscriptionStatus::Canceled {
            return Err(BillingError::InvalidTransition {
                status: subscription.status,
                action: "change the plan of",
            });
        }

        let upgrade = match self.subscriptions.plan(&subscription.plan_id) {
            Ok(current) => target.covers(current),
            Err(_) => true,
        };
        let mut change = PlanChange {
            id: Uuid::new_v4(),
            tenant_id,
            from_plan: subscription.plan_id.clone(),
            to_plan: target.id.clone(),
            kind: if upgrade {
                PlanChangeKind::Upgrade
            } else {
                PlanChangeKind::Downgrade
            },
            state: PlanChangeState::Requested,
            effective_at: now,
            requested_at: now,
        };

        if upgrade {
            let updated = self
                .subscriptions
                .transition_plan(tenant_id, plan_id, now, now)
                .await?;
            let raised = self.counters.raise_limits(&updated, &target, now).await?;
            change.advance(PlanChangeState::Applied);
            info!(
                %tenant_id,
                from = %change.from_plan,
                to = %change.to_plan,
                raised = raised.len(),
                "applied plan upgrade"
            );
        } else {
            let boundary = self.scheduler.window_for(&subscription, now).end;
            self.subscriptions
                .transition_plan(tenant_id, plan_id, boundary, now)
                .await?;
            change.effective_at = boundary;
            change.advance(PlanChangeState::PendingEffectiveDate);
            info!(
                %tenant_id,
                from = %change.from_plan,
                to = %change.to_plan,
                effective_at = %boundary,
                "scheduled plan downgrade"
            );
        }
        Ok(change)
    }

    /// Cancels immediately. Metered actions are denied from `now` on.
    pub async fn cancel(&self, tenant_id: TenantId, now: DateTime<Utc>) -> BillingResult<PlanChange> {
        let subscription = self
            .subscriptions
            .set_status(tenant_id, SubscriptionStatus::Canceled, now)
            .await?;
        info!(%tenant_id, plan = %subscription.plan_id, "canceled subscription");
        Ok(applied(
            &subscription,
            subscription.plan_id.clone(),
            PlanChangeKind::Cancellation,
            now,
        ))
    }

    /// Returns a past-due or canceled tenant to `active` on `plan_id`.
    pub async fn reactivate(
        &self,
        tenant_id: TenantId,
        plan_id: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<PlanChange> {
        let target = self.subscriptions.plan(plan_id)?.clone();
        let before = self.subscriptions.get(tenant_id).await?;
        let subscription = self
            .subscriptions
            .reactivate(tenant_id, plan_id, now)
            .await?;
        self.counters
            .raise_limits(&subscription, &target, now)
            .await?;
        info!(%tenant_id, plan = plan_id, "reactivated subscription");
        Ok(applied(
            &subscription,
            before.plan_id,
            PlanChangeKind::Reactivation,
            now,
        ))
    }

    pub async fn mark_past_due(
        &self,
        tenant_id: TenantId,
        now: DateTime<Utc>,
    ) -> BillingResult<Subscription> {
        let subscription = self
            .subscriptions
            .set_status(tenant_id, SubscriptionStatus::PastDue, now)
            .await?;
        info!(%tenant_id, "subscription marked past due");
        Ok(subscription)
    }

    pub async fn mark_paid(
        &self,
        tenant_id: TenantId,
        now: DateTime<Utc>,
    ) -> BillingResult<Subscription> {
        let subscription = self
            .subscriptions
            .set_status(tenant_id, SubscriptionStatus::Active, now)
            .await?;
        info!(%tenant_id, "subscription payment recovered");
        Ok(subscription)
    }

    /// Promotes the tenant's pending change once its effective date is reached.
    pub async fn apply_due(
        &self,
        tenant_id: TenantId,
        now: DateTime<Utc>,
    ) -> BillingResult<Option<PlanChange>> {
        let Some(promoted) = self.subscriptions.promote_due_change(tenant_id, now).await? else {
            return Ok(None);
        };
        let mut change = PlanChange {
            id: Uuid::new_v4(),
            tenant_id,
            from_plan: promoted.from_plan,
            to_plan: promoted.subscription.plan_id.clone(),
            kind: PlanChangeKind::Downgrade,
            state: PlanChangeState::PendingEffectiveDate,
            effective_at: promoted.pending.effective_at,
            requested_at: promoted.pending.requested_at,
        };
        change.advance(PlanChangeState::Applied);
        Ok(Some(change))
    }
}

fn applied(
    subscription: &Subscription,
    from_plan: String,
    kind: PlanChangeKind,
    now: DateTime<Utc>,
) -> PlanChange {
    PlanChange {
        id: Uuid::new_v4(),
        tenant_id: subscription.tenant_id,
        from_plan,
        to_plan: subscription.plan_id.clone(),
        kind,
        state: PlanChangeState::Applied,
        effective_at: now,
        requested_at: now,
    }
}

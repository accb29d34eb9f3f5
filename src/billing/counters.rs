use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::error::{BillingError, BillingResult};
use super::models::{limit_at_least, Plan, Subscription, TenantId, UsageCounter, UsageSnapshot};
use super::retry::RetryPolicy;
use super::scheduler::CycleScheduler;
use super::store::{CounterBackend, IncrementOutcome, InsertOutcome};
use super::subscriptions::SubscriptionStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Allowed(UsageCounter),
    Denied(UsageCounter),
}

/// key: billing-usage-counters -> bounded consumption per cycle
#[derive(Clone)]
pub struct UsageCounterStore {
    backend: Arc<dyn CounterBackend>,
    subscriptions: SubscriptionStore,
    scheduler: CycleScheduler,
    retry: RetryPolicy,
}

impl UsageCounterStore {
    pub fn new(
        backend: Arc<dyn CounterBackend>,
        subscriptions: SubscriptionStore,
        scheduler: CycleScheduler,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            backend,
            subscriptions,
            scheduler,
            retry,
        }
    }

    /// Active counter for the window containing `now`, opening or rolling it
    /// over first when needed.
    pub async fn get_or_create(
        &self,
        tenant_id: TenantId,
        metric: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<UsageCounter> {
        let subscription = self.subscriptions.get(tenant_id).await?;
        self.current(&subscription, metric, now).await
    }

    pub async fn current(
        &self,
        subscription: &Subscription,
        metric: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<UsageCounter> {
        self.retry
            .run("resolve usage counter", move || async move {
                self.resolve_once(subscription, metric, now).await
            })
            .await
    }

    /// Adds `amount` when the counter stays within its limit snapshot.
    /// Status checks are the caller's concern.
    pub async fn try_consume(
        &self,
        tenant_id: TenantId,
        metric: &str,
        amount: i64,
        now: DateTime<Utc>,
    ) -> BillingResult<ConsumeOutcome> {
        let subscription = self.subscriptions.get(tenant_id).await?;
        self.consume_for(&subscription, metric, amount, now).await
    }

    pub async fn consume_for(
        &self,
        subscription: &Subscription,
        metric: &str,
        amount: i64,
        now: DateTime<Utc>,
    ) -> BillingResult<ConsumeOutcome> {
        if amount < 0 {
            return Err(BillingError::InvalidAmount(amount));
        }
        let tenant_id = subscription.tenant_id;
        let backend = self.backend.as_ref();
        self.retry
            .run("consume usage", move || async move {
                let counter = self.resolve_once(subscription, metric, now).await?;
                if amount == 0 {
                    return Ok(ConsumeOutcome::Allowed(counter));
                }
                match backend
                    .try_increment(tenant_id, metric, counter.cycle_start, amount, now)
                    .await?
                {
                    IncrementOutcome::Applied(counter) => Ok(ConsumeOutcome::Allowed(counter)),
                    IncrementOutcome::OverLimit(counter) => Ok(ConsumeOutcome::Denied(counter)),
                    IncrementOutcome::Stale => Err(BillingError::Contention(format!(
                        "usage counter {tenant_id}/{metric}"
                    ))),
                }
            })
            .await
    }

    /// Current usage without opening, rolling or incrementing anything. A
    /// missing or stale counter reads as a fresh cycle.
    pub async fn peek(
        &self,
        subscription: &Subscription,
        metric: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<UsageSnapshot> {
        let tenant_id = subscription.tenant_id;
        let backend = self.backend.as_ref();
        let active = self
            .retry
            .run("read usage counter", move || async move {
                Ok(backend.active_counter(tenant_id, metric).await?)
            })
            .await?;
        match active {
            Some(counter) if !counter.is_stale(now) => Ok(counter.snapshot()),
            _ => Ok(self.scheduler.fresh_counter(subscription, metric, now)?.snapshot()),
        }
    }

    /// Active counters that have not yet reached their cycle end.
    pub async fn live_counters(
        &self,
        tenant_id: TenantId,
        now: DateTime<Utc>,
    ) -> BillingResult<Vec<UsageCounter>> {
        let backend = self.backend.as_ref();
        let counters = self
            .retry
            .run("list usage counters", move || async move {
                Ok(backend.active_counters_for(tenant_id).await?)
            })
            .await?;
        Ok(counters
            .into_iter()
            .filter(|counter| !counter.is_stale(now))
            .collect())
    }

    /// Lifts the limit snapshot of every live counter to what `plan` allows.
    /// Limits are never lowered and consumption is untouched.
    pub async fn raise_limits(
        &self,
        subscription: &Subscription,
        plan: &Plan,
        now: DateTime<Utc>,
    ) -> BillingResult<Vec<UsageCounter>> {
        let tenant_id = subscription.tenant_id;
        let backend = self.backend.as_ref();
        let mut raised = Vec::new();
        for counter in self.live_counters(tenant_id, now).await? {
            let target = plan.limit_for(&counter.metric);
            if target == counter.limit_snapshot || !limit_at_least(target, counter.limit_snapshot) {
                continue;
            }
            let metric = counter.metric.as_str();
            let cycle_start = counter.cycle_start;
            let updated = self
                .retry
                .run("raise usage limit", move || async move {
                    Ok(backend
                        .raise_limit(tenant_id, metric, cycle_start, target, now)
                        .await?)
                })
                .await?;
            if let Some(updated) = updated {
                info!(
                    %tenant_id,
                    metric,
                    from = ?counter.limit_snapshot,
                    to = ?updated.limit_snapshot,
                    "raised usage limit mid-cycle"
                );
                raised.push(updated);
            }
        }
        Ok(raised)
    }

    /// Closed cycles for a metric, oldest first.
    pub async fn history(
        &self,
        tenant_id: TenantId,
        metric: &str,
    ) -> BillingResult<Vec<UsageCounter>> {
        let backend = self.backend.as_ref();
        self.retry
            .run("read usage history", move || async move {
                Ok(backend.archived_counters(tenant_id, metric).await?)
            })
            .await
    }

    async fn resolve_once(
        &self,
        subscription: &Subscription,
        metric: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<UsageCounter> {
        let counter = match self
            .backend
            .active_counter(subscription.tenant_id, metric)
            .await?
        {
            Some(counter) => counter,
            None => {
                let fresh = self.scheduler.fresh_counter(subscription, metric, now)?;
                match self.backend.insert_counter(&fresh).await? {
                    InsertOutcome::Inserted(counter) => {
                        debug!(
                            tenant_id = %counter.tenant_id,
                            metric,
                            cycle_start = %counter.cycle_start,
                            "opened usage counter"
                        );
                        self.scheduler.settle_limit(counter, now).await?
                    }
                    InsertOutcome::Existing(counter) => counter,
                }
            }
        };
        if !counter.is_stale(now) {
            return Ok(counter);
        }
        let rollover = self.scheduler.try_roll(subscription, &counter, now).await?;
        Ok(rollover.counter)
    }
}

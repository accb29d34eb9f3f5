use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration as TokioDuration};
use tracing::{debug, info, warn};

use super::cycle::BillingPeriod;
use super::error::{BillingError, BillingResult};
use super::models::{limit_at_least, CycleWindow, Subscription, SubscriptionStatus, UsageCounter};
use super::retry::RetryPolicy;
use super::store::{CounterBackend, RolloverOutcome};
use super::subscriptions::SubscriptionStore;

/// Counter in force after a rollover attempt. `performed` is false when another
/// caller had already advanced the cycle.
#[derive(Debug, Clone)]
pub struct Rollover {
    pub counter: UsageCounter,
    pub performed: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub promoted: usize,
    pub rolled: usize,
    pub failed: usize,
}

/// key: billing-cycle-scheduler -> window math and rollover
#[derive(Clone)]
pub struct CycleScheduler {
    backend: Arc<dyn CounterBackend>,
    subscriptions: SubscriptionStore,
    period: BillingPeriod,
    retry: RetryPolicy,
}

impl CycleScheduler {
    pub fn new(
        backend: Arc<dyn CounterBackend>,
        subscriptions: SubscriptionStore,
        period: BillingPeriod,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            backend,
            subscriptions,
            period,
            retry,
        }
    }

    pub fn window_for(&self, subscription: &Subscription, now: DateTime<Utc>) -> CycleWindow {
        self.period.window_containing(subscription.cycle_anchor, now)
    }

    /// Counter that would open for the window containing `now`, limited by
    /// the plan in force when that window starts. Nothing is persisted.
    pub fn fresh_counter(
        &self,
        subscription: &Subscription,
        metric: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<UsageCounter> {
        let window = self.window_for(subscription, now);
        let plan = self
            .subscriptions
            .plan(subscription.plan_in_force_at(window.start))?;
        Ok(UsageCounter::open(
            subscription.tenant_id,
            metric,
            window,
            plan.limit_for(metric),
            now,
        ))
    }

    /// Re-reads the subscription after a counter was opened from an earlier
    /// read and lifts the snapshot when the plan in force for the counter's
    /// cycle now allows more. An upgrade that lands between the two reads is
    /// otherwise missed by both sides.
    pub(crate) async fn settle_limit(
        &self,
        counter: UsageCounter,
        now: DateTime<Utc>,
    ) -> BillingResult<UsageCounter> {
        let subscription = self.subscriptions.get(counter.tenant_id).await?;
        let plan = self
            .subscriptions
            .plan(subscription.plan_in_force_at(counter.cycle_start))?;
        let target = plan.limit_for(&counter.metric);
        if target == counter.limit_snapshot || !limit_at_least(target, counter.limit_snapshot) {
            return Ok(counter);
        }
        match self
            .backend
            .raise_limit(counter.tenant_id, &counter.metric, counter.cycle_start, target, now)
            .await?
        {
            Some(raised) => {
                info!(
                    tenant_id = %raised.tenant_id,
                    metric = %raised.metric,
                    from = ?counter.limit_snapshot,
                    to = ?raised.limit_snapshot,
                    "raised limit of freshly opened usage counter"
                );
                Ok(raised)
            }
            None => Ok(counter),
        }
    }

    /// Single rollover attempt without retry.
    pub(crate) async fn try_roll(
        &self,
        subscription: &Subscription,
        stale: &UsageCounter,
        now: DateTime<Utc>,
    ) -> BillingResult<Rollover> {
        if !stale.is_stale(now) {
            return Ok(Rollover {
                counter: stale.clone(),
                performed: false,
            });
        }
        let next = self.fresh_counter(subscription, &stale.metric, now)?;
        match self.backend.rollover(stale.cycle_end, &next).await? {
            RolloverOutcome::Rolled(counter) => {
                info!(
                    tenant_id = %counter.tenant_id,
                    metric = %counter.metric,
                    previous_end = %stale.cycle_end,
                    cycle_start = %counter.cycle_start,
                    cycle_end = %counter.cycle_end,
                    limit = ?counter.limit_snapshot,
                    "rolled usage counter into new cycle"
                );
                Ok(Rollover {
                    counter: self.settle_limit(counter, now).await?,
                    performed: true,
                })
            }
            RolloverOutcome::AlreadyRolled(counter) => {
                debug!(
                    tenant_id = %counter.tenant_id,
                    metric = %counter.metric,
                    cycle_start = %counter.cycle_start,
                    "usage counter already rolled"
                );
                if counter.is_stale(now) {
                    return Err(BillingError::Contention(format!(
                        "usage counter {}/{}",
                        counter.tenant_id, counter.metric
                    )));
                }
                Ok(Rollover {
                    counter: self.settle_limit(counter, now).await?,
                    performed: false,
                })
            }
        }
    }

    /// Archives `stale` and opens the counter for the window containing `now`.
    /// Safe to call from any number of callers at once.
    pub async fn roll(
        &self,
        subscription: &Subscription,
        stale: &UsageCounter,
        now: DateTime<Utc>,
    ) -> BillingResult<Rollover> {
        self.retry
            .run("roll over usage counter", move || async move {
                self.try_roll(subscription, stale, now).await
            })
            .await
    }

    /// Promotes due plan changes, then rolls up to `batch_size` stale counters.
    /// Canceled subscriptions are not rolled. Per-item failures are logged and counted; the tick itself only fails
    /// when the scans do.
    pub async fn process_tick(
        &self,
        now: DateTime<Utc>,
        batch_size: usize,
    ) -> BillingResult<TickReport> {
        let mut report = TickReport::default();

        for tenant_id in self.subscriptions.tenants_with_due_changes(now).await? {
            match self.subscriptions.promote_due_change(tenant_id, now).await {
                Ok(Some(_)) => report.promoted += 1,
                Ok(None) => {}
                Err(err) => {
                    report.failed += 1;
                    warn!(?err, %tenant_id, "failed to apply pending plan change");
                }
            }
        }

        let backend = self.backend.as_ref();
        let stale = self
            .retry
            .run("scan stale usage counters", move || async move {
                Ok(backend.stale_counters(now, batch_size).await?)
            })
            .await?;

        for counter in stale {
            let subscription = match self.subscriptions.get(counter.tenant_id).await {
                Ok(subscription) => subscription,
                Err(err) => {
                    report.failed += 1;
                    warn!(?err, tenant_id = %counter.tenant_id, "no subscription for stale counter");
                    continue;
                }
            };
            if subscription.status == SubscriptionStatus::Canceled {
                debug!(tenant_id = %counter.tenant_id, "skipping rollover for canceled subscription");
                continue;
            }
            match self.roll(&subscription, &counter, now).await {
                Ok(rollover) if rollover.performed => report.rolled += 1,
                Ok(_) => {}
                Err(err) => {
                    report.failed += 1;
                    warn!(
                        ?err,
                        tenant_id = %counter.tenant_id,
                        metric = %counter.metric,
                        "failed to roll usage counter"
                    );
                }
            }
        }

        Ok(report)
    }
}

/// key: billing-cycle-scheduler -> background ticker
pub fn spawn(
    scheduler: CycleScheduler,
    interval: TokioDuration,
    batch_size: usize,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        loop {
            ticker.tick().await;
            let now = Utc::now();
            match scheduler.process_tick(now, batch_size).await {
                Ok(report) if report == TickReport::default() => {
                    debug!("billing cycle tick found nothing to do");
                }
                Ok(report) => info!(
                    promoted = report.promoted,
                    rolled = report.rolled,
                    failed = report.failed,
                    "billing cycle tick completed"
                ),
                Err(err) => warn!(?err, "billing cycle tick failed"),
            }
        }
    })
}

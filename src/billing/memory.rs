use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::error::StoreError;
use super::models::{Subscription, SubscriptionStatus, TenantId, UsageCounter};
use super::store::{
    CounterBackend, IncrementOutcome, InsertOutcome, RolloverOutcome, SubscriptionBackend,
};

type CounterKey = (TenantId, String);

#[derive(Debug, Clone)]
struct CounterSlot {
    active: UsageCounter,
    archived: Vec<UsageCounter>,
}

/// key: billing-memory-backend -> per-key shard locks
/// Every conditional write runs under the DashMap entry lock for its
/// `(tenant, metric)` key, which is never held across an await.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    subscriptions: DashMap<TenantId, Subscription>,
    counters: DashMap<CounterKey, CounterSlot>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriptionBackend for MemoryBackend {
    async fn fetch_subscription(
        &self,
        tenant_id: TenantId,
    ) -> Result<Option<Subscription>, StoreError> {
        Ok(self
            .subscriptions
            .get(&tenant_id)
            .map(|entry| entry.value().clone()))
    }

    async fn insert_subscription(&self, subscription: &Subscription) -> Result<bool, StoreError> {
        match self.subscriptions.entry(subscription.tenant_id) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(subscription.clone());
                Ok(true)
            }
        }
    }

    async fn replace_subscription(
        &self,
        subscription: &Subscription,
        expected_version: i64,
    ) -> Result<bool, StoreError> {
        let Some(mut stored) = self.subscriptions.get_mut(&subscription.tenant_id) else {
            return Ok(false);
        };
        if stored.version != expected_version {
            return Ok(false);
        }
        let mut next = subscription.clone();
        next.version = expected_version + 1;
        *stored = next;
        Ok(true)
    }

    async fn tenants_with_due_changes(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<TenantId>, StoreError> {
        Ok(self
            .subscriptions
            .iter()
            .filter(|entry| {
                entry
                    .pending_change
                    .as_ref()
                    .map(|pending| pending.effective_at <= now)
                    .unwrap_or(false)
            })
            .map(|entry| *entry.key())
            .collect())
    }
}

#[async_trait]
impl CounterBackend for MemoryBackend {
    async fn active_counter(
        &self,
        tenant_id: TenantId,
        metric: &str,
    ) -> Result<Option<UsageCounter>, StoreError> {
        Ok(self
            .counters
            .get(&(tenant_id, metric.to_string()))
            .map(|slot| slot.active.clone()))
    }

    async fn insert_counter(&self, counter: &UsageCounter) -> Result<InsertOutcome, StoreError> {
        match self
            .counters
            .entry((counter.tenant_id, counter.metric.clone()))
        {
            Entry::Occupied(slot) => Ok(InsertOutcome::Existing(slot.get().active.clone())),
            Entry::Vacant(slot) => {
                slot.insert(CounterSlot {
                    active: counter.clone(),
                    archived: Vec::new(),
                });
                Ok(InsertOutcome::Inserted(counter.clone()))
            }
        }
    }

    async fn try_increment(
        &self,
        tenant_id: TenantId,
        metric: &str,
        cycle_start: DateTime<Utc>,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Result<IncrementOutcome, StoreError> {
        let Some(mut slot) = self.counters.get_mut(&(tenant_id, metric.to_string())) else {
            return Ok(IncrementOutcome::Stale);
        };
        let active = &mut slot.active;
        if active.cycle_start != cycle_start {
            return Ok(IncrementOutcome::Stale);
        }
        let Some(next) = active.consumed.checked_add(amount) else {
            return Ok(IncrementOutcome::OverLimit(active.clone()));
        };
        if matches!(active.limit_snapshot, Some(limit) if next > limit) {
            return Ok(IncrementOutcome::OverLimit(active.clone()));
        }
        active.consumed = next;
        active.version += 1;
        active.updated_at = now;
        Ok(IncrementOutcome::Applied(active.clone()))
    }

    async fn raise_limit(
        &self,
        tenant_id: TenantId,
        metric: &str,
        cycle_start: DateTime<Utc>,
        limit: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<Option<UsageCounter>, StoreError> {
        let Some(mut slot) = self.counters.get_mut(&(tenant_id, metric.to_string())) else {
            return Ok(None);
        };
        let active = &mut slot.active;
        let raises = match (active.limit_snapshot, limit) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(current), Some(requested)) => requested > current,
        };
        if active.cycle_start != cycle_start || !raises {
            return Ok(None);
        }
        active.limit_snapshot = limit;
        active.version += 1;
        active.updated_at = now;
        Ok(Some(active.clone()))
    }

    async fn rollover(
        &self,
        expected_cycle_end: DateTime<Utc>,
        next: &UsageCounter,
    ) -> Result<RolloverOutcome, StoreError> {
        match self.counters.entry((next.tenant_id, next.metric.clone())) {
            Entry::Occupied(mut entry) => {
                let slot = entry.get_mut();
                if slot.active.cycle_end != expected_cycle_end {
                    return Ok(RolloverOutcome::AlreadyRolled(slot.active.clone()));
                }
                let mut archived = std::mem::replace(&mut slot.active, next.clone());
                archived.archived_at = Some(next.updated_at);
                slot.archived.push(archived);
                Ok(RolloverOutcome::Rolled(next.clone()))
            }
            Entry::Vacant(entry) => {
                entry.insert(CounterSlot {
                    active: next.clone(),
                    archived: Vec::new(),
                });
                Ok(RolloverOutcome::Rolled(next.clone()))
            }
        }
    }

    async fn active_counters_for(
        &self,
        tenant_id: TenantId,
    ) -> Result<Vec<UsageCounter>, StoreError> {
        let mut counters: Vec<UsageCounter> = self
            .counters
            .iter()
            .filter(|slot| slot.key().0 == tenant_id)
            .map(|slot| slot.active.clone())
            .collect();
        counters.sort_by(|a, b| a.metric.cmp(&b.metric));
        Ok(counters)
    }

    async fn stale_counters(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<UsageCounter>, StoreError> {
        let mut stale: Vec<UsageCounter> = self
            .counters
            .iter()
            .filter(|slot| slot.active.cycle_end <= now)
            .filter(|slot| {
                self.subscriptions
                    .get(&slot.key().0)
                    .map_or(true, |subscription| {
                        subscription.status != SubscriptionStatus::Canceled
                    })
            })
            .map(|slot| slot.active.clone())
            .collect();
        stale.sort_by_key(|counter| counter.cycle_end);
        stale.truncate(limit);
        Ok(stale)
    }

    async fn archived_counters(
        &self,
        tenant_id: TenantId,
        metric: &str,
    ) -> Result<Vec<UsageCounter>, StoreError> {
        Ok(self
            .counters
            .get(&(tenant_id, metric.to_string()))
            .map(|slot| slot.archived.clone())
            .unwrap_or_default())
    }
}

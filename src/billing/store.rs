use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::StoreError;
use super::models::{Subscription, TenantId, UsageCounter};

/// Result of the atomic compare-and-increment on a counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncrementOutcome {
    Applied(UsageCounter),
    OverLimit(UsageCounter),
    /// The addressed cycle is no longer the active counter.
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(UsageCounter),
    Existing(UsageCounter),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RolloverOutcome {
    Rolled(UsageCounter),
    AlreadyRolled(UsageCounter),
}

/// key: billing-subscription-backend -> persistence seam
#[async_trait]
pub trait SubscriptionBackend: Send + Sync {
    async fn fetch_subscription(
        &self,
        tenant_id: TenantId,
    ) -> Result<Option<Subscription>, StoreError>;

    /// Inserts a new subscription; `false` when the tenant already has one.
    async fn insert_subscription(&self, subscription: &Subscription) -> Result<bool, StoreError>;

    /// Replaces the stored record only if its version still equals
    /// `expected_version`. The stored version becomes `expected_version + 1`.
    async fn replace_subscription(
        &self,
        subscription: &Subscription,
        expected_version: i64,
    ) -> Result<bool, StoreError>;

    async fn tenants_with_due_changes(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<TenantId>, StoreError>;
}

/// key: billing-counter-backend -> conditional writes only
/// Every mutation is keyed on the counter state the caller last observed.
#[async_trait]
pub trait CounterBackend: Send + Sync {
    async fn active_counter(
        &self,
        tenant_id: TenantId,
        metric: &str,
    ) -> Result<Option<UsageCounter>, StoreError>;

    /// Inserts `counter` as the active counter unless one already exists.
    async fn insert_counter(&self, counter: &UsageCounter) -> Result<InsertOutcome, StoreError>;

    /// Adds `amount` to the active counter for `cycle_start` when the result
    /// stays within its limit snapshot and the counter's range.
    async fn try_increment(
        &self,
        tenant_id: TenantId,
        metric: &str,
        cycle_start: DateTime<Utc>,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Result<IncrementOutcome, StoreError>;

    /// Replaces the limit snapshot of the active counter for `cycle_start` only
    /// when `limit` is strictly larger. Returns the updated counter if raised.
    async fn raise_limit(
        &self,
        tenant_id: TenantId,
        metric: &str,
        cycle_start: DateTime<Utc>,
        limit: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<Option<UsageCounter>, StoreError>;

    /// Archives the active counter whose cycle ends at `expected_cycle_end` and
    /// activates `next`. Losers get the counter that is active now.
    async fn rollover(
        &self,
        expected_cycle_end: DateTime<Utc>,
        next: &UsageCounter,
    ) -> Result<RolloverOutcome, StoreError>;

    async fn active_counters_for(
        &self,
        tenant_id: TenantId,
    ) -> Result<Vec<UsageCounter>, StoreError>;

    /// Active counters whose cycle ended at or before `now`, oldest first.
    /// Counters of canceled subscriptions are left alone.
    async fn stale_counters(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<UsageCounter>, StoreError>;

    /// Archived counters, oldest first.
    async fn archived_counters(
        &self,
        tenant_id: TenantId,
        metric: &str,
    ) -> Result<Vec<UsageCounter>, StoreError>;
}

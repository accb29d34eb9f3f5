use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::error::StoreError;
use super::models::{
    PendingPlanChange, Subscription, SubscriptionStatus, TenantId, UsageCounter,
};
use super::store::{
    CounterBackend, IncrementOutcome, InsertOutcome, RolloverOutcome, SubscriptionBackend,
};

const COUNTER_COLUMNS: &str = "tenant_id, metric, cycle_start, cycle_end, consumed, limit_snapshot, version, archived_at, updated_at";

/// key: billing-postgres-backend -> single-statement conditional writes
#[derive(Clone)]
pub struct PgBackend {
    pool: PgPool,
}

impl PgBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn counter_for_cycle(
        &self,
        tenant_id: TenantId,
        metric: &str,
        cycle_start: DateTime<Utc>,
    ) -> Result<Option<UsageCounter>, StoreError> {
        let row = sqlx::query_as::<_, UsageCounter>(&format!(
            "SELECT {COUNTER_COLUMNS} FROM billing_usage_counters WHERE tenant_id = $1 AND metric = $2 AND cycle_start = $3 AND archived_at IS NULL"
        ))
        .bind(tenant_id)
        .bind(metric)
        .bind(cycle_start)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}

#[derive(Debug, FromRow)]
struct SubscriptionRow {
    tenant_id: Uuid,
    plan_id: String,
    status: String,
    cycle_anchor: DateTime<Utc>,
    pending_plan_id: Option<String>,
    pending_effective_at: Option<DateTime<Utc>>,
    pending_requested_at: Option<DateTime<Utc>>,
    canceled_at: Option<DateTime<Utc>>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = StoreError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        let status = SubscriptionStatus::parse(&row.status).ok_or_else(|| {
            StoreError::Corrupt(format!(
                "subscription {} has unknown status `{}`",
                row.tenant_id, row.status
            ))
        })?;
        let pending_change = match (row.pending_plan_id, row.pending_effective_at) {
            (Some(plan_id), Some(effective_at)) => Some(PendingPlanChange {
                plan_id,
                effective_at,
                requested_at: row.pending_requested_at.unwrap_or(row.updated_at),
            }),
            _ => None,
        };
        Ok(Subscription {
            tenant_id: row.tenant_id,
            plan_id: row.plan_id,
            status,
            cycle_anchor: row.cycle_anchor,
            pending_change,
            canceled_at: row.canceled_at,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for UsageCounter {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(UsageCounter {
            tenant_id: row.try_get("tenant_id")?,
            metric: row.try_get("metric")?,
            cycle_start: row.try_get("cycle_start")?,
            cycle_end: row.try_get("cycle_end")?,
            consumed: row.try_get("consumed")?,
            limit_snapshot: row.try_get("limit_snapshot")?,
            version: row.try_get("version")?,
            archived_at: row.try_get("archived_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl SubscriptionBackend for PgBackend {
    async fn fetch_subscription(
        &self,
        tenant_id: TenantId,
    ) -> Result<Option<Subscription>, StoreError> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            "SELECT * FROM billing_subscriptions WHERE tenant_id = $1",
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Subscription::try_from).transpose()
    }

    async fn insert_subscription(&self, subscription: &Subscription) -> Result<bool, StoreError> {
        let pending = subscription.pending_change.as_ref();
        let result = sqlx::query(
            r#"
            INSERT INTO billing_subscriptions (
                tenant_id,
                plan_id,
                status,
                cycle_anchor,
                pending_plan_id,
                pending_effective_at,
                pending_requested_at,
                canceled_at,
                version,
                created_at,
                updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (tenant_id) DO NOTHING
            "#,
        )
        .bind(subscription.tenant_id)
        .bind(&subscription.plan_id)
        .bind(subscription.status.as_str())
        .bind(subscription.cycle_anchor)
        .bind(pending.map(|p| p.plan_id.clone()))
        .bind(pending.map(|p| p.effective_at))
        .bind(pending.map(|p| p.requested_at))
        .bind(subscription.canceled_at)
        .bind(subscription.version)
        .bind(subscription.created_at)
        .bind(subscription.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn replace_subscription(
        &self,
        subscription: &Subscription,
        expected_version: i64,
    ) -> Result<bool, StoreError> {
        let pending = subscription.pending_change.as_ref();
        let result = sqlx::query(
            r#"
            UPDATE billing_subscriptions
            SET plan_id = $2,
                status = $3,
                cycle_anchor = $4,
                pending_plan_id = $5,
                pending_effective_at = $6,
                pending_requested_at = $7,
                canceled_at = $8,
                version = version + 1,
                updated_at = $9
            WHERE tenant_id = $1 AND version = $10
            "#,
        )
        .bind(subscription.tenant_id)
        .bind(&subscription.plan_id)
        .bind(subscription.status.as_str())
        .bind(subscription.cycle_anchor)
        .bind(pending.map(|p| p.plan_id.clone()))
        .bind(pending.map(|p| p.effective_at))
        .bind(pending.map(|p| p.requested_at))
        .bind(subscription.canceled_at)
        .bind(subscription.updated_at)
        .bind(expected_version)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn tenants_with_due_changes(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<TenantId>, StoreError> {
        let tenants = sqlx::query_scalar::<_, Uuid>(
            "SELECT tenant_id FROM billing_subscriptions WHERE pending_effective_at IS NOT NULL AND pending_effective_at <= $1",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(tenants)
    }
}

#[async_trait]
impl CounterBackend for PgBackend {
    async fn active_counter(
        &self,
        tenant_id: TenantId,
        metric: &str,
    ) -> Result<Option<UsageCounter>, StoreError> {
        let row = sqlx::query_as::<_, UsageCounter>(&format!(
            "SELECT {COUNTER_COLUMNS} FROM billing_usage_counters WHERE tenant_id = $1 AND metric = $2 AND archived_at IS NULL"
        ))
        .bind(tenant_id)
        .bind(metric)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn insert_counter(&self, counter: &UsageCounter) -> Result<InsertOutcome, StoreError> {
        let inserted = sqlx::query_as::<_, UsageCounter>(&format!(
            r#"
            INSERT INTO billing_usage_counters (
                tenant_id, metric, cycle_start, cycle_end, consumed, limit_snapshot, version, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT DO NOTHING
            RETURNING {COUNTER_COLUMNS}
            "#
        ))
        .bind(counter.tenant_id)
        .bind(&counter.metric)
        .bind(counter.cycle_start)
        .bind(counter.cycle_end)
        .bind(counter.consumed)
        .bind(counter.limit_snapshot)
        .bind(counter.version)
        .bind(counter.updated_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(inserted) = inserted {
            return Ok(InsertOutcome::Inserted(inserted));
        }
        match self.active_counter(counter.tenant_id, &counter.metric).await? {
            Some(existing) => Ok(InsertOutcome::Existing(existing)),
            None => Err(StoreError::Conflict),
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
        let updated = sqlx::query_as::<_, UsageCounter>(&format!(
            r#"
            UPDATE billing_usage_counters
            SET consumed = consumed + $4,
                version = version + 1,
                updated_at = $5
            WHERE tenant_id = $1
              AND metric = $2
              AND cycle_start = $3
              AND archived_at IS NULL
              AND consumed <= 9223372036854775807 - $4
              AND (limit_snapshot IS NULL OR $4 <= limit_snapshot - consumed)
            RETURNING {COUNTER_COLUMNS}
            "#
        ))
        .bind(tenant_id)
        .bind(metric)
        .bind(cycle_start)
        .bind(amount)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(updated) = updated {
            return Ok(IncrementOutcome::Applied(updated));
        }
        Ok(match self.counter_for_cycle(tenant_id, metric, cycle_start).await? {
            Some(current) => IncrementOutcome::OverLimit(current),
            None => IncrementOutcome::Stale,
        })
    }

    async fn raise_limit(
        &self,
        tenant_id: TenantId,
        metric: &str,
        cycle_start: DateTime<Utc>,
        limit: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<Option<UsageCounter>, StoreError> {
        let raised = sqlx::query_as::<_, UsageCounter>(&format!(
            r#"
            UPDATE billing_usage_counters
            SET limit_snapshot = $4,
                version = version + 1,
                updated_at = $5
            WHERE tenant_id = $1
              AND metric = $2
              AND cycle_start = $3
              AND archived_at IS NULL
              AND limit_snapshot IS NOT NULL
              AND ($4::BIGINT IS NULL OR limit_snapshot < $4)
            RETURNING {COUNTER_COLUMNS}
            "#
        ))
        .bind(tenant_id)
        .bind(metric)
        .bind(cycle_start)
        .bind(limit)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(raised)
    }

    async fn rollover(
        &self,
        expected_cycle_end: DateTime<Utc>,
        next: &UsageCounter,
    ) -> Result<RolloverOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let archived = sqlx::query(
            r#"
            UPDATE billing_usage_counters
            SET archived_at = $4,
                updated_at = $4
            WHERE tenant_id = $1
              AND metric = $2
              AND cycle_end = $3
              AND archived_at IS NULL
            "#,
        )
        .bind(next.tenant_id)
        .bind(&next.metric)
        .bind(expected_cycle_end)
        .bind(next.updated_at)
        .execute(&mut *tx)
        .await?;

        if archived.rows_affected() == 0 {
            tx.rollback().await?;
            return match self.insert_counter(next).await? {
                InsertOutcome::Inserted(counter) => Ok(RolloverOutcome::Rolled(counter)),
                InsertOutcome::Existing(counter) => Ok(RolloverOutcome::AlreadyRolled(counter)),
            };
        }

        let counter = sqlx::query_as::<_, UsageCounter>(&format!(
            r#"
            INSERT INTO billing_usage_counters (
                tenant_id, metric, cycle_start, cycle_end, consumed, limit_snapshot, version, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {COUNTER_COLUMNS}
            "#
        ))
        .bind(next.tenant_id)
        .bind(&next.metric)
        .bind(next.cycle_start)
        .bind(next.cycle_end)
        .bind(next.consumed)
        .bind(next.limit_snapshot)
        .bind(next.version)
        .bind(next.updated_at)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(RolloverOutcome::Rolled(counter))
    }

    async fn active_counters_for(
        &self,
        tenant_id: TenantId,
    ) -> Result<Vec<UsageCounter>, StoreError> {
        let rows = sqlx::query_as::<_, UsageCounter>(&format!(
            "SELECT {COUNTER_COLUMNS} FROM billing_usage_counters WHERE tenant_id = $1 AND archived_at IS NULL ORDER BY metric"
        ))
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn stale_counters(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<UsageCounter>, StoreError> {
        let rows = sqlx::query_as::<_, UsageCounter>(&format!(
            r#"
            SELECT {COUNTER_COLUMNS}
            FROM billing_usage_counters
            WHERE archived_at IS NULL
              AND cycle_end <= $1
              AND NOT EXISTS (
                  SELECT 1 FROM billing_subscriptions
                  WHERE billing_subscriptions.tenant_id = billing_usage_counters.tenant_id
                    AND billing_subscriptions.status = 'canceled'
              )
            ORDER BY cycle_end
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn archived_counters(
        &self,
        tenant_id: TenantId,
        metric: &str,
    ) -> Result<Vec<UsageCounter>, StoreError> {
        let rows = sqlx::query_as::<_, UsageCounter>(&format!(
            "SELECT {COUNTER_COLUMNS} FROM billing_usage_counters WHERE tenant_id = $1 AND metric = $2 AND archived_at IS NOT NULL ORDER BY cycle_start"
        ))
        .bind(tenant_id)
        .bind(metric)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

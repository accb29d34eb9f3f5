use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type TenantId = Uuid;

/// key: billing-models -> plans,subscriptions,usage
/// Catalog-defined plan tier. A metric listed with `null` is unlimited; a metric
/// missing from `quotas` is not part of the plan and has a limit of zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub name: String,
    pub amount_cents: i64,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub quotas: BTreeMap<String, Option<i64>>,
}

fn default_currency() -> String {
    "usd".to_string()
}

impl Plan {
    pub fn limit_for(&self, metric: &str) -> Option<i64> {
        self.quotas.get(metric).copied().unwrap_or(Some(0))
    }

    pub fn metrics(&self) -> impl Iterator<Item = &str> {
        self.quotas.keys().map(String::as_str)
    }

    /// True when no metric's limit would shrink by moving from `current` to `self`.
    pub fn covers(&self, current: &Plan) -> bool {
        let metrics: BTreeSet<&str> = self.metrics().chain(current.metrics()).collect();
        metrics
            .into_iter()
            .all(|metric| limit_at_least(self.limit_for(metric), current.limit_for(metric)))
    }
}

/// `None` is unlimited and therefore at least as large as any finite limit.
pub fn limit_at_least(candidate: Option<i64>, baseline: Option<i64>) -> bool {
    match (candidate, baseline) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(candidate), Some(baseline)) => candidate >= baseline,
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    PastDue,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(SubscriptionStatus::Active),
            "past_due" => Some(SubscriptionStatus::PastDue),
            "canceled" => Some(SubscriptionStatus::Canceled),
            _ => None,
        }
    }
}

/// key: billing-pending-change -> deferred downgrade
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPlanChange {
    pub plan_id: String,
    pub effective_at: DateTime<Utc>,
    pub requested_at: DateTime<Utc>,
}

/// key: billing-subscription-model -> tenant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub tenant_id: TenantId,
    pub plan_id: String,
    pub status: SubscriptionStatus,
    pub cycle_anchor: DateTime<Utc>,
    pub pending_change: Option<PendingPlanChange>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    pub fn is_entitled(&self) -> bool {
        self.status == SubscriptionStatus::Active
    }

    /// Plan that governs a cycle starting at `at`, honouring a pending change
    /// whose effective date has been reached.
    pub fn plan_in_force_at(&self, at: DateTime<Utc>) -> &str {
        match &self.pending_change {
            Some(pending) if pending.effective_at <= at => pending.plan_id.as_str(),
            _ => self.plan_id.as_str(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl CycleWindow {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }
}

/// key: billing-usage-counter -> per tenant, metric, cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCounter {
    pub tenant_id: TenantId,
    pub metric: String,
    pub cycle_start: DateTime<Utc>,
    pub cycle_end: DateTime<Utc>,
    pub consumed: i64,
    pub limit_snapshot: Option<i64>,
    pub version: i64,
    pub archived_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl UsageCounter {
    pub fn open(
        tenant_id: TenantId,
        metric: &str,
        window: CycleWindow,
        limit_snapshot: Option<i64>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            tenant_id,
            metric: metric.to_string(),
            cycle_start: window.start,
            cycle_end: window.end,
            consumed: 0,
            limit_snapshot,
            version: 0,
            archived_at: None,
            updated_at: now,
        }
    }

    pub fn window(&self) -> CycleWindow {
        CycleWindow {
            start: self.cycle_start,
            end: self.cycle_end,
        }
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now >= self.cycle_end
    }

    pub fn remaining(&self) -> Option<i64> {
        self.limit_snapshot
            .map(|limit| limit.saturating_sub(self.consumed).max(0))
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        UsageSnapshot {
            metric: self.metric.clone(),
            consumed: self.consumed,
            limit: self.limit_snapshot,
            remaining: self.remaining(),
            cycle_start: self.cycle_start,
            cycle_end: self.cycle_end,
        }
    }
}

/// Read model backing usage bars ("0/3 sites").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub metric: String,
    pub consumed: i64,
    pub limit: Option<i64>,
    pub remaining: Option<i64>,
    pub cycle_start: DateTime<Utc>,
    pub cycle_end: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    QuotaExceeded,
    SubscriptionInactive,
}

/// Outcome of a metered action. Denials are business results, not errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Decision {
    Allowed {
        remaining: Option<i64>,
        usage: UsageSnapshot,
    },
    Denied {
        reason: DenialReason,
        remaining: Option<i64>,
        usage: UsageSnapshot,
    },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }

    pub fn remaining(&self) -> Option<i64> {
        match self {
            Decision::Allowed { remaining, .. } | Decision::Denied { remaining, .. } => *remaining,
        }
    }

    pub fn denial_reason(&self) -> Option<DenialReason> {
        match self {
            Decision::Allowed { .. } => None,
            Decision::Denied { reason, .. } => Some(*reason),
        }
    }

    pub fn usage(&self) -> &UsageSnapshot {
        match self {
            Decision::Allowed { usage, .. } | Decision::Denied { usage, .. } => usage,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanChangeKind {
    Upgrade,
    Downgrade,
    Cancellation,
    Reactivation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanChangeState {
    Requested,
    PendingEffectiveDate,
    Applied,
}

impl PlanChangeState {
    pub fn can_advance_to(&self, next: PlanChangeState) -> bool {
        matches!(
            (self, next),
            (PlanChangeState::Requested, PlanChangeState::PendingEffectiveDate)
                | (PlanChangeState::Requested, PlanChangeState::Applied)
                | (PlanChangeState::PendingEffectiveDate, PlanChangeState::Applied)
        )
    }
}

/// key: billing-plan-change -> coordinator record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanChange {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub from_plan: String,
    pub to_plan: String,
    pub kind: PlanChangeKind,
    pub state: PlanChangeState,
    pub effective_at: DateTime<Utc>,
    pub requested_at: DateTime<Utc>,
}

impl PlanChange {
    /// Moves to `next` when the state machine allows it.
    pub fn advance(&mut self, next: PlanChangeState) -> bool {
        if !self.state.can_advance_to(next) {
            return false;
        }
        self.state = next;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn plan(id: &str, quotas: &[(&str, Option<i64>)]) -> Plan {
        Plan {
            id: id.to_string(),
            name: id.to_string(),
            amount_cents: 0,
            currency: default_currency(),
            quotas: quotas
                .iter()
                .map(|(metric, limit)| (metric.to_string(), *limit))
                .collect(),
        }
    }

    #[test]
    fn missing_metric_has_zero_limit() {
        let free = plan("free", &[("sites", Some(3))]);
        assert_eq!(free.limit_for("sites"), Some(3));
        assert_eq!(free.limit_for("fixes"), Some(0));
    }

    #[test]
    fn unlimited_plan_covers_finite_plan() {
        let free = plan("free", &[("sites", Some(3)), ("fixes", Some(500))]);
        let agency = plan("agency", &[("sites", None), ("fixes", Some(50_000))]);
        assert!(agency.covers(&free));
        assert!(!free.covers(&agency));
    }

    #[test]
    fn dropping_a_metric_is_not_covered() {
        let pro = plan("pro", &[("sites", Some(10)), ("fixes", Some(5_000))]);
        let sites_only = plan("sites-only", &[("sites", Some(100))]);
        assert!(!sites_only.covers(&pro));
    }

    #[test]
    fn pending_change_takes_effect_at_its_boundary() {
        let anchor = Utc.with_ymd_and_hms(2026, 1, 15, 0, 0, 0).unwrap();
        let boundary = Utc.with_ymd_and_hms(2026, 2, 15, 0, 0, 0).unwrap();
        let subscription = Subscription {
            tenant_id: Uuid::new_v4(),
            plan_id: "pro".to_string(),
            status: SubscriptionStatus::Active,
            cycle_anchor: anchor,
            pending_change: Some(PendingPlanChange {
                plan_id: "free".to_string(),
                effective_at: boundary,
                requested_at: anchor,
            }),
            canceled_at: None,
            version: 0,
            created_at: anchor,
            updated_at: anchor,
        };
        assert_eq!(subscription.plan_in_force_at(anchor), "pro");
        assert_eq!(subscription.plan_in_force_at(boundary), "free");
    }

    #[test]
    fn plan_change_states_only_move_forward() {
        assert!(PlanChangeState::Requested.can_advance_to(PlanChangeState::PendingEffectiveDate));
        assert!(PlanChangeState::PendingEffectiveDate.can_advance_to(PlanChangeState::Applied));
        assert!(!PlanChangeState::Applied.can_advance_to(PlanChangeState::Requested));
        assert!(!PlanChangeState::PendingEffectiveDate.can_advance_to(PlanChangeState::Requested));
    }
}

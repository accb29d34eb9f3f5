use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use entitlement_engine::billing::{
    BillingEngine, CounterBackend, DenialReason, EngineSettings, IncrementOutcome, PgBackend,
    PlanCatalog, PlanChangeState, RolloverOutcome, METRIC_FIXES, METRIC_SITES,
};
use futures_util::future::join_all;
use sqlx::PgPool;
use uuid::Uuid;

// key: billing-tests -> postgres conditional writes
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn postgres_enforces_quota_and_rollover(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let engine = BillingEngine::postgres(
        pool.clone(),
        Arc::new(PlanCatalog::default()),
        EngineSettings::default(),
    );
    let tenant = Uuid::new_v4();
    let anchor = Utc.with_ymd_and_hms(2026, 5, 31, 0, 0, 0).unwrap();
    engine
        .subscriptions()
        .provision(tenant, "free", anchor, anchor)
        .await
        .unwrap();

    let now = anchor + Duration::days(1);
    let entitlements = engine.entitlements();
    assert!(entitlements
        .check_and_consume_at(tenant, METRIC_FIXES, 498, now)
        .await
        .unwrap()
        .is_allowed());
    let denied = entitlements
        .check_and_consume_at(tenant, METRIC_FIXES, 5, now)
        .await
        .unwrap();
    assert_eq!(denied.denial_reason(), Some(DenialReason::QuotaExceeded));
    assert_eq!(denied.remaining(), Some(2));

    // 2026-06-30 is the clamped boundary for a day-31 anchor
    let next_cycle = Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 0).unwrap();
    let counter = engine
        .counters()
        .get_or_create(tenant, METRIC_FIXES, next_cycle)
        .await
        .unwrap();
    assert_eq!(counter.consumed, 0);
    assert_eq!(
        counter.cycle_start,
        Utc.with_ymd_and_hms(2026, 6, 30, 0, 0, 0).unwrap()
    );
    let history = engine.counters().history(tenant, METRIC_FIXES).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].consumed, 498);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn postgres_concurrent_consumption_is_bounded(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let engine = BillingEngine::postgres(
        pool.clone(),
        Arc::new(PlanCatalog::default()),
        EngineSettings::default(),
    );
    let tenant = Uuid::new_v4();
    let anchor = Utc::now();
    engine
        .subscriptions()
        .provision(tenant, "free", anchor, anchor)
        .await
        .unwrap();

    let tasks = (0..12).map(|_| {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .entitlements()
                .check_and_consume_at(tenant, METRIC_SITES, 1, anchor)
                .await
                .unwrap()
                .is_allowed()
        })
    });
    let admitted = join_all(tasks)
        .await
        .into_iter()
        .filter(|joined| matches!(joined, Ok(true)))
        .count();
    assert_eq!(admitted, 3);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn postgres_rollover_and_limit_raise_are_conditional(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let engine = BillingEngine::postgres(
        pool.clone(),
        Arc::new(PlanCatalog::default()),
        EngineSettings::default(),
    );
    let tenant = Uuid::new_v4();
    let anchor = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
    engine
        .subscriptions()
        .provision(tenant, "free", anchor, anchor)
        .await
        .unwrap();
    let first = engine
        .counters()
        .get_or_create(tenant, METRIC_FIXES, anchor)
        .await
        .unwrap();

    let backend = PgBackend::new(pool.clone());
    let stale = backend
        .try_increment(tenant, METRIC_FIXES, anchor - Duration::days(31), 1, anchor)
        .await
        .unwrap();
    assert_eq!(stale, IncrementOutcome::Stale);

    let lowered = backend
        .raise_limit(tenant, METRIC_FIXES, first.cycle_start, Some(10), anchor)
        .await
        .unwrap();
    assert!(lowered.is_none());

    let change = engine
        .plan_changes()
        .request_change(tenant, "agency", anchor + Duration::days(2))
        .await
        .unwrap();
    assert_eq!(change.state, PlanChangeState::Applied);
    let raised = engine
        .counters()
        .get_or_create(tenant, METRIC_FIXES, anchor + Duration::days(2))
        .await
        .unwrap();
    assert_eq!(raised.limit_snapshot, Some(50_000));

    let mut next = first.clone();
    next.cycle_start = first.cycle_end;
    next.cycle_end = first.cycle_end + Duration::days(31);
    let won = backend.rollover(first.cycle_end, &next).await.unwrap();
    assert!(matches!(won, RolloverOutcome::Rolled(_)));
    let lost = backend.rollover(first.cycle_end, &next).await.unwrap();
    assert!(matches!(lost, RolloverOutcome::AlreadyRolled(ref c) if c.cycle_start == next.cycle_start));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn postgres_unlimited_counter_denies_on_overflow(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let engine = BillingEngine::postgres(
        pool.clone(),
        Arc::new(PlanCatalog::default()),
        EngineSettings::default(),
    );
    let tenant = Uuid::new_v4();
    let anchor = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
    engine
        .subscriptions()
        .provision(tenant, "agency", anchor, anchor)
        .await
        .unwrap();
    let counter = engine
        .counters()
        .get_or_create(tenant, METRIC_SITES, anchor)
        .await
        .unwrap();
    assert_eq!(counter.limit_snapshot, None);

    let backend = PgBackend::new(pool.clone());
    let filled = backend
        .try_increment(tenant, METRIC_SITES, counter.cycle_start, i64::MAX - 1, anchor)
        .await
        .unwrap();
    assert!(matches!(filled, IncrementOutcome::Applied(_)));

    let overflow = backend
        .try_increment(tenant, METRIC_SITES, counter.cycle_start, 2, anchor)
        .await
        .unwrap();
    assert!(matches!(overflow, IncrementOutcome::OverLimit(ref c) if c.consumed == i64::MAX - 1));
}

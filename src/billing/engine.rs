use std::sync::Arc;

use sqlx::PgPool;

use super::catalog::PlanCatalog;
use super::counters::UsageCounterStore;
use super::cycle::BillingPeriod;
use super::memory::MemoryBackend;
use super::plan_change::PlanChangeCoordinator;
use super::postgres::PgBackend;
use super::retry::RetryPolicy;
use super::scheduler::CycleScheduler;
use super::service::EntitlementService;
use super::store::{CounterBackend, SubscriptionBackend};
use super::subscriptions::SubscriptionStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineSettings {
    pub period: BillingPeriod,
    pub retry: RetryPolicy,
}

/// key: billing-engine -> wiring shared by the router and the scheduler task
#[derive(Clone)]
pub struct BillingEngine {
    subscriptions: SubscriptionStore,
    counters: UsageCounterStore,
    scheduler: CycleScheduler,
    entitlements: EntitlementService,
    plan_changes: PlanChangeCoordinator,
}

impl BillingEngine {
    pub fn new<B>(backend: Arc<B>, catalog: Arc<PlanCatalog>, settings: EngineSettings) -> Self
    where
        B: SubscriptionBackend + CounterBackend + 'static,
    {
        let subscription_backend: Arc<dyn SubscriptionBackend> = backend.clone();
        let counter_backend: Arc<dyn CounterBackend> = backend;
        let subscriptions = SubscriptionStore::new(subscription_backend, catalog, settings.retry);
        let scheduler = CycleScheduler::new(
            counter_backend.clone(),
            subscriptions.clone(),
            settings.period,
            settings.retry,
        );
        let counters = UsageCounterStore::new(
            counter_backend,
            subscriptions.clone(),
            scheduler.clone(),
            settings.retry,
        );
        let entitlements = EntitlementService::new(subscriptions.clone(), counters.clone());
        let plan_changes =
            PlanChangeCoordinator::new(subscriptions.clone(), counters.clone(), scheduler.clone());
        Self {
            subscriptions,
            counters,
            scheduler,
            entitlements,
            plan_changes,
        }
    }

    pub fn in_memory(catalog: Arc<PlanCatalog>, settings: EngineSettings) -> Self {
        Self::new(Arc::new(MemoryBackend::new()), catalog, settings)
    }

    pub fn postgres(pool: PgPool, catalog: Arc<PlanCatalog>, settings: EngineSettings) -> Self {
        Self::new(Arc::new(PgBackend::new(pool)), catalog, settings)
    }

    pub fn catalog(&self) -> &PlanCatalog {
        self.subscriptions.catalog()
    }

    pub fn subscriptions(&self) -> &SubscriptionStore {
        &self.subscriptions
    }

    pub fn counters(&self) -> &UsageCounterStore {
        &self.counters
    }

    pub fn scheduler(&self) -> &CycleScheduler {
        &self.scheduler
    }

    pub fn entitlements(&self) -> &EntitlementService {
        &self.entitlements
    }

    pub fn plan_changes(&self) -> &PlanChangeCoordinator {
        &self.plan_changes
    }
}

pub mod api;
pub mod catalog;
pub mod counters;
pub mod cycle;
pub mod engine;
pub mod error;
pub mod memory;
pub mod models;
pub mod plan_change;
pub mod postgres;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod subscriptions;

pub use catalog::{CatalogError, PlanCatalog, METRIC_FIXES, METRIC_SITES};
pub use counters::{ConsumeOutcome, UsageCounterStore};
pub use cycle::BillingPeriod;
pub use engine::{BillingEngine, EngineSettings};
pub use error::{BillingError, BillingResult, StoreError};
pub use memory::MemoryBackend;
pub use models::{
    CycleWindow, Decision, DenialReason, PendingPlanChange, Plan, PlanChange, PlanChangeKind,
    PlanChangeState, Subscription, SubscriptionStatus, TenantId, UsageCounter, UsageSnapshot,
};
pub use plan_change::PlanChangeCoordinator;
pub use postgres::PgBackend;
pub use retry::RetryPolicy;
pub use scheduler::{spawn as spawn_cycle_scheduler, CycleScheduler, Rollover, TickReport};
pub use service::EntitlementService;
pub use store::{CounterBackend, IncrementOutcome, InsertOutcome, RolloverOutcome, SubscriptionBackend};
pub use subscriptions::{PromotedChange, SubscriptionStore};

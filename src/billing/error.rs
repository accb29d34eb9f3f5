use thiserror::Error;

use super::models::{SubscriptionStatus, TenantId};

/// Faults raised by a persistence backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conflicting concurrent write")]
    Conflict,
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Conflict | StoreError::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        let unavailable = matches!(
            err,
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
        );
        // serialization_failure, deadlock_detected
        let conflict = matches!(
            &err,
            sqlx::Error::Database(db) if matches!(db.code().as_deref(), Some("40001") | Some("40P01"))
        );
        if unavailable {
            StoreError::Unavailable(err.to_string())
        } else if conflict {
            StoreError::Conflict
        } else {
            StoreError::Database(err)
        }
    }
}

/// key: billing-errors -> terminal vs retryable failures
/// Quota and inactive-subscription outcomes are not errors; they are returned
/// as [`Decision::Denied`](super::models::Decision).
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("unknown plan `{0}`")]
    UnknownPlan(String),
    #[error("no subscription for tenant {0}")]
    NotFound(TenantId),
    #[error("tenant {0} already has a subscription")]
    AlreadyExists(TenantId),
    #[error("requested amount {0} must be non-negative")]
    InvalidAmount(i64),
    #[error("cannot {action} a {} subscription", .status.as_str())]
    InvalidTransition {
        status: SubscriptionStatus,
        action: &'static str,
    },
    #[error("lost a concurrent update on {0}")]
    Contention(String),
    #[error("{operation} failed after {attempts} attempts against the store")]
    TransientStore {
        operation: &'static str,
        attempts: u32,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl BillingError {
    pub fn is_transient(&self) -> bool {
        match self {
            BillingError::Contention(_) => true,
            BillingError::Store(err) => err.is_transient(),
            _ => false,
        }
    }
}

pub type BillingResult<T> = Result<T, BillingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_timeouts_are_transient() {
        let err = StoreError::from(sqlx::Error::PoolTimedOut);
        assert!(err.is_transient());
        assert!(BillingError::from(err).is_transient());
    }

    #[test]
    fn missing_rows_are_fatal() {
        let err = StoreError::from(sqlx::Error::RowNotFound);
        assert!(!err.is_transient());
        assert!(!BillingError::NotFound(TenantId::nil()).is_transient());
    }
}

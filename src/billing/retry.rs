use std::future::Future;
use std::time::Duration;

use tracing::{error, warn};

use super::error::{BillingError, BillingResult};

/// key: billing-retry -> bounded exponential backoff for transient store faults
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            ..Self::default()
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Runs `attempt` until it succeeds, fails terminally, or the attempt budget
    /// is spent. Only transient failures are retried.
    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut attempt: F) -> BillingResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = BillingResult<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut tries = 0;
        loop {
            tries += 1;
            match attempt().await {
                Err(err) if err.is_transient() => {
                    if tries >= max_attempts {
                        error!(?err, operation, attempts = tries, "store retries exhausted");
                        return Err(BillingError::TransientStore {
                            operation,
                            attempts: tries,
                        });
                    }
                    let delay = self.delay_for(tries);
                    warn!(?err, operation, attempt = tries, ?delay, "retrying transient store failure");
                    tokio::time::sleep(delay).await;
                }
                outcome => return outcome,
            }
        }
    }
}

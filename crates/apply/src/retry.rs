//! Bounded optimistic-concurrency retry.

use std::future::Future;
use std::time::Duration;

use colony_core::StoreError;
use metrics::counter;
use tracing::debug;

/// Attempt budget for read-modify-write cycles that may hit a stale resourceVersion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Pause before the second attempt; grows linearly afterwards.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { attempts: 5, backoff: Duration::from_millis(10) }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        Self { attempts: attempts.max(1), backoff }
    }
}

/// Run `op` until it succeeds, fails with something other than a conflict,
/// or the policy's attempts are spent. The last conflict is returned as is.
pub async fn retry_on_conflict<T, F, Fut>(policy: &RetryPolicy, op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    retry_while(policy, StoreError::is_conflict, op).await
}

/// Like [`retry_on_conflict`], but retries every error `retryable` accepts.
pub async fn retry_while<T, P, F, Fut>(policy: &RetryPolicy, retryable: P, mut op: F) -> Result<T, StoreError>
where
    P: Fn(&StoreError) -> bool,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 1u32;
    loop {
        match op().await {
            Err(e) if retryable(&e) && attempt < policy.attempts => {
                if e.is_conflict() {
                    counter!("apply_conflict_retries", 1u64);
                } else {
                    counter!("store_retries", 1u64);
                }
                debug!(attempt, error = %e, "retrying with a fresh read");
                tokio::time::sleep(policy.backoff * attempt).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

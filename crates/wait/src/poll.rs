//! Deadline- and cancellation-bound polling loop.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollError<E> {
    Timeout,
    Cancelled,
    /// The check itself failed; polling stops at once.
    Aborted(E),
}

/// Run `check` immediately and then every `interval` until it yields a value,
/// fails, `timeout` elapses or `cancel` fires. A check in flight when the
/// deadline passes or the token is cancelled is dropped.
pub async fn poll_until<T, E, F, Fut>(
    interval: Duration,
    timeout: Duration,
    cancel: &CancellationToken,
    mut check: F,
) -> Result<T, PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        let res = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PollError::Cancelled),
            _ = sleep_until(deadline) => return Err(PollError::Timeout),
            r = check() => r,
        };
        match res {
            Ok(Some(v)) => return Ok(v),
            Ok(None) => {}
            Err(e) => return Err(PollError::Aborted(e)),
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PollError::Cancelled),
            _ = sleep_until(deadline) => return Err(PollError::Timeout),
            _ = sleep(interval) => {}
        }
    }
}

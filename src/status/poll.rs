//! Generic poll-until loop shared by status waits and fleet agreement.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, Instant};

use crate::Result;

/// How a single poll went.
#[derive(Debug, Clone, PartialEq)]
pub enum Poll<T> {
    Ready(T),
    Pending,
}

/// Terminal state of a poll loop.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome<T> {
    Ready(T),
    TimedOut { elapsed: Duration },
}

/// Call `probe` until it reports [`Poll::Ready`] or `timeout` elapses,
/// resting `rest` between probes. Probes never overlap. Errors from the
/// probe propagate immediately.
pub async fn poll_until<F, Fut, T>(rest: Duration, timeout: Duration, mut probe: F) -> Result<PollOutcome<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Poll<T>>>,
{
    let started = Instant::now();
    loop {
        if let Poll::Ready(value) = probe().await? {
            return Ok(PollOutcome::Ready(value));
        }
        let elapsed = started.elapsed();
        if elapsed >= timeout {
            return Ok(PollOutcome::TimedOut { elapsed });
        }
        sleep(rest.min(timeout - elapsed)).await;
    }
}

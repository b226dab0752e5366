//! Bounded polling against eventually-consistent cluster state.

use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::error::{E2eError, E2eResult};

/// Default upper bound for a resource to reach a state.
pub const DEFAULT_MAX_WAITING_TIME: Duration = Duration::from_secs(300);
/// Polls per default wait, so the interval is `max / iterations`.
pub const DEFAULT_ITERATION_TIMES: u32 = 20;
pub const LONGER_MAX_WAITING_TIME: Duration = Duration::from_secs(15 * 60);
pub const MORE_LONGER_MAX_WAITING_TIME: Duration = Duration::from_secs(30 * 60);
pub const LONGEST_MAX_WAITING_TIME: Duration = Duration::from_secs(60 * 60);

/// Poll interval used for a given overall wait.
#[must_use]
pub fn interval_for(max_wait: Duration) -> Duration {
    max_wait / DEFAULT_ITERATION_TIMES
}

/// Check `condition` now and then every `interval` until it returns
/// `Ok(true)`.
///
/// # Errors
///
/// Returns `WaitTimeout` once `timeout` has elapsed, or the condition's own
/// error, which stops polling immediately.
pub async fn poll<F, Fut>(
    what: &str,
    interval: Duration,
    timeout: Duration,
    mut condition: F,
) -> E2eResult<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = E2eResult<bool>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition().await? {
            return Ok(());
        }
        if Instant::now() + interval > deadline {
            return Err(E2eError::WaitTimeout {
                what: what.to_string(),
                timeout,
            });
        }
        debug!(what, "Condition not met yet, retrying in {interval:?}");
        sleep(interval).await;
    }
}

/// Sample until `matcher` accepts a value and return that value.
///
/// # Errors
///
/// Returns an assertion error carrying the last observed value on timeout.
pub async fn eventually<T, F, Fut, M>(
    what: &str,
    timeout: Duration,
    interval: Duration,
    mut sample: F,
    matcher: M,
) -> E2eResult<T>
where
    T: Debug,
    F: FnMut() -> Fut,
    Fut: Future<Output = T>,
    M: Fn(&T) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        let value = sample().await;
        if matcher(&value) {
            return Ok(value);
        }
        if Instant::now() + interval > deadline {
            return Err(E2eError::assertion(format!(
                "{what}: not satisfied within {timeout:?}, last value {value:?}"
            )));
        }
        sleep(interval).await;
    }
}

/// Sample for `duration` and fail as soon as `matcher` rejects a value.
///
/// # Errors
///
/// Returns an assertion error with the rejected value.
pub async fn consistently<T, F, Fut, M>(
    what: &str,
    duration: Duration,
    interval: Duration,
    mut sample: F,
    matcher: M,
) -> E2eResult<()>
where
    T: Debug,
    F: FnMut() -> Fut,
    Fut: Future<Output = T>,
    M: Fn(&T) -> bool,
{
    let deadline = Instant::now() + duration;
    loop {
        let value = sample().await;
        if !matcher(&value) {
            return Err(E2eError::assertion(format!(
                "{what}: condition broke with value {value:?}"
            )));
        }
        if Instant::now() + interval > deadline {
            return Ok(());
        }
        sleep(interval).await;
    }
}

use std::error::Error as StdError;
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

type BoxedError = Box<dyn StdError + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum WaitError {
    #[error("condition not met within {timeout:?}")]
    Timeout { timeout: Duration },
    #[error("condition check failed: {0}")]
    Predicate(#[source] BoxedError),
}

/// Polls `predicate` until it returns `true`. Checks at least once, even with a zero timeout.
pub fn wait_until<F, E>(predicate: F, timeout: Duration) -> Result<(), WaitError>
where
    F: FnMut() -> Result<bool, E>,
    E: Into<BoxedError>,
{
    wait_until_with_interval(predicate, timeout, MIN_POLL_INTERVAL)
}

pub fn wait_until_with_interval<F, E>(
    mut predicate: F,
    timeout: Duration,
    interval: Duration,
) -> Result<(), WaitError>
where
    F: FnMut() -> Result<bool, E>,
    E: Into<BoxedError>,
{
    let interval = interval.max(MIN_POLL_INTERVAL);
    let deadline = Instant::now() + timeout;
    loop {
        if predicate().map_err(|error| WaitError::Predicate(error.into()))? {
            return Ok(());
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(WaitError::Timeout { timeout });
        }
        thread::sleep(interval.min(deadline - now));
    }
}

//! Readiness waiting with a wall-clock deadline.

use std::future::Future;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::debug;

use crate::{Error, Result};

/// How long and how often to poll a readiness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    /// Hard deadline measured from the first probe.
    pub max_wait: Duration,
    /// Delay between consecutive probes.
    pub poll_interval: Duration,
}

impl WaitPolicy {
    pub const fn new(max_wait: Duration, poll_interval: Duration) -> Self {
        Self {
            max_wait,
            poll_interval,
        }
    }

    /// Default for a database socket coming up in a local container.
    pub const fn database() -> Self {
        Self::new(Duration::from_secs(10), Duration::from_millis(200))
    }

    /// Default for a cluster pod; allows for slow image pulls.
    pub const fn pod() -> Self {
        Self::new(Duration::from_secs(600), Duration::from_secs(2))
    }
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self::database()
    }
}

/// Poll `probe` until it reports ready, returning the number of attempts.
///
/// `Ok(false)` is retried after `poll_interval`. An `Err` from the probe is
/// returned immediately. Once `max_wait` has elapsed without success the
/// wait fails with [`Error::Timeout`]; the last sleep is clipped to the
/// deadline, so the total time spent is at most `max_wait + poll_interval`.
pub async fn wait_until_ready<F, Fut>(what: &str, policy: WaitPolicy, mut probe: F) -> Result<u32>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let started = Instant::now();
    let deadline = started + policy.max_wait;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        if probe().await? {
            debug!(target_name = %what, attempts, elapsed = ?started.elapsed(), "Ready");
            return Ok(attempts);
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(Error::Timeout(format!(
                "{} not ready after {:?} ({} attempts)",
                what, policy.max_wait, attempts
            )));
        }

        debug!(target_name = %what, attempts, "Not ready yet");
        sleep(policy.poll_interval.min(deadline - now)).await;
    }
}

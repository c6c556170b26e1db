//! Readiness polling
//!
//! A fixed-interval, bounded retry loop. Used for two independent waits:
//! a startup banner in process output, and a health endpoint answering
//! over HTTP. Each gets its own [`RetryPolicy`] from configuration.

use std::future::Future;
use std::time::Duration;

use crate::process::OutputBuffer;

/// Fixed-interval retry policy with a hard attempt limit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    /// Create a policy. At least one attempt is always made.
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            interval,
        }
    }

    /// Upper bound on time spent sleeping between attempts
    pub fn max_wait(&self) -> Duration {
        self.interval * self.attempts.saturating_sub(1)
    }
}

/// Run `probe` until it reports ready or the attempts run out
///
/// Individual probe failures are not errors; the caller gets a plain
/// `false` and decides what an unready target means.
pub async fn poll_until<F, Fut>(policy: RetryPolicy, mut probe: F) -> bool
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = bool>,
{
    for attempt in 1..=policy.attempts {
        if probe(attempt).await {
            tracing::debug!(attempt, "Ready");
            return true;
        }
        tracing::trace!(attempt, max = policy.attempts, "Not ready yet");
        if attempt < policy.attempts {
            tokio::time::sleep(policy.interval).await;
        }
    }
    false
}

/// Poll an output buffer for a startup banner
///
/// Gives up early once the stream is closed without the banner.
pub async fn wait_for_output(buffer: &OutputBuffer, banner: &str, policy: RetryPolicy) -> bool {
    poll_until(policy, move |_| async move {
        buffer.contains(banner) || buffer.is_closed()
    })
    .await
        && buffer.contains(banner)
}

//! Execute a RemoteAPI call with retry and failure classification.
//!
//! Every remote call in the engine goes through [`with_retry`]:
//! - each attempt is bounded by `request_timeout` (the attempt future is
//!   dropped on expiry, cancelling the in-flight request);
//! - network-class failures are retried, waiting `attempt × base_delay`;
//! - rejections (4xx) return immediately.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::RemoteError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            request_timeout: Duration::from_secs(15),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, after `attempt` failed
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

/// Run `op` until it succeeds, is rejected, or attempts run out.
///
/// The returned error after exhaustion is the last attempt's error, which
/// is always network class.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, RemoteError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        let outcome = match tokio::time::timeout(policy.request_timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout),
        };

        match outcome {
            Ok(value) => {
                if attempt > 1 {
                    debug!("{} succeeded on attempt {}", label, attempt);
                }
                return Ok(value);
            }
            Err(err) if !err.is_network_class() => {
                debug!("{} rejected: {}", label, err);
                return Err(err);
            }
            Err(err) if attempt >= max_attempts => {
                warn!("{} failed after {} attempts: {}", label, attempt, err);
                return Err(err);
            }
            Err(err) => {
                let delay = policy.backoff(attempt);
                debug!(
                    "{} attempt {}/{} failed ({}), retrying in {:?}",
                    label, attempt, max_attempts, err, delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

//! Consumer retry with exponential backoff
//!
//! Transient handler failures are retried in-process before an event is
//! handed to the dead-letter store. Backoff doubles per attempt up to a cap.

use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total number of attempts (first try included)
    pub max_attempts: u32,
    /// Backoff before the second attempt; doubles on each retry
    pub initial_backoff: Duration,
    /// Cap on exponential growth
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Single attempt, no backoff. For handlers that are already wrapped in
    /// an outer redelivery loop.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }
}

/// Retry a fallible async operation with exponential backoff.
///
/// Returns the first success, or the last error once `max_attempts` is
/// exhausted. `context` tags the log lines (e.g. `"delivery-agent"`).
///
/// # Example
/// ```rust
/// use event_bus::consumer_retry::{retry_with_backoff, RetryConfig};
///
/// # async fn example() -> Result<(), String> {
/// let config = RetryConfig::default();
/// let order_id = retry_with_backoff(
///     || async { Ok::<_, String>("ORD-1A2B3C4D") },
///     &config,
///     "lookup_order",
/// )
/// .await?;
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_backoff<F, Fut, T, E>(
    operation: F,
    config: &RetryConfig,
    context: &str,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display + Send,
{
    // A zero-attempt config would never run the operation
    let max_attempts = config.max_attempts.max(1);
    let mut backoff = config.initial_backoff;

    for attempt in 1..=max_attempts {
        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(
                        context = %context,
                        attempt = attempt,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if attempt >= max_attempts => {
                warn!(
                    context = %context,
                    attempts = attempt,
                    error = %e,
                    "Operation failed after max retries"
                );
                return Err(e);
            }
            Err(e) => {
                warn!(
                    context = %context,
                    attempt = attempt,
                    max_attempts = config.max_attempts,
                    backoff_ms = backoff.as_millis(),
                    error = %e,
                    "Operation failed, retrying with backoff"
                );
                sleep(backoff).await;
                backoff = std::cmp::min(backoff * 2, config.max_backoff);
            }
        }
    }

    unreachable!("loop returns on the final attempt")
}

//! Retry configuration and exponential backoff logic.
//!
//! Retries apply to establishing the transport in
//! [`RpcClient::connect`](crate::RpcClient::connect) only. RPC calls are
//! never retried by the client; a caller that wants to re-issue a call does so
//! explicitly.
//!
//! # Retry Strategy
//!
//! - Only retries [`RpcError::TransportRetryable`](crate::RpcError::TransportRetryable) errors
//! - Uses exponential backoff with randomized jitter
//! - Caps delay at `max_delay`

use std::collections::hash_map::RandomState;
use std::future::Future;
use std::hash::BuildHasher;
use std::time::Duration;
use tokio::time::sleep;

use crate::{log_debug, log_warn, RpcError};

/// Retry configuration with exponential backoff.
///
/// # Example
///
/// ```
/// use trex_rpc::RetryConfig;
/// use std::time::Duration;
///
/// let retry_config = RetryConfig {
///     max_attempts: 5,
///     multiplier: 2.0,
///     initial_delay: Duration::from_millis(100),
///     max_delay: Duration::from_secs(10),
/// };
/// ```
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = no retries, just the initial attempt).
    pub max_attempts: u32,

    /// Backoff multiplier applied to the delay after each retry.
    pub multiplier: f32,

    /// Initial delay before the first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retry attempts (caps exponential growth).
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    /// - `max_attempts`: 3
    /// - `multiplier`: 2.0
    /// - `initial_delay`: 100ms
    /// - `max_delay`: 5s
    fn default() -> Self {
        // ---
        Self {
            max_attempts: 3,
            multiplier: 2.0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// Run `operation`, retrying it on retryable transport errors.
///
/// With `retry_config == None` the operation executes exactly once.
/// Non-retryable errors are returned immediately.
///
/// # Backoff Algorithm
///
/// - First retry: `initial_delay` (with jitter)
/// - Subsequent retries: `min(current_delay * multiplier, max_delay)` (with jitter)
/// - Jitter: ±25%
pub(crate) async fn retry_with_backoff<F, Fut, T>(
    retry_config: Option<&RetryConfig>,
    mut operation: F,
) -> crate::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = crate::Result<T>>,
{
    let Some(retry_config) = retry_config else {
        return operation().await;
    };

    let mut attempt = 0;
    let mut current_delay = retry_config.initial_delay;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(RpcError::TransportRetryable(details)) => {
                attempt += 1;

                if attempt > retry_config.max_attempts {
                    log_warn!(
                        "giving up after {} retries, last error: {}",
                        retry_config.max_attempts,
                        details
                    );
                    return Err(RpcError::TransportRetryable(details));
                }

                let jittered_delay = apply_jitter(current_delay);

                log_debug!(
                    "connect retry {}/{} in {:?} ({})",
                    attempt,
                    retry_config.max_attempts,
                    jittered_delay,
                    details
                );

                sleep(jittered_delay).await;

                let next_delay = Duration::from_secs_f64(
                    current_delay.as_secs_f64() * retry_config.multiplier as f64,
                );
                current_delay = next_delay.min(retry_config.max_delay);
            }
            Err(err) => return Err(err),
        }
    }
}

/// Pseudo-random value from the std hasher's per-instance random keys.
pub(crate) fn random_u64() -> u64 {
    // ---
    RandomState::new().hash_one(std::time::SystemTime::now())
}

/// Multiply `delay` by a random factor in `0.75..1.25`.
fn apply_jitter(delay: Duration) -> Duration {
    // ---
    let random_factor = (random_u64() % 1000) as f64 / 1000.0;
    let jitter_multiplier = 0.75 + (random_factor * 0.5);

    Duration::from_secs_f64(delay.as_secs_f64() * jitter_multiplier)
}

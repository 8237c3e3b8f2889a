//! Fixed-delay retries for async operations
//!
//! Backs the router's bounded delivery retries.

use std::time::Duration;
use tokio::time::sleep;

/// Fixed-delay retry policy
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one; always at least 1
    pub max_attempts: usize,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Policy allowing `retry_limit` retries after the first attempt
    pub fn with_retries(retry_limit: usize, delay: Duration) -> Self {
        Self {
            max_attempts: retry_limit + 1,
            delay,
        }
    }
}

/// Execute an async operation, retrying on error according to `policy`
///
/// The closure receives the zero-based attempt number. The last error is
/// returned once all attempts are used.
///
/// # Examples
/// ```rust
/// use clusterq::core::retry::{retry_async, RetryPolicy};
///
/// # async fn example() -> Result<String, String> {
/// let result = retry_async("create_topic", RetryPolicy::default(), |_attempt| async {
///     Ok::<String, String>("created".to_string())
/// })
/// .await?;
/// # Ok(result)
/// # }
/// ```
pub async fn retry_async<F, T, E, Fut>(
    operation_name: &str,
    policy: RetryPolicy,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match operation(attempt).await {
            Ok(result) => return Ok(result),
            Err(error) if attempt + 1 >= max_attempts => return Err(error),
            Err(error) => {
                log::debug!(
                    "Operation '{}' failed on attempt {}/{}, retrying in {:?}: {}",
                    operation_name,
                    attempt + 1,
                    max_attempts,
                    policy.delay,
                    error
                );
                sleep(policy.delay).await;
                attempt += 1;
            }
        }
    }
}

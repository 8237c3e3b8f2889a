//! Bounded retry for deliveries leaving the node
//!
//! A delivery is retried up to the configured limit with a fixed delay. When
//! the budget is used up the [`FailureCallback`] is told once and the caller
//! gets [`RouterError::Exhausted`]; nothing here panics or blocks a consumer
//! loop for longer than the retry budget.

use crate::core::config::RouterSettings;
use crate::core::retry::{retry_async, RetryPolicy};
use crate::queue::TenantId;
use crate::router::error::{RouterError, RouterResult};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait FailureCallback: Send + Sync {
    async fn on_failure(&self, tenant_id: TenantId, description: &str, error: &RouterError);
}

/// Default callback: log at error level
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingFailureCallback;

#[async_trait]
impl FailureCallback for LoggingFailureCallback {
    async fn on_failure(&self, tenant_id: TenantId, description: &str, error: &RouterError) {
        log::error!("[{}] Can't deliver {}: {}", tenant_id, description, error);
    }
}

#[derive(Clone)]
pub struct RetryingDelivery {
    policy: RetryPolicy,
    on_failure: Arc<dyn FailureCallback>,
}

impl RetryingDelivery {
    pub fn new(retry_limit: usize, retry_delay: Duration) -> Self {
        Self {
            policy: RetryPolicy::with_retries(retry_limit, retry_delay),
            on_failure: Arc::new(LoggingFailureCallback),
        }
    }

    pub fn from_settings(settings: &RouterSettings) -> Self {
        Self::new(settings.retry_limit as usize, settings.retry_delay())
    }

    pub fn with_failure_callback(mut self, callback: Arc<dyn FailureCallback>) -> Self {
        self.on_failure = callback;
        self
    }

    pub fn retry_limit(&self) -> usize {
        self.policy.max_attempts.saturating_sub(1)
    }

    /// Run `attempt` until it succeeds or the retry budget is used
    ///
    /// `attempt` receives the zero-based attempt number.
    pub async fn deliver<T, F, Fut>(
        &self,
        tenant_id: TenantId,
        description: &str,
        mut attempt: F,
    ) -> RouterResult<T>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = RouterResult<T>>,
    {
        let result = retry_async(description, self.policy.clone(), |n| {
            if n > 0 {
                log::warn!("[{}] Retry {} for {}", tenant_id, n, description);
            }
            attempt(n)
        })
        .await;

        match result {
            Ok(value) => Ok(value),
            Err(last) => {
                let error = RouterError::Exhausted {
                    attempts: self.policy.max_attempts.max(1),
                    message: last.to_string(),
                };
                self.on_failure.on_failure(tenant_id, description, &error).await;
                Err(error)
            }
        }
    }
}

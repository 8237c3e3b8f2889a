//! Business-side contracts of a consumer
//!
//! A [`MessageHandler`] processes one envelope at a time and may be invoked
//! again for the same envelope after a retry, timeout or crash, so handlers
//! must be idempotent. Messages that exhaust their retries end up in a
//! [`DeadLetterSink`].

use crate::queue::{Envelope, QueueKey};
use async_trait::async_trait;

/// Failure of a single message; the rest of the pack is unaffected
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError>;
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Called once per message whose retries are exhausted
    async fn dead_letter(&self, queue_key: &QueueKey, envelope: &Envelope, reason: &str);
}

/// Default sink: the message is logged and dropped
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingDeadLetterSink;

#[async_trait]
impl DeadLetterSink for LoggingDeadLetterSink {
    async fn dead_letter(&self, queue_key: &QueueKey, envelope: &Envelope, reason: &str) {
        log::warn!(
            "[{}][{}] {} dropping message {} after retries: {}",
            envelope.tenant_id(),
            envelope
                .entity_id()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "-".to_string()),
            queue_key,
            envelope.correlation_id,
            reason
        );
    }
}

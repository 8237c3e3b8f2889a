//! Queue error types

use crate::core::error_handling::ContextualError;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Broker unavailable, send timed out, connection dropped
    #[error("Transient failure on '{topic}': {message}")]
    Transient { topic: String, message: String },

    /// Another consumer still holds the partition (rebalance in progress)
    #[error("Partition '{topic}' is claimed by another consumer")]
    PartitionBusy { topic: String },

    #[error("Topic not found: {topic}")]
    TopicNotFound { topic: String },

    #[error("Queue backend '{backend}' is not available in this build")]
    UnsupportedBackend { backend: String },

    #[error("{component} is stopped")]
    Stopped { component: String },

    #[error("Envelope codec failure: {message}")]
    Codec { message: String },

    #[error("Internal queue error: {message}")]
    Internal { message: String },
}

impl QueueError {
    /// Whether retrying the same operation later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            QueueError::Transient { .. } | QueueError::PartitionBusy { .. }
        )
    }
}

impl ContextualError for QueueError {
    fn is_user_actionable(&self) -> bool {
        matches!(self, QueueError::UnsupportedBackend { .. })
    }

    fn user_message(&self) -> Option<&str> {
        match self {
            QueueError::UnsupportedBackend { .. } => {
                Some("The configured queue.type is not available in this build; use \"in-memory\"")
            }
            _ => None,
        }
    }
}

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

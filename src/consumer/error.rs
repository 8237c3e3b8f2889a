//! Consumer manager error types

use crate::core::error_handling::ContextualError;
use crate::queue::{QueueError, QueueKey};

#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("Consumer manager for {queue_key} is stopped")]
    AlreadyStopped { queue_key: QueueKey },

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

impl ContextualError for ConsumerError {
    fn is_user_actionable(&self) -> bool {
        match self {
            ConsumerError::Queue(e) => e.is_user_actionable(),
            ConsumerError::AlreadyStopped { .. } => false,
        }
    }

    fn user_message(&self) -> Option<&str> {
        match self {
            ConsumerError::Queue(e) => e.user_message(),
            ConsumerError::AlreadyStopped { .. } => None,
        }
    }
}

pub type ConsumerResult<T> = Result<T, ConsumerError>;

//! Node startup errors

use crate::consumer::ConsumerError;
use crate::core::config::ConfigError;
use crate::core::error_handling::ContextualError;
use crate::partition::PartitionError;
use crate::queue::QueueError;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Partition(#[from] PartitionError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Consumer(#[from] ConsumerError),
}

impl ContextualError for NodeError {
    fn is_user_actionable(&self) -> bool {
        match self {
            NodeError::Config(e) => e.is_user_actionable(),
            NodeError::Partition(e) => e.is_user_actionable(),
            NodeError::Queue(e) => e.is_user_actionable(),
            NodeError::Consumer(e) => e.is_user_actionable(),
        }
    }

    fn user_message(&self) -> Option<&str> {
        match self {
            NodeError::Config(e) => e.user_message(),
            NodeError::Partition(e) => e.user_message(),
            NodeError::Queue(e) => e.user_message(),
            NodeError::Consumer(e) => e.user_message(),
        }
    }
}

pub type NodeResult<T> = Result<T, NodeError>;

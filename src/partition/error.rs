//! Partition service error types

use crate::core::error_handling::ContextualError;
use crate::queue::QueueKey;

#[derive(Debug, thiserror::Error)]
pub enum PartitionError {
    #[error("No queue configured for {queue_key}")]
    UnknownQueue { queue_key: QueueKey },

    #[error("Queue {queue_key} needs at least one partition")]
    InvalidPartitionCount { queue_key: QueueKey },

    #[error("Partition {partition} is out of range for {queue_key} ({partitions} partitions)")]
    PartitionOutOfRange {
        queue_key: QueueKey,
        partition: u32,
        partitions: u32,
    },
}

impl ContextualError for PartitionError {
    fn is_user_actionable(&self) -> bool {
        false
    }

    fn user_message(&self) -> Option<&str> {
        None
    }
}

pub type PartitionResult<T> = Result<T, PartitionError>;

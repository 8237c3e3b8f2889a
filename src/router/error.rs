//! Router error types

use crate::core::error_handling::ContextualError;
use crate::queue::{EntityId, QueueError, TenantId};

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// The entity moved to another node, typically during a rebalance
    #[error("[{tenant_id}][{entity_id}] Entity belongs to external partition {topic}")]
    NotMyPartition {
        tenant_id: TenantId,
        entity_id: EntityId,
        topic: String,
    },

    /// No live service owns the entity's partition right now
    #[error("[{tenant_id}][{entity_id}] No live owner")]
    OwnerUnknown {
        tenant_id: TenantId,
        entity_id: EntityId,
    },

    #[error("Failed to encode notification: {message}")]
    Encode { message: String },

    #[error("Failed to decode notification: {message}")]
    Decode { message: String },

    #[error("Failed to send to '{target}': {source}")]
    Send {
        target: String,
        #[source]
        source: QueueError,
    },

    #[error("Local delivery failed: {message}")]
    Rejected { message: String },

    #[error("Delivery failed after {attempts} attempts: {message}")]
    Exhausted { attempts: usize, message: String },
}

impl RouterError {
    /// Whether this failure is an expected side effect of rebalancing
    pub fn is_ownership_conflict(&self) -> bool {
        matches!(
            self,
            RouterError::NotMyPartition { .. } | RouterError::OwnerUnknown { .. }
        )
    }
}

impl ContextualError for RouterError {
    fn is_user_actionable(&self) -> bool {
        false
    }

    fn user_message(&self) -> Option<&str> {
        None
    }
}

pub type RouterResult<T> = Result<T, RouterError>;

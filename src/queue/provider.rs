//! Backend selection

use crate::core::config::QueueSettings;
use crate::queue::error::{QueueError, QueueResult};
use crate::queue::memory::{InMemoryBroker, InMemoryQueueFactory};
use crate::queue::traits::QueueFactory;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use strum_macros::{Display, EnumString};

/// Broker backends known to the configuration
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum QueueType {
    #[default]
    InMemory,
    Kafka,
    #[serde(rename = "rabbitmq")]
    #[strum(serialize = "rabbitmq")]
    RabbitMq,
    PubSub,
    AwsSqs,
    ServiceBus,
}

/// Build the factory for the configured backend
///
/// Only the in-memory backend is compiled in; any other selection is a
/// fatal startup error.
pub fn create_factory(settings: &QueueSettings) -> QueueResult<Arc<dyn QueueFactory>> {
    match settings.queue_type {
        QueueType::InMemory => {
            log::info!("Using in-memory queue backend");
            Ok(Arc::new(InMemoryQueueFactory::new(
                Arc::new(InMemoryBroker::new()),
                settings,
            )))
        }
        other => Err(QueueError::UnsupportedBackend {
            backend: other.to_string(),
        }),
    }
}

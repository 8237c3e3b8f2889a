//! Per-queue consumer tuning

use crate::core::config::{QueueDefinition, QueueSettings};
use std::time::Duration;

/// Effective settings of one consumer manager
///
/// Starts from the `[queue]` section; a `[[queue.queues]]` entry may override
/// the poll interval, pack timeout, retry budget and task layout.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerConfig {
    pub poll_interval: Duration,
    pub pack_processing_timeout: Duration,
    pub pack_processing_retries: u32,
    /// Concurrent handler dispatches across all partitions of the queue
    pub pool_size: usize,
    /// One task per owned partition, or one task for the whole set
    pub consumer_per_partition: bool,
    /// Grace period for tasks to finish their pack when stopped
    pub stop_timeout: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self::from_settings(&QueueSettings::default())
    }
}

impl ConsumerConfig {
    pub fn from_settings(settings: &QueueSettings) -> Self {
        Self {
            poll_interval: settings.poll_interval(),
            pack_processing_timeout: settings.pack_processing_timeout(),
            pack_processing_retries: settings.pack_processing_retries,
            pool_size: settings.consumer_pool_size.max(1),
            consumer_per_partition: settings.consumer_per_partition,
            stop_timeout: settings.stop_timeout(),
        }
    }

    pub fn for_queue(settings: &QueueSettings, queue: &QueueDefinition) -> Self {
        let mut config = Self::from_settings(settings);
        if let Some(ms) = queue.poll_interval_ms {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = queue.pack_processing_timeout_ms {
            config.pack_processing_timeout = Duration::from_millis(ms);
        }
        if let Some(retries) = queue.pack_processing_retries {
            config.pack_processing_retries = retries;
        }
        if let Some(per_partition) = queue.consumer_per_partition {
            config.consumer_per_partition = per_partition;
        }
        config
    }
}

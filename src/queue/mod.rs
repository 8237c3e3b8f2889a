//! Queue Transport
//!
//! One admin/producer/consumer contract over pluggable broker backends.
//!
//! # Overview
//!
//! - **Identity**: [`QueueKey`] names a logical queue, [`TopicPartitionInfo`]
//!   one physical partition of it.
//! - **Envelope**: opaque payload plus tenant, entity, partition hint and
//!   headers.
//! - **Backends**: chosen once at startup through [`create_factory`]. The
//!   in-memory backend offers per-partition offset logs, committed offsets,
//!   exclusive partition claims and redelivery of uncommitted messages.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  send(tpi)   ┌───────────────────────────────┐
//! │ QueueProducer├─────────────▶│  topic.0  │ 1 │ 2 │ 3 │ 4 │   │
//! └──────────────┘              │  topic.1  │ 1 │ 2 │           │
//!                               └──────┬────────────┬───────────┘
//!                           claim + poll            │ claim + poll
//!                         ┌────────────┴─┐   ┌──────┴───────┐
//!                         │QueueConsumer │   │QueueConsumer │  (one owner per partition)
//!                         └──────────────┘   └──────────────┘
//! ```
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use clusterq::core::config::QueueSettings;
//! use clusterq::queue::{create_factory, Envelope, TenantId, TopicPartitionInfo};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let factory = create_factory(&QueueSettings::default())?;
//! let producer = factory.create_producer("tb_core");
//! let tpi = TopicPartitionInfo::new("tb_core", None, Some(0), true);
//! producer.send(&tpi, Envelope::new(TenantId::SYS, None, b"hello".to_vec())).await?;
//!
//! let mut consumer = factory.create_consumer("tb_core");
//! consumer.subscribe_partitions([tpi].into_iter().collect()).await?;
//! let batch = consumer.poll(Duration::from_millis(100)).await?;
//! consumer.commit().await?;
//! # Ok(())
//! # }
//! ```

mod error;
mod key;
pub mod memory;
mod message;
mod provider;
mod traits;

pub use error::{QueueError, QueueResult};
pub use key::{
    EntityId, QueueKey, ServiceInfo, ServiceType, TenantId, TenantProfileId, TopicPartitionInfo,
    MAIN_QUEUE_NAME,
};
pub use message::{Envelope, SendMetadata, TARGET_SERVICE_HEADER, VERSION_HEADER};
pub use provider::{create_factory, QueueType};
pub use traits::{QueueAdmin, QueueConsumer, QueueFactory, QueueProducer, TopicProperties};

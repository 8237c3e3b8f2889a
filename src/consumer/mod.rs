//! Consumer Manager
//!
//! Per-queue consumer tasks driven by partition ownership, and the pack
//! processing that turns one polled batch into handler calls.
//!
//! # Architecture
//!
//! ```text
//! PartitionChangeEvent ──▶ partition listener ──▶ ConsumerManager::update()
//!                                                     │
//!                      ┌──────────────────────────────┼──────────────┐
//!                      ▼                              ▼              ▼
//!                 task (tb_core.0)              task (tb_core.3)    ...
//!                 poll ─▶ PackProcessor ─▶ commit
//!                              │
//!                  bounded dispatch ─▶ MessageHandler
//! ```
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use clusterq::consumer::{ConsumerConfig, ConsumerManager, HandlerError, MessageHandler};
//! use clusterq::core::config::QueueSettings;
//! use clusterq::notifications::api::AsyncNotificationManager;
//! use clusterq::queue::{create_factory, Envelope, QueueKey, ServiceType, TopicPartitionInfo};
//! use std::sync::Arc;
//!
//! struct Printer;
//!
//! #[async_trait::async_trait]
//! impl MessageHandler for Printer {
//!     async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
//!         println!("{} bytes", envelope.payload.len());
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConsumerManager::new(
//!     QueueKey::main(ServiceType::Core),
//!     "tb_core",
//!     create_factory(&QueueSettings::default())?,
//!     ConsumerConfig::default(),
//!     Arc::new(Printer),
//!     AsyncNotificationManager::new_shared(),
//! );
//! let owned = [TopicPartitionInfo::new("tb_core", None, Some(0), true)];
//! manager.update(owned.into_iter().collect()).await?;
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod handler;
mod listener;
mod manager;
mod notification;
mod pack;
mod task;

pub use config::ConsumerConfig;
pub use error::{ConsumerError, ConsumerResult};
pub use handler::{DeadLetterSink, HandlerError, LoggingDeadLetterSink, MessageHandler};
pub use listener::{launch_partition_listener, ConsumerManagers, ManagerBuilder};
pub use manager::ConsumerManager;
pub use notification::{NotificationConsumer, NOTIFICATIONS_QUEUE_NAME};
pub use pack::{PackOutcome, PackProcessor};

//! Notification Router
//!
//! Moves business events to the node that owns their entity, and pushes
//! edge notifications downstream, both with bounded retries.
//!
//! # Architecture
//!
//! ```text
//!                    route(tenant, entity, body)
//!                               │
//!                 ┌─────────────┴─────────────┐
//!            owned here                  owned by node-b
//!                 │                           │
//!                 ▼                           ▼
//!      NotificationHandler        notifications.node-b topic
//!        (in process)                         │
//!                                             ▼
//!                              node-b: accept_remote (re-checks ownership)
//!                                             │
//!                                             ▼
//!                                  NotificationHandler on node-b
//! ```
//!
//! Delivery is at-least-once: handlers must treat every notification as an
//! idempotent "set latest value" update.
//!
//! Entity owners also hold remote subscriptions ([`SubscriptionRegistry`])
//! and fan updates out to the subscribed services.
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use clusterq::consumer::HandlerError;
//! use clusterq::router::{ClusterNotification, CrossNodeRouter, NotificationBody, NotificationHandler, RetryingDelivery};
//! use clusterq::partition::PartitionService;
//! use clusterq::queue::{EntityId, QueueFactory, TenantId};
//! use async_trait::async_trait;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! struct Apply;
//!
//! #[async_trait]
//! impl NotificationHandler for Apply {
//!     async fn on_notification(&self, _n: &ClusterNotification) -> Result<(), HandlerError> {
//!         Ok(())
//!     }
//! }
//!
//! # async fn example(partitions: Arc<PartitionService>, factory: Arc<dyn QueueFactory>) {
//! let router = CrossNodeRouter::new(
//!     partitions,
//!     factory.create_notifications_producer(),
//!     Arc::new(Apply),
//!     RetryingDelivery::new(3, Duration::from_millis(100)),
//! );
//! let body = NotificationBody::SubscriptionCallback { seq_number: 1 };
//! let outcome = router.route(TenantId::SYS, EntityId::random(), body).await;
//! # let _ = outcome;
//! # }
//! ```

mod cross_node;
pub mod delivery;
pub mod edge;
mod error;
pub mod event;
pub mod subscriptions;

pub use cross_node::{CrossNodeRouter, NotificationHandler, DIRECT_HEADER};
pub use delivery::{FailureCallback, LoggingFailureCallback, RetryingDelivery};
pub use edge::{
    run_edge_stats_reporter, EdgeNotificationPusher, EdgeProcessor, EdgeStats, EdgeStatsSnapshot,
};
pub use error::{RouterError, RouterResult};
pub use event::{
    ClusterNotification, EdgeEventType, EdgeNotification, NotificationBody, RouteOutcome,
    RouteReport, RouteState, SubscriptionKind, SubscriptionUpdate,
};
pub use subscriptions::{launch_subscription_cleanup, SubscriptionRegistry};

#[cfg(test)]
mod tests;

//! Partition Service
//!
//! Deterministic assignment of queue partitions to live services, recomputed
//! on every topology change.
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use clusterq::core::config::ClusterConfig;
//! use clusterq::notifications::api::AsyncNotificationManager;
//! use clusterq::partition::{InMemoryTenantRoutingInfoService, PartitionService};
//! use clusterq::queue::{EntityId, ServiceInfo, ServiceType, TenantId};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let service = PartitionService::new(
//!     &ClusterConfig::default(),
//!     Arc::new(InMemoryTenantRoutingInfoService::new()),
//!     AsyncNotificationManager::new_shared(),
//! )?;
//! let me = ServiceInfo::new("node-a", [ServiceType::Core]);
//! service.recalculate_partitions(me, Vec::new()).await;
//!
//! let tpi = service.resolve_main(ServiceType::Core, TenantId::SYS, EntityId::random());
//! assert!(tpi.my_partition);
//! # Ok(())
//! # }
//! ```

pub mod discovery;
mod error;
pub mod routing;
mod service;
pub mod table;
pub mod topic;

/// Core-service queue carrying edge notifications
pub const EDGE_QUEUE_NAME: &str = "Edge";

pub use discovery::{run_discovery_loop, DiscoveryService, StaticDiscovery};
pub use error::{PartitionError, PartitionResult};
pub use routing::{
    InMemoryTenantRoutingInfoService, QueueDelete, QueueRoutingInfo, QueueUpdate,
    TenantRoutingInfo, TenantRoutingInfoService,
};
pub use service::PartitionService;
pub use table::PartitionTable;
pub use topic::TopicService;

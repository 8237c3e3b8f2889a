//! Cluster coordination core for a multi-tenant IoT platform
//!
//! Decides which node owns which queue partition, moves messages through a
//! broker-agnostic queue transport, runs partitioned consumer groups and
//! routes notifications to the node owning their entity.

pub mod consumer;
pub mod core;
pub mod node;
pub mod notifications;
pub mod partition;
pub mod queue;
pub mod router;

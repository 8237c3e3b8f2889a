//! Shared fixtures for the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use clusterq::consumer::{HandlerError, MessageHandler};
use clusterq::core::config::{ClusterConfig, QueueDefinition};
use clusterq::notifications::api::AsyncNotificationManager;
use clusterq::partition::{InMemoryTenantRoutingInfoService, PartitionService};
use clusterq::queue::{Envelope, ServiceInfo, ServiceType};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

pub const CORE_TOPIC: &str = "tb_core";

/// Core queue with `core_partitions`, rule-engine main queue with `re_partitions`
pub fn cluster_config(core_partitions: u32, re_partitions: u32) -> ClusterConfig {
    let mut config = ClusterConfig::default();
    config.partitions.core_partitions = core_partitions;
    config.queue.queues = vec![QueueDefinition {
        partitions: re_partitions,
        ..QueueDefinition::default()
    }];
    config.queue.poll_interval_ms = 10;
    config.queue.pack_processing_timeout_ms = 500;
    config.queue.stop_timeout_ms = 1000;
    config
}

pub fn partition_service(
    config: &ClusterConfig,
    routing: Arc<InMemoryTenantRoutingInfoService>,
) -> Arc<PartitionService> {
    Arc::new(
        PartitionService::new(config, routing, AsyncNotificationManager::new_shared())
            .expect("valid partition config"),
    )
}

pub fn service(id: &str, types: &[ServiceType]) -> ServiceInfo {
    ServiceInfo::new(id, types.iter().copied())
}

/// The other members of `all`, as seen from `me`
pub fn others(all: &[ServiceInfo], me: &ServiceInfo) -> Vec<ServiceInfo> {
    all.iter()
        .filter(|s| s.service_id != me.service_id)
        .cloned()
        .collect()
}

pub async fn wait_until<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Counts deliveries per payload
#[derive(Default)]
pub struct Recorder {
    seen: Mutex<BTreeMap<Vec<u8>, usize>>,
}

impl Recorder {
    pub fn distinct(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn deliveries(&self, payload: &[u8]) -> usize {
        self.seen.lock().unwrap().get(payload).copied().unwrap_or(0)
    }
}

#[async_trait]
impl MessageHandler for Recorder {
    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        *self
            .seen
            .lock()
            .unwrap()
            .entry(envelope.payload.clone())
            .or_insert(0) += 1;
        Ok(())
    }
}

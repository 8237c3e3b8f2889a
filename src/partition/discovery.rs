//! Cluster membership
//!
//! A [`DiscoveryService`] yields topology snapshots; [`run_discovery_loop`]
//! feeds them into the partition service on every tick.

use crate::core::config::ClusterConfig;
use crate::core::shutdown::ShutdownCoordinator;
use crate::partition::service::PartitionService;
use crate::queue::{ServiceInfo, TenantProfileId};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

#[async_trait]
pub trait DiscoveryService: Send + Sync {
    fn current_service(&self) -> ServiceInfo;

    /// Every other live service
    async fn other_services(&self) -> Vec<ServiceInfo>;
}

/// Membership fixed by configuration, adjustable at runtime
pub struct StaticDiscovery {
    current: ServiceInfo,
    others: ArcSwap<Vec<ServiceInfo>>,
}

impl StaticDiscovery {
    pub fn new(current: ServiceInfo, others: Vec<ServiceInfo>) -> Self {
        Self {
            current,
            others: ArcSwap::from_pointee(others),
        }
    }

    pub fn from_config(config: &ClusterConfig) -> Self {
        let current = ServiceInfo::new(
            config.node.service_id.clone(),
            config.node.service_types.iter().copied(),
        )
        .with_tenant_profiles(
            config
                .node
                .assigned_tenant_profiles
                .iter()
                .map(|p| TenantProfileId(*p)),
        );
        let others = config
            .discovery
            .peers
            .iter()
            .map(|peer| {
                ServiceInfo::new(peer.service_id.clone(), peer.service_types.iter().copied())
                    .with_tenant_profiles(
                        peer.assigned_tenant_profiles
                            .iter()
                            .map(|p| TenantProfileId(*p)),
                    )
            })
            .collect();
        Self::new(current, others)
    }

    pub fn set_others(&self, others: Vec<ServiceInfo>) {
        self.others.store(Arc::new(others));
    }

    pub fn add_service(&self, service: ServiceInfo) {
        self.others.rcu(|others| {
            let mut others: Vec<ServiceInfo> = others
                .iter()
                .filter(|s| s.service_id != service.service_id)
                .cloned()
                .collect();
            others.push(service.clone());
            others
        });
    }

    pub fn remove_service(&self, service_id: &str) {
        self.others.rcu(|others| {
            others
                .iter()
                .filter(|s| s.service_id != service_id)
                .cloned()
                .collect::<Vec<_>>()
        });
    }
}

#[async_trait]
impl DiscoveryService for StaticDiscovery {
    fn current_service(&self) -> ServiceInfo {
        let mut current = self.current.clone();
        current.last_seen = SystemTime::now();
        current
    }

    async fn other_services(&self) -> Vec<ServiceInfo> {
        self.others.load().as_ref().clone()
    }
}

/// Recalculate partitions from `discovery` until shutdown
///
/// The first recalculation happens immediately.
pub async fn run_discovery_loop(
    discovery: Arc<dyn DiscoveryService>,
    partitions: Arc<PartitionService>,
    tick_interval: Duration,
    shutdown: ShutdownCoordinator,
) {
    let mut ticker = tokio::time::interval(tick_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        if shutdown.is_shutdown_requested() {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {
                let current = discovery.current_service();
                let others = discovery.other_services().await;
                partitions.recalculate_partitions(current, others).await;
            }
            _ = shutdown.wait() => break,
        }
    }
    log::debug!("Discovery loop stopped");
}

//! Partition service
//!
//! Answers "which partition does this message go to, and is it mine?" from
//! an immutable [`PartitionTable`] installed by atomic swap. Only
//! recalculation and queue changes write; every `resolve*` call is a
//! lock-free read of the latest snapshot.

use crate::core::config::ClusterConfig;
use crate::notifications::api::{
    publish_logged, Event, PartitionChangeEvent, ServiceEvent, ServiceEventType,
    SharedNotificationManager,
};
use crate::partition::error::{PartitionError, PartitionResult};
use crate::partition::routing::{
    QueueDelete, QueueRoutingInfo, QueueUpdate, TenantRoutingInfo, TenantRoutingInfoService,
};
use crate::partition::table::{resolve_partition_index, PartitionTable};
use crate::partition::topic::TopicService;
use crate::partition::EDGE_QUEUE_NAME;
use crate::queue::{
    EntityId, QueueKey, ServiceInfo, ServiceType, TenantId, TopicPartitionInfo, MAIN_QUEUE_NAME,
};
use arc_swap::ArcSwap;
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

struct Topology {
    current: ServiceInfo,
    others: Vec<ServiceInfo>,
}

pub struct PartitionService {
    topics: TopicService,
    queues: ArcSwap<BTreeMap<QueueKey, QueueRoutingInfo>>,
    table: ArcSwap<PartitionTable>,
    routing: Arc<dyn TenantRoutingInfoService>,
    routing_cache: DashMap<TenantId, TenantRoutingInfo>,
    notifications: SharedNotificationManager,
    // Serialises writers and remembers the topology for queue changes
    topology: Mutex<Option<Topology>>,
}

impl PartitionService {
    /// Service with the core, edge, transport and configured rule-engine queues
    pub fn new(
        config: &ClusterConfig,
        routing: Arc<dyn TenantRoutingInfoService>,
        notifications: SharedNotificationManager,
    ) -> PartitionResult<Self> {
        let topics = TopicService::new(&config.queue);
        let partitions = &config.partitions;

        let mut queues = BTreeMap::new();
        let mut add = |key: QueueKey, topic: &str, count: u32| -> PartitionResult<()> {
            if count == 0 {
                return Err(PartitionError::InvalidPartitionCount { queue_key: key });
            }
            queues.insert(
                key.clone(),
                QueueRoutingInfo {
                    queue_key: key,
                    topic: topics.build_topic_name(topic),
                    partitions: count,
                },
            );
            Ok(())
        };

        add(
            QueueKey::main(ServiceType::Core),
            &partitions.core_topic,
            partitions.core_partitions,
        )?;
        add(
            QueueKey::new(ServiceType::Core, EDGE_QUEUE_NAME, TenantId::SYS),
            &partitions.edge_topic,
            partitions.edge_partitions,
        )?;
        add(
            QueueKey::main(ServiceType::Transport),
            &partitions.transport_topic,
            partitions.transport_partitions,
        )?;
        for definition in config.queue.effective_queues() {
            let update = QueueUpdate::from(&definition);
            add(update.queue_key(), &update.topic, update.partitions)?;
        }

        Ok(Self {
            topics,
            queues: ArcSwap::from_pointee(queues),
            table: ArcSwap::from_pointee(PartitionTable::default()),
            routing,
            routing_cache: DashMap::new(),
            notifications,
            topology: Mutex::new(None),
        })
    }

    pub fn topics(&self) -> &TopicService {
        &self.topics
    }

    /// Snapshot of the current ownership table
    pub fn table(&self) -> Arc<PartitionTable> {
        self.table.load_full()
    }

    fn routing_info(&self, tenant_id: TenantId) -> TenantRoutingInfo {
        if let Some(cached) = self.routing_cache.get(&tenant_id) {
            return cached.clone();
        }
        let info = self
            .routing
            .get_routing_info(tenant_id)
            .unwrap_or_else(|| TenantRoutingInfo::shared(tenant_id));
        self.routing_cache.insert(tenant_id, info.clone());
        info
    }

    fn is_isolated(&self, service_type: ServiceType, tenant_id: TenantId) -> bool {
        service_type == ServiceType::RuleEngine
            && !tenant_id.is_sys()
            && self.routing_info(tenant_id).isolated_rule_engine
    }

    /// Queue key a message of `tenant_id` is routed to
    pub fn resolve_queue_key(
        &self,
        service_type: ServiceType,
        queue_name: &str,
        tenant_id: TenantId,
    ) -> QueueKey {
        let owner = if self.is_isolated(service_type, tenant_id) {
            tenant_id
        } else {
            TenantId::SYS
        };
        QueueKey::new(service_type, queue_name, owner)
    }

    fn topic_partition(&self, info: &QueueRoutingInfo, partition: u32) -> TopicPartitionInfo {
        let key = &info.queue_key;
        TopicPartitionInfo::new(
            info.topic.clone(),
            key.is_isolated().then_some(key.tenant_id),
            Some(partition),
            self.table.load().is_mine(key, partition),
        )
    }

    /// Resolve without fallbacks
    pub fn try_resolve(
        &self,
        service_type: ServiceType,
        queue_name: &str,
        tenant_id: TenantId,
        entity_id: EntityId,
        partition: Option<u32>,
    ) -> PartitionResult<TopicPartitionInfo> {
        let key = self.resolve_queue_key(service_type, queue_name, tenant_id);
        let queues = self.queues.load();
        let info = queues
            .get(&key)
            .ok_or_else(|| PartitionError::UnknownQueue {
                queue_key: key.clone(),
            })?;

        let partition = match partition {
            Some(p) if p < info.partitions => p,
            Some(p) => {
                return Err(PartitionError::PartitionOutOfRange {
                    queue_key: key,
                    partition: p,
                    partitions: info.partitions,
                })
            }
            None => resolve_partition_index(entity_id.as_uuid(), info.partitions),
        };
        Ok(self.topic_partition(info, partition))
    }

    /// Partition of `entity_id` in the named queue
    ///
    /// Never fails. An unknown queue falls back to the main queue of the same
    /// tenant; if that is missing too, the result names the bare topic with
    /// `my_partition == false` so callers treat the work as someone else's.
    pub fn resolve(
        &self,
        service_type: ServiceType,
        queue_name: &str,
        tenant_id: TenantId,
        entity_id: EntityId,
    ) -> TopicPartitionInfo {
        match self.try_resolve(service_type, queue_name, tenant_id, entity_id, None) {
            Ok(tpi) => tpi,
            Err(e) if queue_name != MAIN_QUEUE_NAME => {
                log::debug!("[{}][{}] {}; using main queue", tenant_id, entity_id, e);
                self.resolve(service_type, MAIN_QUEUE_NAME, tenant_id, entity_id)
            }
            Err(e) => {
                log::warn!("[{}][{}] {}", tenant_id, entity_id, e);
                TopicPartitionInfo::new(
                    self.topics.build_topic_name(queue_name),
                    None,
                    None,
                    false,
                )
            }
        }
    }

    /// Like [`resolve`](Self::resolve) but honours an explicit partition
    pub fn resolve_with_partition(
        &self,
        service_type: ServiceType,
        queue_name: &str,
        tenant_id: TenantId,
        entity_id: EntityId,
        partition: Option<u32>,
    ) -> TopicPartitionInfo {
        if partition.is_none() {
            return self.resolve(service_type, queue_name, tenant_id, entity_id);
        }
        match self.try_resolve(service_type, queue_name, tenant_id, entity_id, partition) {
            Ok(tpi) => tpi,
            Err(e) => {
                log::warn!("[{}][{}] {}; resolving by entity", tenant_id, entity_id, e);
                self.resolve(service_type, queue_name, tenant_id, entity_id)
            }
        }
    }

    /// Main queue of a service type
    pub fn resolve_main(
        &self,
        service_type: ServiceType,
        tenant_id: TenantId,
        entity_id: EntityId,
    ) -> TopicPartitionInfo {
        self.resolve(service_type, MAIN_QUEUE_NAME, tenant_id, entity_id)
    }

    /// One entry per partition of the resolved queue (fan-out delivery)
    pub fn resolve_all(
        &self,
        service_type: ServiceType,
        queue_name: &str,
        tenant_id: TenantId,
        entity_id: EntityId,
    ) -> Vec<TopicPartitionInfo> {
        let key = self.resolve_queue_key(service_type, queue_name, tenant_id);
        let queues = self.queues.load();
        match queues.get(&key) {
            Some(info) => (0..info.partitions)
                .map(|p| self.topic_partition(info, p))
                .collect(),
            None => vec![self.resolve(service_type, queue_name, tenant_id, entity_id)],
        }
    }

    pub fn is_my_partition(
        &self,
        service_type: ServiceType,
        tenant_id: TenantId,
        entity_id: EntityId,
    ) -> bool {
        self.resolve_main(service_type, tenant_id, entity_id)
            .my_partition
    }

    /// Service owning the main-queue partition of `entity_id`, if any is live
    pub fn resolve_owner(
        &self,
        service_type: ServiceType,
        tenant_id: TenantId,
        entity_id: EntityId,
    ) -> Option<String> {
        let key = self.resolve_queue_key(service_type, MAIN_QUEUE_NAME, tenant_id);
        let partitions = self.queues.load().get(&key)?.partitions;
        let partition = resolve_partition_index(entity_id.as_uuid(), partitions);
        self.table.load().owner(&key, partition).map(str::to_string)
    }

    pub fn resolve_partition_index(&self, id: &Uuid, partitions: u32) -> u32 {
        resolve_partition_index(id, partitions)
    }

    pub fn get_my_partitions(&self, queue_key: &QueueKey) -> Option<Vec<u32>> {
        self.table
            .load()
            .my_partitions(queue_key)
            .map(|set| set.iter().copied().collect())
    }

    /// Owned partitions of `queue_key` as subscribable topic partitions
    pub fn my_topic_partitions(&self, queue_key: &QueueKey) -> BTreeSet<TopicPartitionInfo> {
        let table = self.table.load();
        let queues = self.queues.load();
        my_topic_partitions(&table, &queues, queue_key)
    }

    pub fn queue_routing_info(&self, queue_key: &QueueKey) -> Option<QueueRoutingInfo> {
        self.queues.load().get(queue_key).cloned()
    }

    pub fn queue_keys(&self, service_type: ServiceType) -> Vec<QueueKey> {
        self.queues
            .load()
            .keys()
            .filter(|k| k.service_type == service_type)
            .cloned()
            .collect()
    }

    pub fn current_service_id(&self) -> String {
        self.table.load().current_service_id().to_string()
    }

    pub fn get_all_service_ids(&self, service_type: ServiceType) -> BTreeSet<String> {
        self.table
            .load()
            .services()
            .filter(|s| s.has_type(service_type))
            .map(|s| s.service_id.clone())
            .collect()
    }

    pub fn get_all_services(&self, service_type: ServiceType) -> Vec<ServiceInfo> {
        self.table
            .load()
            .services()
            .filter(|s| s.has_type(service_type))
            .cloned()
            .collect()
    }

    pub fn get_other_services(&self, service_type: ServiceType) -> Vec<ServiceInfo> {
        let table = self.table.load();
        table
            .services()
            .filter(|s| s.has_type(service_type) && s.service_id != table.current_service_id())
            .cloned()
            .collect()
    }

    pub fn count_services_by_type(&self, service_type: ServiceType) -> usize {
        self.table
            .load()
            .services()
            .filter(|s| s.has_type(service_type))
            .count()
    }

    /// Whether this node processes the tenant's rule-engine traffic
    ///
    /// Nodes without assigned tenant profiles serve everyone; dedicated nodes
    /// serve only tenants of their profiles.
    pub fn is_managed_by_current_service(&self, tenant_id: TenantId) -> bool {
        let table = self.table.load();
        let assigned = match table.current_service() {
            Some(current) => &current.assigned_tenant_profiles,
            None => return true,
        };
        if assigned.is_empty() {
            return true;
        }
        if tenant_id.is_sys() {
            return false;
        }
        self.routing_info(tenant_id)
            .profile_id
            .is_some_and(|profile| assigned.contains(&profile))
    }

    pub fn evict_tenant_info(&self, tenant_id: TenantId) {
        self.routing_cache.remove(&tenant_id);
    }

    /// Recompute ownership for a new topology
    ///
    /// Installs the new table and publishes one [`PartitionChangeEvent`] per
    /// queue whose local partition set changed, plus a service event for every
    /// service that joined or left.
    pub async fn recalculate_partitions(
        &self,
        current: ServiceInfo,
        others: Vec<ServiceInfo>,
    ) -> Vec<PartitionChangeEvent> {
        let mut topology = self.topology.lock().await;

        let before: BTreeMap<String, BTreeSet<ServiceType>> = self
            .table
            .load()
            .services()
            .map(|s| (s.service_id.clone(), s.service_types.clone()))
            .collect();

        let events = self.recompute(&current, &others).await;

        if topology.is_some() {
            let after: BTreeMap<String, BTreeSet<ServiceType>> = self
                .table
                .load()
                .services()
                .map(|s| (s.service_id.clone(), s.service_types.clone()))
                .collect();
            self.publish_membership_changes(&before, &after).await;
        }

        *topology = Some(Topology { current, others });
        events
    }

    async fn publish_membership_changes(
        &self,
        before: &BTreeMap<String, BTreeSet<ServiceType>>,
        after: &BTreeMap<String, BTreeSet<ServiceType>>,
    ) {
        for (service_id, types) in before {
            if !after.contains_key(service_id) {
                log::info!("Service '{}' left the cluster", service_id);
                let event =
                    ServiceEvent::new(ServiceEventType::Shutdown, service_id.clone(), types.clone());
                publish_logged(&self.notifications, Event::Service(event)).await;
            }
        }
        for (service_id, types) in after {
            if !before.contains_key(service_id) {
                log::info!("Service '{}' joined the cluster", service_id);
                let event =
                    ServiceEvent::new(ServiceEventType::Joined, service_id.clone(), types.clone());
                publish_logged(&self.notifications, Event::Service(event)).await;
            }
        }
    }

    async fn recompute(
        &self,
        current: &ServiceInfo,
        others: &[ServiceInfo],
    ) -> Vec<PartitionChangeEvent> {
        let previous = self.table.load_full();
        let queues = self.queues.load_full();
        let table = PartitionTable::compute(current, others, &queues, |tenant_id| {
            self.routing_info(tenant_id).profile_id
        });

        let empty = BTreeSet::new();
        let keys: BTreeSet<&QueueKey> = previous
            .all_my_partitions()
            .keys()
            .chain(table.all_my_partitions().keys())
            .collect();

        let events: Vec<PartitionChangeEvent> = keys
            .into_iter()
            .filter(|key| {
                previous.my_partitions(key).unwrap_or(&empty)
                    != table.my_partitions(key).unwrap_or(&empty)
            })
            .map(|key| {
                PartitionChangeEvent::new(key.clone(), my_topic_partitions(&table, &queues, key))
            })
            .collect();

        self.table.store(Arc::new(table));

        for event in &events {
            let partitions: Vec<u32> = event.partitions.iter().filter_map(|p| p.partition).collect();
            log::info!("[{}] My partitions: {:?}", event.queue_key, partitions);
            publish_logged(&self.notifications, Event::Partition(event.clone())).await;
        }
        events
    }

    async fn recompute_with_last_topology(&self) -> Vec<PartitionChangeEvent> {
        let topology = self.topology.lock().await;
        match topology.as_ref() {
            Some(t) => self.recompute(&t.current, &t.others).await,
            None => Vec::new(),
        }
    }

    /// Create or resize rule-engine queues and recompute right away
    pub async fn update_queues(
        &self,
        updates: Vec<QueueUpdate>,
    ) -> PartitionResult<Vec<PartitionChangeEvent>> {
        if let Some(bad) = updates.iter().find(|u| u.partitions == 0) {
            return Err(PartitionError::InvalidPartitionCount {
                queue_key: bad.queue_key(),
            });
        }

        self.queues.rcu(|queues| {
            let mut queues = (**queues).clone();
            for update in &updates {
                let key = update.queue_key();
                queues.insert(
                    key.clone(),
                    QueueRoutingInfo {
                        queue_key: key,
                        topic: self.topics.build_topic_name(&update.topic),
                        partitions: update.partitions,
                    },
                );
            }
            queues
        });
        for update in &updates {
            log::info!(
                "[{}] Queue '{}' updated: {} partitions",
                update.tenant_id,
                update.queue_name,
                update.partitions
            );
        }

        Ok(self.recompute_with_last_topology().await)
    }

    pub async fn remove_queues(&self, deletes: Vec<QueueDelete>) -> Vec<PartitionChangeEvent> {
        let keys: BTreeSet<QueueKey> = deletes.iter().map(QueueDelete::queue_key).collect();
        self.remove_queue_keys(|key| keys.contains(key)).await
    }

    /// Forget a tenant: cached routing info and its isolated queues
    pub async fn remove_tenant(&self, tenant_id: TenantId) -> Vec<PartitionChangeEvent> {
        self.evict_tenant_info(tenant_id);
        if tenant_id.is_sys() {
            return Vec::new();
        }
        self.remove_queue_keys(|key| key.tenant_id == tenant_id).await
    }

    async fn remove_queue_keys<F>(&self, matches: F) -> Vec<PartitionChangeEvent>
    where
        F: Fn(&QueueKey) -> bool,
    {
        self.queues.rcu(|queues| {
            let mut queues = (**queues).clone();
            queues.retain(|key, _| !matches(key));
            queues
        });
        self.recompute_with_last_topology().await
    }
}

fn my_topic_partitions(
    table: &PartitionTable,
    queues: &BTreeMap<QueueKey, QueueRoutingInfo>,
    queue_key: &QueueKey,
) -> BTreeSet<TopicPartitionInfo> {
    let (Some(info), Some(mine)) = (queues.get(queue_key), table.my_partitions(queue_key)) else {
        return BTreeSet::new();
    };
    mine.iter()
        .map(|p| {
            TopicPartitionInfo::new(
                info.topic.clone(),
                queue_key.is_isolated().then_some(queue_key.tenant_id),
                Some(*p),
                true,
            )
        })
        .collect()
}

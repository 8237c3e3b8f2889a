//! Remote subscriptions
//!
//! The node owning an entity's partition keeps track of which services
//! asked for its updates, so [`CrossNodeRouter::notify_subscribers`] can fan
//! each update out to them. Records follow ownership: services that left the
//! cluster and entities that moved to another node are dropped by the
//! cleanup task started with [`launch_subscription_cleanup`].
//!
//! [`CrossNodeRouter::notify_subscribers`]: crate::router::CrossNodeRouter::notify_subscribers

use crate::core::shutdown::ShutdownCoordinator;
use crate::notifications::api::{
    Event, EventFilter, ServiceEventType, SharedNotificationManager,
};
use crate::partition::PartitionService;
use crate::queue::{EntityId, ServiceType, TenantId};
use crate::router::error::{RouterError, RouterResult};
use crate::router::event::{SubscriptionKind, SubscriptionUpdate};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::task::JoinHandle;

#[derive(Debug)]
struct EntitySubscriptions {
    tenant_id: TenantId,
    services: BTreeMap<String, BTreeSet<SubscriptionKind>>,
}

pub struct SubscriptionRegistry {
    service_type: ServiceType,
    partitions: Arc<PartitionService>,
    entities: DashMap<EntityId, EntitySubscriptions>,
}

impl SubscriptionRegistry {
    /// Registry for entities of the core service
    pub fn new(partitions: Arc<PartitionService>) -> Self {
        Self {
            service_type: ServiceType::Core,
            partitions,
            entities: DashMap::new(),
        }
    }

    pub fn with_service_type(mut self, service_type: ServiceType) -> Self {
        self.service_type = service_type;
        self
    }

    pub fn service_type(&self) -> ServiceType {
        self.service_type
    }

    /// Record what `update.service_id` wants to hear about `entity_id`
    ///
    /// Only the entity's owner keeps subscriptions; anywhere else this fails
    /// with [`RouterError::NotMyPartition`].
    pub fn update(
        &self,
        tenant_id: TenantId,
        entity_id: EntityId,
        update: &SubscriptionUpdate,
    ) -> RouterResult<()> {
        let tpi = self
            .partitions
            .resolve_main(self.service_type, tenant_id, entity_id);
        if !tpi.my_partition {
            log::warn!(
                "[{}][{}][{}] Subscription belongs to external partition {}",
                tenant_id,
                entity_id,
                update.service_id,
                tpi
            );
            return Err(RouterError::NotMyPartition {
                tenant_id,
                entity_id,
                topic: tpi.full_topic_name(),
            });
        }

        if update.kinds.is_empty() {
            if let Entry::Occupied(mut entry) = self.entities.entry(entity_id) {
                entry.get_mut().services.remove(&update.service_id);
                if entry.get().services.is_empty() {
                    entry.remove();
                }
            }
        } else {
            self.entities
                .entry(entity_id)
                .or_insert_with(|| EntitySubscriptions {
                    tenant_id,
                    services: BTreeMap::new(),
                })
                .services
                .insert(update.service_id.clone(), update.kinds.clone());
        }
        log::trace!(
            "[{}][{}] {} now subscribed to {:?}",
            tenant_id,
            entity_id,
            update.service_id,
            update.kinds
        );
        Ok(())
    }

    /// Services subscribed to `kind` updates of `entity_id`
    pub fn subscribers(&self, entity_id: EntityId, kind: SubscriptionKind) -> Vec<String> {
        self.entities
            .get(&entity_id)
            .map(|subs| {
                subs.services
                    .iter()
                    .filter(|(_, kinds)| kinds.contains(&kind))
                    .map(|(service_id, _)| service_id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Forget every subscription of `service_id`; returns how many were dropped
    pub fn remove_service(&self, service_id: &str) -> usize {
        let mut removed = 0;
        self.entities.retain(|_, subs| {
            if subs.services.remove(service_id).is_some() {
                removed += 1;
            }
            !subs.services.is_empty()
        });
        removed
    }

    /// Drop entities whose partition moved away; returns how many were dropped
    pub fn retain_owned(&self) -> usize {
        let before = self.entities.len();
        self.entities.retain(|entity_id, subs| {
            self.partitions
                .is_my_partition(self.service_type, subs.tenant_id, *entity_id)
        });
        before.saturating_sub(self.entities.len())
    }

    /// Entities with at least one subscriber
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

/// Keep `registry` in line with cluster membership until shutdown
///
/// Subscribed before this returns, like the partition listener.
pub async fn launch_subscription_cleanup(
    registry: Arc<SubscriptionRegistry>,
    notifications: SharedNotificationManager,
    shutdown: ShutdownCoordinator,
) -> JoinHandle<()> {
    let subscriber_id = format!("subscription-cleanup:{}", registry.service_type());
    let (mut receiver, statistics) = {
        let mut bus = notifications.lock().await;
        let receiver = bus.subscribe(
            subscriber_id.clone(),
            EventFilter::PartitionAndService,
            "router".to_string(),
        );
        (receiver, bus.get_subscriber_statistics(&subscriber_id))
    };

    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = receiver.recv() => {
                    let Some(event) = event else { break };
                    if let Some(statistics) = &statistics {
                        statistics.decrement_queue_size();
                    }
                    apply_membership_event(&registry, &event);
                }
                _ = shutdown.wait() => break,
            }
        }
        notifications.lock().await.unsubscribe(&subscriber_id);
        log::debug!("Subscription cleanup '{}' stopped", subscriber_id);
    })
}

fn apply_membership_event(registry: &SubscriptionRegistry, event: &Event) {
    match event {
        Event::Service(left)
            if left.event_type == ServiceEventType::Shutdown
                && left.service_types.contains(&registry.service_type()) =>
        {
            let removed = registry.remove_service(&left.service_id);
            log::info!(
                "[{}] Removed {} subscription records after service shutdown",
                left.service_id,
                removed
            );
        }
        Event::Partition(change) if change.queue_key.service_type == registry.service_type() => {
            let removed = registry.retain_owned();
            if removed > 0 {
                log::debug!(
                    "[{}] Dropped subscriptions of {} entities no longer owned",
                    change.queue_key,
                    removed
                );
            }
        }
        _ => {}
    }
}

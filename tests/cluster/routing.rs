//! Redelivered notifications leave the same end state

use crate::common::{cluster_config, partition_service, service};
use async_trait::async_trait;
use clusterq::consumer::HandlerError;
use clusterq::core::config::QueueSettings;
use clusterq::partition::{InMemoryTenantRoutingInfoService, PartitionService};
use clusterq::queue::memory::{InMemoryBroker, InMemoryQueueFactory};
use clusterq::queue::{EntityId, QueueFactory, ServiceType, TenantId};
use clusterq::router::{
    ClusterNotification, CrossNodeRouter, NotificationBody, NotificationHandler, RetryingDelivery,
    RouteOutcome,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Snapshot = BTreeMap<EntityId, BTreeMap<String, serde_json::Value>>;

/// Last write wins per attribute
#[derive(Default)]
struct AttributeStore {
    state: Mutex<Snapshot>,
}

#[async_trait]
impl NotificationHandler for AttributeStore {
    async fn on_notification(
        &self,
        notification: &ClusterNotification,
    ) -> Result<(), HandlerError> {
        if let NotificationBody::AttributesUpdate { values, .. } = &notification.body {
            let mut state = self.state.lock().unwrap();
            let attributes = state.entry(notification.entity_id).or_default();
            for (key, value) in values {
                attributes.insert(key.clone(), value.clone());
            }
        }
        Ok(())
    }
}

struct Node {
    partitions: Arc<PartitionService>,
    router: CrossNodeRouter,
    store: Arc<AttributeStore>,
}

async fn node(broker: &Arc<InMemoryBroker>, me: &str, other: &str) -> Node {
    let partitions = partition_service(
        &cluster_config(6, 1),
        Arc::new(InMemoryTenantRoutingInfoService::new()),
    );
    partitions
        .recalculate_partitions(
            service(me, &[ServiceType::Core]),
            vec![service(other, &[ServiceType::Core])],
        )
        .await;
    let store = Arc::new(AttributeStore::default());
    let factory = InMemoryQueueFactory::new(broker.clone(), &QueueSettings::default());
    let router = CrossNodeRouter::new(
        partitions.clone(),
        factory.create_notifications_producer(),
        store.clone(),
        RetryingDelivery::new(3, Duration::from_millis(1)),
    );
    Node {
        partitions,
        router,
        store,
    }
}

fn update(tenant: TenantId, entity: EntityId, values: &[(&str, i64)]) -> ClusterNotification {
    ClusterNotification::new(
        tenant,
        entity,
        NotificationBody::AttributesUpdate {
            scope: "SHARED_SCOPE".to_string(),
            values: values
                .iter()
                .map(|(k, v)| (k.to_string(), serde_json::json!(v)))
                .collect(),
        },
    )
}

/// Route `events` from node-a, deliver node-b's inbox, return both stores
async fn run(events: &[ClusterNotification]) -> (Snapshot, Snapshot) {
    let broker = Arc::new(InMemoryBroker::new());
    let a = node(&broker, "node-a", "node-b").await;
    let b = node(&broker, "node-b", "node-a").await;

    for event in events {
        a.router.route_notification(event.clone()).await.result.unwrap();
    }
    let (inbox, _) = broker.read("notifications.node-b", 0, 1000).unwrap();
    for envelope in &inbox {
        b.router.accept_remote(envelope).await.unwrap();
    }

    let a_state = a.store.state.lock().unwrap().clone();
    let b_state = b.store.state.lock().unwrap().clone();
    (a_state, b_state)
}

/// Entities owned by node-a and node-b under the two-node topology
async fn entities(tenant: TenantId) -> (EntityId, EntityId) {
    let broker = Arc::new(InMemoryBroker::new());
    let a = node(&broker, "node-a", "node-b").await;
    let pick = |mine: bool| loop {
        let entity = EntityId::random();
        if a.partitions.is_my_partition(ServiceType::Core, tenant, entity) == mine {
            return entity;
        }
    };
    (pick(true), pick(false))
}

#[tokio::test]
async fn test_routing_twice_equals_routing_once() {
    let tenant = TenantId::random();
    let (local, remote) = entities(tenant).await;
    let events = vec![
        update(tenant, local, &[("temperature", 20), ("humidity", 40)]),
        update(tenant, remote, &[("temperature", 31)]),
        update(tenant, local, &[("temperature", 22)]),
        update(tenant, remote, &[("state", 1)]),
    ];

    let once = run(&events).await;

    // every event redelivered right after itself
    let twice: Vec<ClusterNotification> = events
        .iter()
        .flat_map(|e| [e.clone(), e.clone()])
        .collect();
    assert_eq!(run(&twice).await, once);

    let (local_state, remote_state) = once;
    assert_eq!(local_state[&local]["temperature"], 22);
    assert_eq!(local_state[&local]["humidity"], 40);
    assert_eq!(remote_state[&remote]["temperature"], 31);
    assert_eq!(remote_state[&remote]["state"], 1);
    assert!(!local_state.contains_key(&remote));
    assert!(!remote_state.contains_key(&local));
}

#[tokio::test]
async fn test_route_outcome_follows_ownership() {
    let tenant = TenantId::random();
    let (local, remote) = entities(tenant).await;
    let broker = Arc::new(InMemoryBroker::new());
    let a = node(&broker, "node-a", "node-b").await;

    assert_eq!(
        a.router.route(tenant, local, update(tenant, local, &[]).body).await.unwrap(),
        RouteOutcome::DeliveredLocal
    );
    assert_eq!(
        a.router.route(tenant, remote, update(tenant, remote, &[]).body).await.unwrap(),
        RouteOutcome::SentRemote {
            target_service_id: "node-b".to_string()
        }
    );
}

//! Cross-node routing between two in-process nodes sharing one broker

use super::*;
use crate::consumer::{HandlerError, MessageHandler};
use crate::core::config::{ClusterConfig, QueueSettings};
use crate::core::shutdown::ShutdownCoordinator;
use crate::notifications::api::{AsyncNotificationManager, SharedNotificationManager};
use crate::partition::{InMemoryTenantRoutingInfoService, PartitionService};
use crate::queue::memory::{InMemoryBroker, InMemoryQueueFactory};
use crate::queue::{EntityId, Envelope, QueueFactory, ServiceInfo, ServiceType, TenantId};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Keeps the latest attribute values per entity
#[derive(Default)]
struct AttributeStore {
    values: DashMap<EntityId, BTreeMap<String, serde_json::Value>>,
    applied: AtomicUsize,
    reject: AtomicUsize,
}

#[async_trait]
impl NotificationHandler for AttributeStore {
    async fn on_notification(
        &self,
        notification: &ClusterNotification,
    ) -> Result<(), HandlerError> {
        if self
            .reject
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(HandlerError::new("store unavailable"));
        }
        self.applied.fetch_add(1, Ordering::SeqCst);
        if let NotificationBody::AttributesUpdate { values, .. } = &notification.body {
            let mut entry = self.values.entry(notification.entity_id).or_default();
            for (key, value) in values {
                entry.insert(key.clone(), value.clone());
            }
        }
        Ok(())
    }
}

struct Node {
    bus: SharedNotificationManager,
    partitions: Arc<PartitionService>,
    subscriptions: Arc<SubscriptionRegistry>,
    router: CrossNodeRouter,
    store: Arc<AttributeStore>,
}

fn core(id: &str) -> ServiceInfo {
    ServiceInfo::new(id, [ServiceType::Core])
}

async fn node(broker: &Arc<InMemoryBroker>, me: &str, others: &[&str]) -> Node {
    let mut config = ClusterConfig::default();
    config.partitions.core_partitions = 6;
    let bus = AsyncNotificationManager::new_shared();
    let partitions = Arc::new(
        PartitionService::new(
            &config,
            Arc::new(InMemoryTenantRoutingInfoService::new()),
            bus.clone(),
        )
        .unwrap(),
    );
    partitions
        .recalculate_partitions(core(me), others.iter().map(|id| core(id)).collect())
        .await;

    let factory = InMemoryQueueFactory::new(broker.clone(), &QueueSettings::default());
    let store = Arc::new(AttributeStore::default());
    let subscriptions = Arc::new(SubscriptionRegistry::new(partitions.clone()));
    let router = CrossNodeRouter::new(
        partitions.clone(),
        factory.create_notifications_producer(),
        store.clone(),
        RetryingDelivery::new(3, Duration::from_millis(1)),
    )
    .with_subscriptions(subscriptions.clone());
    Node {
        bus,
        partitions,
        subscriptions,
        router,
        store,
    }
}

async fn pair() -> (Arc<InMemoryBroker>, Node, Node) {
    let broker = Arc::new(InMemoryBroker::new());
    let a = node(&broker, "node-a", &["node-b"]).await;
    let b = node(&broker, "node-b", &["node-a"]).await;
    (broker, a, b)
}

/// A random entity whose core partition belongs to `owner`
fn entity_owned_by(owner: &Node, tenant_id: TenantId) -> EntityId {
    loop {
        let entity_id = EntityId::random();
        if owner
            .partitions
            .is_my_partition(ServiceType::Core, tenant_id, entity_id)
        {
            return entity_id;
        }
    }
}

fn attributes(key: &str, value: i64) -> NotificationBody {
    NotificationBody::AttributesUpdate {
        scope: "SERVER_SCOPE".to_string(),
        values: BTreeMap::from([(key.to_string(), serde_json::json!(value))]),
    }
}

fn inbox(broker: &InMemoryBroker, service_id: &str) -> Vec<Envelope> {
    broker
        .read(&format!("notifications.{}", service_id), 0, 100)
        .unwrap()
        .0
}

#[tokio::test]
async fn test_owned_entity_is_delivered_locally() {
    let (broker, a, _b) = pair().await;
    let tenant = TenantId::random();
    let entity = entity_owned_by(&a, tenant);

    let report = a
        .router
        .route_notification(ClusterNotification::new(tenant, entity, attributes("temp", 21)))
        .await;

    assert_eq!(report.result.unwrap(), RouteOutcome::DeliveredLocal);
    assert_eq!(
        report.states,
        vec![
            RouteState::Created,
            RouteState::Routing,
            RouteState::DeliveredLocal,
            RouteState::Acked
        ]
    );
    assert_eq!(a.store.values.get(&entity).unwrap()["temp"], 21);
    assert!(inbox(&broker, "node-b").is_empty());
}

#[tokio::test]
async fn test_foreign_entity_is_sent_to_owner_topic() {
    let (broker, a, b) = pair().await;
    let tenant = TenantId::random();
    let entity = entity_owned_by(&b, tenant);

    let outcome = a.router.route(tenant, entity, attributes("temp", 30)).await.unwrap();
    assert_eq!(
        outcome,
        RouteOutcome::SentRemote {
            target_service_id: "node-b".to_string()
        }
    );
    assert_eq!(a.store.applied.load(Ordering::SeqCst), 0);

    let delivered = inbox(&broker, "node-b");
    assert_eq!(delivered.len(), 1);
    assert_eq!(
        delivered[0].header(crate::queue::TARGET_SERVICE_HEADER),
        Some("node-b")
    );

    let accepted = b.router.accept_remote(&delivered[0]).await.unwrap();
    assert_eq!(accepted.entity_id, entity);
    assert_eq!(b.store.values.get(&entity).unwrap()["temp"], 30);
}

#[tokio::test]
async fn test_duplicate_delivery_keeps_latest_value() {
    let (broker, a, b) = pair().await;
    let tenant = TenantId::random();
    let entity = entity_owned_by(&b, tenant);

    let first = ClusterNotification::new(tenant, entity, attributes("mode", 1));
    let second = ClusterNotification::new(tenant, entity, attributes("mode", 2));
    a.router.route_notification(first.clone()).await.result.unwrap();
    a.router.route_notification(second).await.result.unwrap();
    // redelivery of the first event after a consumer restart
    a.router.route_notification(first).await.result.unwrap();

    for envelope in inbox(&broker, "node-b") {
        b.router.accept_remote(&envelope).await.unwrap();
    }
    assert_eq!(b.store.applied.load(Ordering::SeqCst), 3);
    // no merge semantics: the store holds whatever arrived last
    assert_eq!(b.store.values.get(&entity).unwrap()["mode"], 1);
    assert_eq!(b.store.values.get(&entity).unwrap().len(), 1);
}

#[tokio::test]
async fn test_receiver_rejects_entity_it_no_longer_owns() {
    let (broker, a, b) = pair().await;
    let tenant = TenantId::random();
    let entity = entity_owned_by(&b, tenant);
    a.router.route(tenant, entity, attributes("temp", 5)).await.unwrap();
    let envelope = inbox(&broker, "node-b").remove(0);

    // the envelope reaches node-a instead, which does not own the entity
    let result = a.router.accept_remote(&envelope).await;
    match result {
        Err(e @ RouterError::NotMyPartition { .. }) => assert!(e.is_ownership_conflict()),
        other => panic!("expected NotMyPartition, got {:?}", other),
    }
    assert_eq!(a.store.applied.load(Ordering::SeqCst), 0);
    assert!(b.store.values.get(&entity).is_none());
}

#[tokio::test]
async fn test_direct_send_skips_ownership_check() {
    let (broker, a, b) = pair().await;
    let tenant = TenantId::random();
    let entity = entity_owned_by(&a, tenant);

    let notification = ClusterNotification::new(
        tenant,
        entity,
        NotificationBody::SubscriptionCallback { seq_number: 4 },
    );
    let outcome = a.router.send_to_service("node-b", notification).await.unwrap();
    assert_eq!(
        outcome,
        RouteOutcome::SentRemote {
            target_service_id: "node-b".to_string()
        }
    );

    let envelope = inbox(&broker, "node-b").remove(0);
    assert_eq!(envelope.header(DIRECT_HEADER), Some("true"));
    b.router.accept_remote(&envelope).await.unwrap();
    assert_eq!(b.store.applied.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_send_to_self_is_local() {
    let (_broker, a, _b) = pair().await;
    let notification = ClusterNotification::new(
        TenantId::SYS,
        EntityId::random(),
        NotificationBody::SubscriptionCallback { seq_number: 1 },
    );
    let outcome = a.router.send_to_service("node-a", notification).await.unwrap();
    assert_eq!(outcome, RouteOutcome::DeliveredLocal);
    assert_eq!(a.store.applied.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_transient_send_failures_are_retried() {
    let (broker, a, b) = pair().await;
    let tenant = TenantId::random();
    let entity = entity_owned_by(&b, tenant);
    broker.inject_send_failures(2);

    let report = a
        .router
        .route_notification(ClusterNotification::new(tenant, entity, attributes("x", 1)))
        .await;

    assert!(report.result.is_ok());
    assert_eq!(report.attempts(), 3);
    assert_eq!(
        report
            .states
            .iter()
            .filter(|s| **s == RouteState::Retrying)
            .count(),
        2
    );
    assert_eq!(report.final_state(), RouteState::Acked);
    assert_eq!(inbox(&broker, "node-b").len(), 1);
}

#[tokio::test]
async fn test_exhausted_send_is_failed_terminal() {
    let (broker, a, b) = pair().await;
    let tenant = TenantId::random();
    let entity = entity_owned_by(&b, tenant);
    broker.inject_send_failures(10);

    let report = a
        .router
        .route_notification(ClusterNotification::new(tenant, entity, attributes("x", 1)))
        .await;

    assert!(matches!(
        report.result,
        Err(RouterError::Exhausted { attempts: 4, .. })
    ));
    assert_eq!(report.final_state(), RouteState::FailedTerminal);
    assert_eq!(report.attempts(), 4);
}

#[tokio::test]
async fn test_local_rejections_are_retried() {
    let (_broker, a, _b) = pair().await;
    let tenant = TenantId::random();
    let entity = entity_owned_by(&a, tenant);
    a.store.reject.store(1, Ordering::SeqCst);

    let report = a
        .router
        .route_notification(ClusterNotification::new(tenant, entity, attributes("x", 9)))
        .await;
    assert_eq!(report.attempts(), 2);
    assert_eq!(report.result.unwrap(), RouteOutcome::DeliveredLocal);
    assert_eq!(a.store.values.get(&entity).unwrap()["x"], 9);
}

#[tokio::test]
async fn test_no_live_owner_fails_closed() {
    let broker = Arc::new(InMemoryBroker::new());
    let lonely = node(&broker, "re-only", &[]).await;
    // re-evaluate as a pure rule-engine node: nobody owns core partitions
    lonely
        .partitions
        .recalculate_partitions(ServiceInfo::new("re-only", [ServiceType::RuleEngine]), Vec::new())
        .await;

    let report = lonely
        .router
        .route_notification(ClusterNotification::new(
            TenantId::SYS,
            EntityId::random(),
            attributes("x", 1),
        ))
        .await;
    assert!(matches!(report.result, Err(RouterError::OwnerUnknown { .. })));
    assert_eq!(report.final_state(), RouteState::FailedTerminal);
    assert_eq!(lonely.store.applied.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_router_as_notification_consumer_handler() {
    let (broker, a, b) = pair().await;
    let tenant = TenantId::random();
    let owned_by_b = entity_owned_by(&b, tenant);
    let owned_by_a = entity_owned_by(&a, tenant);
    a.router.route(tenant, owned_by_b, attributes("k", 1)).await.unwrap();

    let envelope = inbox(&broker, "node-b").remove(0);
    b.router.handle(&envelope).await.unwrap();

    let stray = ClusterNotification::new(tenant, owned_by_a, attributes("k", 2))
        .to_envelope("node-b")
        .unwrap();
    // ownership conflicts are acked without delivery
    b.router.handle(&stray).await.unwrap();
    assert_eq!(b.store.applied.load(Ordering::SeqCst), 1);
    assert!(b.router.handle(&Envelope::new(tenant, None, b"{".to_vec())).await.is_err());
}

fn kinds(list: &[SubscriptionKind]) -> BTreeSet<SubscriptionKind> {
    list.iter().copied().collect()
}

async fn wait_until<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

#[tokio::test]
async fn test_owner_keeps_subscriptions_and_fans_out_updates() {
    let (broker, a, b) = pair().await;
    let tenant = TenantId::random();
    let entity = entity_owned_by(&b, tenant);

    // node-a subscribes through the owner's topic
    let outcome = a
        .router
        .subscribe(tenant, entity, kinds(&[SubscriptionKind::Attributes]), 7)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        RouteOutcome::SentRemote {
            target_service_id: "node-b".to_string()
        }
    );
    b.router
        .accept_remote(&inbox(&broker, "node-b").remove(0))
        .await
        .unwrap();
    assert_eq!(
        b.subscriptions.subscribers(entity, SubscriptionKind::Attributes),
        vec!["node-a".to_string()]
    );
    // registrations never reach the business handler
    assert_eq!(b.store.applied.load(Ordering::SeqCst), 0);

    // the owner acknowledges straight to the subscriber
    let callback = inbox(&broker, "node-a").remove(0);
    assert_eq!(callback.header(DIRECT_HEADER), Some("true"));
    let callback = a.router.accept_remote(&callback).await.unwrap();
    assert_eq!(callback.body, NotificationBody::SubscriptionCallback { seq_number: 7 });

    // the owner's own subscription stays in process
    let outcome = b
        .router
        .subscribe(
            tenant,
            entity,
            kinds(&[SubscriptionKind::Attributes, SubscriptionKind::Alarms]),
            1,
        )
        .await
        .unwrap();
    assert_eq!(outcome, RouteOutcome::DeliveredLocal);
    assert_eq!(b.store.applied.load(Ordering::SeqCst), 1);

    let results = b
        .router
        .notify_subscribers(tenant, entity, attributes("temp", 3))
        .await;
    let targets: Vec<&str> = results.iter().map(|(target, _)| target.as_str()).collect();
    assert_eq!(targets, vec!["node-a", "node-b"]);
    assert!(results.iter().all(|(_, result)| result.is_ok()));
    assert_eq!(b.store.values.get(&entity).unwrap()["temp"], 3);
    let update = inbox(&broker, "node-a").remove(1);
    a.router.accept_remote(&update).await.unwrap();
    assert_eq!(a.store.values.get(&entity).unwrap()["temp"], 3);

    let alarm = NotificationBody::AlarmUpdate {
        alarm_id: uuid::Uuid::new_v4(),
        status: "CLEARED_ACK".to_string(),
        deleted: false,
    };
    let results = b.router.notify_subscribers(tenant, entity, alarm).await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0, "node-b");

    let timeseries = NotificationBody::TimeseriesUpdate {
        ts: 1,
        values: BTreeMap::new(),
    };
    assert!(b.router.notify_subscribers(tenant, entity, timeseries).await.is_empty());

    a.router.unsubscribe(tenant, entity).await.unwrap();
    b.router
        .accept_remote(&inbox(&broker, "node-b").remove(1))
        .await
        .unwrap();
    assert_eq!(
        b.subscriptions.subscribers(entity, SubscriptionKind::Attributes),
        vec!["node-b".to_string()]
    );
}

#[tokio::test]
async fn test_subscription_sent_to_former_owner_is_refused() {
    let (broker, a, b) = pair().await;
    let tenant = TenantId::random();
    let entity = entity_owned_by(&b, tenant);
    a.router
        .subscribe(tenant, entity, kinds(&[SubscriptionKind::Alarms]), 2)
        .await
        .unwrap();

    let envelope = inbox(&broker, "node-b").remove(0);
    assert!(matches!(
        a.router.accept_remote(&envelope).await,
        Err(RouterError::NotMyPartition { .. })
    ));
    let update = SubscriptionUpdate {
        service_id: "node-b".to_string(),
        kinds: kinds(&[SubscriptionKind::Alarms]),
        seq_number: 2,
    };
    assert!(a.subscriptions.update(tenant, entity, &update).is_err());
    assert!(a.subscriptions.is_empty());
}

#[tokio::test]
async fn test_subscriptions_follow_cluster_membership() {
    let broker = Arc::new(InMemoryBroker::new());
    let b = node(&broker, "node-b", &["node-a"]).await;
    let shutdown = ShutdownCoordinator::new();
    let cleanup =
        launch_subscription_cleanup(b.subscriptions.clone(), b.bus.clone(), shutdown.clone()).await;

    let tenant = TenantId::random();
    let entities: Vec<EntityId> = (0..40).map(|_| entity_owned_by(&b, tenant)).collect();
    for entity in &entities {
        for service_id in ["node-a", "node-b"] {
            let update = SubscriptionUpdate {
                service_id: service_id.to_string(),
                kinds: kinds(&[SubscriptionKind::Attributes]),
                seq_number: 1,
            };
            b.subscriptions.update(tenant, *entity, &update).unwrap();
        }
    }
    assert_eq!(b.subscriptions.len(), 40);

    // node-c takes over some partitions: their entities are forgotten here
    b.partitions
        .recalculate_partitions(core("node-b"), vec![core("node-a"), core("node-c")])
        .await;
    let still_owned = |partitions: &PartitionService| {
        entities
            .iter()
            .filter(|e| partitions.is_my_partition(ServiceType::Core, tenant, **e))
            .count()
    };
    let expected = still_owned(b.partitions.as_ref());
    assert!(
        wait_until(Duration::from_secs(1), || b.subscriptions.len() == expected).await,
        "{} entities kept, {} still owned",
        b.subscriptions.len(),
        expected
    );

    // node-a leaves: its subscriptions go with it
    b.partitions
        .recalculate_partitions(core("node-b"), vec![core("node-c")])
        .await;
    let registry = b.subscriptions.clone();
    let entities_left = entities.clone();
    assert!(
        wait_until(Duration::from_secs(1), || {
            entities_left.iter().all(|e| {
                !registry
                    .subscribers(*e, SubscriptionKind::Attributes)
                    .contains(&"node-a".to_string())
            })
        })
        .await
    );
    let expected = still_owned(b.partitions.as_ref());
    assert!(wait_until(Duration::from_secs(1), || b.subscriptions.len() == expected).await);
    for entity in &entities {
        let subscribers = b.subscriptions.subscribers(*entity, SubscriptionKind::Attributes);
        assert!(subscribers.is_empty() || subscribers == vec!["node-b".to_string()]);
    }

    shutdown.trigger_shutdown();
    cleanup.await.unwrap();
    assert!(!b.bus.lock().await.has_subscriber("subscription-cleanup:TB_CORE"));
}

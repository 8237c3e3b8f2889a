//! Partition handover between live consumer managers

use crate::common::{cluster_config, partition_service, service, wait_until, Recorder, CORE_TOPIC};
use clusterq::consumer::{ConsumerConfig, ConsumerManager};
use clusterq::core::config::ClusterConfig;
use clusterq::notifications::api::AsyncNotificationManager;
use clusterq::partition::{InMemoryTenantRoutingInfoService, PartitionService};
use clusterq::queue::memory::{InMemoryBroker, InMemoryQueueFactory};
use clusterq::queue::{EntityId, Envelope, QueueFactory, QueueKey, ServiceType, TenantId};
use std::sync::Arc;
use std::time::Duration;

struct Node {
    partitions: Arc<PartitionService>,
    manager: ConsumerManager,
}

fn node(broker: &Arc<InMemoryBroker>, config: &ClusterConfig, handler: Arc<Recorder>) -> Node {
    let factory: Arc<dyn QueueFactory> =
        Arc::new(InMemoryQueueFactory::new(broker.clone(), &config.queue));
    Node {
        partitions: partition_service(config, Arc::new(InMemoryTenantRoutingInfoService::new())),
        manager: ConsumerManager::new(
            QueueKey::main(ServiceType::Core),
            CORE_TOPIC,
            factory,
            ConsumerConfig::from_settings(&config.queue),
            handler,
            AsyncNotificationManager::new_shared(),
        ),
    }
}

impl Node {
    async fn apply_topology(&self, me: &str, others: &[&str]) {
        self.partitions
            .recalculate_partitions(
                service(me, &[ServiceType::Core]),
                others
                    .iter()
                    .map(|id| service(id, &[ServiceType::Core]))
                    .collect(),
            )
            .await;
    }

    async fn follow_partitions(&self) {
        let mine = self
            .partitions
            .my_topic_partitions(&QueueKey::main(ServiceType::Core));
        self.manager.update(mine).await.unwrap();
    }
}

async fn publish(broker: &Arc<InMemoryBroker>, partitions: &PartitionService, range: std::ops::Range<u32>) {
    let producer = InMemoryQueueFactory::new(broker.clone(), &Default::default()).create_producer(CORE_TOPIC);
    for i in range {
        let entity = EntityId::random();
        let tpi = partitions.resolve_main(ServiceType::Core, TenantId::SYS, entity);
        producer
            .send(&tpi, Envelope::new(TenantId::SYS, Some(entity), i.to_be_bytes().to_vec()))
            .await
            .unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_handover_keeps_one_subscriber_per_partition() {
    let broker = Arc::new(InMemoryBroker::new());
    let config = cluster_config(6, 1);
    let handler = Arc::new(Recorder::default());
    let a = node(&broker, &config, handler.clone());
    let b = node(&broker, &config, handler.clone());

    a.apply_topology("node-a", &[]).await;
    a.follow_partitions().await;
    assert_eq!(a.manager.active_tasks().await, 6);
    publish(&broker, &a.partitions, 0..60).await;

    // node-b joins while node-a is consuming; both react at the same time
    a.apply_topology("node-a", &["node-b"]).await;
    b.apply_topology("node-b", &["node-a"]).await;
    tokio::join!(a.follow_partitions(), b.follow_partitions());
    publish(&broker, &a.partitions, 60..120).await;

    assert!(wait_until(Duration::from_secs(5), || handler.distinct() == 120).await);
    assert_eq!(a.manager.active_tasks().await, 3);
    assert_eq!(b.manager.active_tasks().await, 3);

    for partition in 0..6 {
        let topic = format!("{}.{}", CORE_TOPIC, partition);
        assert_eq!(
            broker.peak_subscribers(&topic),
            1,
            "{} had overlapping subscribers",
            topic
        );
        assert!(broker.claim_owner(&topic).is_some());
    }

    assert!(a.manager.shutdown().await);
    assert!(b.manager.shutdown().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_departed_node_partitions_resume_from_committed_offset() {
    let broker = Arc::new(InMemoryBroker::new());
    let config = cluster_config(4, 1);
    let handler = Arc::new(Recorder::default());
    let a = node(&broker, &config, handler.clone());
    let b = node(&broker, &config, handler.clone());

    a.apply_topology("node-a", &["node-b"]).await;
    b.apply_topology("node-b", &["node-a"]).await;
    a.follow_partitions().await;
    b.follow_partitions().await;
    publish(&broker, &a.partitions, 0..40).await;
    assert!(wait_until(Duration::from_secs(5), || handler.distinct() == 40).await);

    // node-b goes away; node-a takes over everything
    assert!(b.manager.shutdown().await);
    a.apply_topology("node-a", &[]).await;
    a.follow_partitions().await;
    assert_eq!(a.manager.active_tasks().await, 4);
    publish(&broker, &a.partitions, 40..80).await;

    assert!(wait_until(Duration::from_secs(5), || handler.distinct() == 80).await);
    // committed messages are not replayed to the new owner
    for i in 0..40u32 {
        assert_eq!(handler.deliveries(&i.to_be_bytes()), 1);
    }
    assert!(a.manager.shutdown().await);
}

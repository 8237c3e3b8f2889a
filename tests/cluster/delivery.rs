//! Delivery guarantees of a consumer manager on the in-memory broker

use crate::common::{wait_until, Recorder, CORE_TOPIC};
use async_trait::async_trait;
use clusterq::consumer::{
    ConsumerConfig, ConsumerManager, DeadLetterSink, HandlerError, MessageHandler,
};
use clusterq::core::config::QueueSettings;
use clusterq::notifications::api::AsyncNotificationManager;
use clusterq::queue::memory::{InMemoryBroker, InMemoryQueueFactory};
use clusterq::queue::{Envelope, QueueFactory, QueueKey, ServiceType, TenantId, TopicPartitionInfo};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

const PARTITION_TOPIC: &str = "tb_core.0";

fn settings(pack_timeout_ms: u64, stop_timeout_ms: u64) -> QueueSettings {
    QueueSettings {
        poll_interval_ms: 10,
        pack_processing_timeout_ms: pack_timeout_ms,
        pack_processing_retries: 3,
        consumer_pool_size: 64,
        stop_timeout_ms,
        ..QueueSettings::default()
    }
}

fn manager(
    broker: &Arc<InMemoryBroker>,
    settings: &QueueSettings,
    handler: Arc<dyn MessageHandler>,
) -> ConsumerManager {
    ConsumerManager::new(
        QueueKey::main(ServiceType::Core),
        CORE_TOPIC,
        Arc::new(InMemoryQueueFactory::new(broker.clone(), settings)),
        ConsumerConfig::from_settings(settings),
        handler,
        AsyncNotificationManager::new_shared(),
    )
}

fn partition_zero() -> BTreeSet<TopicPartitionInfo> {
    BTreeSet::from([TopicPartitionInfo::new(CORE_TOPIC, None, Some(0), true)])
}

async fn publish(broker: &Arc<InMemoryBroker>, count: u32) {
    let producer = InMemoryQueueFactory::new(broker.clone(), &QueueSettings::default())
        .create_producer(CORE_TOPIC);
    let tpi = TopicPartitionInfo::new(CORE_TOPIC, None, Some(0), true);
    for i in 0..count {
        producer
            .send(&tpi, Envelope::new(TenantId::SYS, None, i.to_be_bytes().to_vec()))
            .await
            .unwrap();
    }
}

/// Never completes a message
#[derive(Default)]
struct Stuck {
    calls: AtomicUsize,
}

#[async_trait]
impl MessageHandler for Stuck {
    async fn handle(&self, _envelope: &Envelope) -> Result<(), HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::future::pending::<()>().await;
        Ok(())
    }
}

/// Always rejects a fixed set of payloads
struct Rejecting {
    rejected: BTreeSet<Vec<u8>>,
    calls: Mutex<BTreeMap<Vec<u8>, usize>>,
}

#[async_trait]
impl MessageHandler for Rejecting {
    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(envelope.payload.clone())
            .or_insert(0) += 1;
        if self.rejected.contains(&envelope.payload) {
            Err(HandlerError::new("device offline"))
        } else {
            Ok(())
        }
    }
}

#[derive(Default)]
struct DeadLetters {
    payloads: Mutex<Vec<Vec<u8>>>,
}

#[async_trait]
impl DeadLetterSink for DeadLetters {
    async fn dead_letter(&self, _queue_key: &QueueKey, envelope: &Envelope, _reason: &str) {
        self.payloads.lock().unwrap().push(envelope.payload.clone());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_aborted_pack_is_redelivered_to_next_owner() {
    let broker = Arc::new(InMemoryBroker::new());
    // pack deadline far beyond the stop deadline: the task is aborted mid-pack
    let settings = settings(10_000, 100);
    let stuck = Arc::new(Stuck::default());
    publish(&broker, 5).await;
    let first = manager(&broker, &settings, stuck.clone());
    first.update(partition_zero()).await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || stuck.calls.load(Ordering::SeqCst) == 5).await);

    assert!(!first.shutdown().await, "stuck task must be aborted");
    // nothing was committed: all five are still owed to the next owner
    assert_eq!(broker.committed_offset(PARTITION_TOPIC).unwrap(), 1);
    assert_eq!(broker.lag(PARTITION_TOPIC).unwrap(), 5);

    let recorder = Arc::new(Recorder::default());
    let second = manager(&broker, &settings, recorder.clone());
    second.update(partition_zero()).await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || recorder.distinct() == 5).await);
    for i in 0..5u32 {
        assert!(recorder.deliveries(&i.to_be_bytes()) >= 1);
    }
    assert!(wait_until(Duration::from_secs(1), || broker.lag(PARTITION_TOPIC).unwrap() == 0).await);
    assert!(second.shutdown().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stuck_pack_commits_after_timeout() {
    let broker = Arc::new(InMemoryBroker::new());
    let pack_timeout = Duration::from_millis(200);
    let settings = settings(pack_timeout.as_millis() as u64, 1000);
    let stuck = Arc::new(Stuck::default());
    // one pack of 40
    publish(&broker, 40).await;
    let manager = manager(&broker, &settings, stuck.clone());
    let started = Instant::now();
    manager.update(partition_zero()).await.unwrap();
    assert!(
        wait_until(Duration::from_secs(3), || {
            broker.lag(PARTITION_TOPIC).unwrap() == 0
        })
        .await
    );
    let elapsed = started.elapsed();
    assert!(
        elapsed < pack_timeout + Duration::from_millis(700),
        "pack committed after {:?}",
        elapsed
    );
    assert_eq!(stuck.calls.load(Ordering::SeqCst), 40);
    assert!(manager.shutdown().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failing_messages_use_retry_budget_then_dead_letter() {
    let broker = Arc::new(InMemoryBroker::new());
    let settings = settings(2000, 1000);
    let rejected: BTreeSet<Vec<u8>> = [3u32, 11, 19, 27, 42]
        .iter()
        .map(|i| i.to_be_bytes().to_vec())
        .collect();
    let handler = Arc::new(Rejecting {
        rejected: rejected.clone(),
        calls: Mutex::new(BTreeMap::new()),
    });
    let dead_letters = Arc::new(DeadLetters::default());

    // one pack of 50
    publish(&broker, 50).await;
    let manager = manager(&broker, &settings, handler.clone())
        .with_dead_letter_sink(dead_letters.clone());
    manager.update(partition_zero()).await.unwrap();

    assert!(
        wait_until(Duration::from_secs(3), || dead_letters.payloads.lock().unwrap().len() == 5)
            .await
    );
    assert!(wait_until(Duration::from_secs(1), || broker.lag(PARTITION_TOPIC).unwrap() == 0).await);

    let calls = handler.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 50);
    for (payload, count) in &calls {
        let expected = if rejected.contains(payload) { 4 } else { 1 };
        assert_eq!(*count, expected);
    }
    let dead: BTreeSet<Vec<u8>> = dead_letters.payloads.lock().unwrap().iter().cloned().collect();
    assert_eq!(dead, rejected);
    assert!(manager.shutdown().await);
}

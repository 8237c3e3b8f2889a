//! Partition listener
//!
//! Feeds [`PartitionChangeEvent`]s from the node's event bus into the
//! consumer managers of one service type. Managers for queues that appear
//! at runtime (a tenant that became isolated, a queue added by an admin) are
//! created on first sight through an optional builder.

use crate::consumer::error::ConsumerResult;
use crate::consumer::manager::ConsumerManager;
use crate::core::shutdown::ShutdownCoordinator;
use crate::notifications::api::{Event, EventFilter, PartitionChangeEvent, SharedNotificationManager};
use crate::queue::{QueueKey, ServiceType};
use dashmap::DashMap;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Creates the manager for a queue key seen for the first time
pub type ManagerBuilder = Box<dyn Fn(&QueueKey) -> Option<Arc<ConsumerManager>> + Send + Sync>;

/// The consumer managers of one service type, keyed by queue
pub struct ConsumerManagers {
    service_type: ServiceType,
    managers: DashMap<QueueKey, Arc<ConsumerManager>>,
    builder: Option<ManagerBuilder>,
}

impl ConsumerManagers {
    pub fn new(service_type: ServiceType) -> Self {
        Self {
            service_type,
            managers: DashMap::new(),
            builder: None,
        }
    }

    pub fn with_builder(mut self, builder: ManagerBuilder) -> Self {
        self.builder = Some(builder);
        self
    }

    pub fn service_type(&self) -> ServiceType {
        self.service_type
    }

    pub fn insert(&self, manager: Arc<ConsumerManager>) {
        self.managers.insert(manager.queue_key().clone(), manager);
    }

    pub fn get(&self, queue_key: &QueueKey) -> Option<Arc<ConsumerManager>> {
        self.managers.get(queue_key).map(|m| m.value().clone())
    }

    pub fn queue_keys(&self) -> Vec<QueueKey> {
        let mut keys: Vec<QueueKey> = self.managers.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.managers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.managers.is_empty()
    }

    fn manager_for(&self, queue_key: &QueueKey) -> Option<Arc<ConsumerManager>> {
        if let Some(existing) = self.get(queue_key) {
            return Some(existing);
        }
        let builder = self.builder.as_ref()?;
        let manager = builder(queue_key)?;
        log::info!("[{}] Created consumer manager", queue_key);
        Some(
            self.managers
                .entry(queue_key.clone())
                .or_insert(manager)
                .value()
                .clone(),
        )
    }

    /// Apply one ownership change
    ///
    /// Events for queues nobody consumes here are ignored; a manager whose
    /// queue lost all partitions is stopped and forgotten.
    pub async fn apply(&self, event: &PartitionChangeEvent) -> ConsumerResult<()> {
        if event.queue_key.service_type != self.service_type {
            return Ok(());
        }
        if event.partitions.is_empty() {
            let Some(manager) = self.get(&event.queue_key) else {
                return Ok(());
            };
            manager.update(event.partitions.clone()).await?;
            if self.builder.is_some() && event.queue_key.is_isolated() {
                manager.await_stop(manager.config().stop_timeout).await;
                self.managers.remove(&event.queue_key);
            }
            return Ok(());
        }
        match self.manager_for(&event.queue_key) {
            Some(manager) => manager.update(event.partitions.clone()).await,
            None => {
                log::debug!("[{}] No consumer for partition change", event.queue_key);
                Ok(())
            }
        }
    }

    /// Stop every manager; `true` when all tasks exited on their own
    pub async fn stop_all(&self, timeout: Duration) -> bool {
        let managers: Vec<Arc<ConsumerManager>> =
            self.managers.iter().map(|e| e.value().clone()).collect();
        for manager in &managers {
            manager.signal_stop().await;
        }
        join_all(managers.iter().map(|m| m.await_stop(timeout)))
            .await
            .into_iter()
            .all(|graceful| graceful)
    }
}

/// Subscribe `managers` to partition changes of their service type
///
/// The subscription is registered before this returns, so no event
/// published afterwards is missed.
pub async fn launch_partition_listener(
    managers: Arc<ConsumerManagers>,
    notifications: SharedNotificationManager,
    shutdown: ShutdownCoordinator,
) -> JoinHandle<()> {
    let subscriber_id = format!("partition-listener:{}", managers.service_type());
    let mut receiver = notifications.lock().await.subscribe(
        subscriber_id.clone(),
        EventFilter::PartitionsFor(managers.service_type()),
        "consumer".to_string(),
    );
    let statistics = notifications
        .lock()
        .await
        .get_subscriber_statistics(&subscriber_id);

    tokio::spawn(async move {
        loop {
            if shutdown.is_shutdown_requested() {
                break;
            }
            tokio::select! {
                event = receiver.recv() => {
                    let Some(event) = event else { break };
                    if let Some(statistics) = &statistics {
                        statistics.decrement_queue_size();
                    }
                    if let Event::Partition(change) = event {
                        if let Err(e) = managers.apply(&change).await {
                            log::warn!("[{}] Partition change not applied: {}", change.queue_key, e);
                        }
                    }
                }
                _ = shutdown.wait() => break,
            }
        }
        notifications.lock().await.unsubscribe(&subscriber_id);
        log::debug!("Partition listener '{}' stopped", subscriber_id);
    })
}

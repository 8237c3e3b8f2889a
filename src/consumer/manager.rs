//! Consumer manager
//!
//! Owns the consumer tasks of one logical queue and keeps them in line with
//! the partitions this node owns. Partitions that are no longer owned are
//! stopped, and their tasks awaited, before tasks for new partitions start,
//! so a partition handed over during a rebalance is never polled by two
//! owners at once.

use crate::consumer::config::ConsumerConfig;
use crate::consumer::error::{ConsumerError, ConsumerResult};
use crate::consumer::handler::{DeadLetterSink, MessageHandler};
use crate::consumer::pack::PackProcessor;
use crate::consumer::task::{stop_tasks, ConsumerTask, LoopContext, Subscription};
use crate::notifications::api::SharedNotificationManager;
use crate::queue::{QueueFactory, QueueKey, TopicPartitionInfo};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};

#[derive(Default)]
struct ManagerState {
    partitions: BTreeSet<TopicPartitionInfo>,
    /// Keyed by full topic name, or by the queue topic in single-task mode
    tasks: BTreeMap<String, ConsumerTask>,
}

pub struct ConsumerManager {
    queue_key: QueueKey,
    topic: String,
    factory: Arc<dyn QueueFactory>,
    config: ConsumerConfig,
    context: Arc<LoopContext>,
    state: Mutex<ManagerState>,
    updating: Mutex<()>,
    stopped: AtomicBool,
}

impl ConsumerManager {
    pub fn new(
        queue_key: QueueKey,
        topic: impl Into<String>,
        factory: Arc<dyn QueueFactory>,
        config: ConsumerConfig,
        handler: Arc<dyn MessageHandler>,
        notifications: SharedNotificationManager,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.pool_size));
        let processor = PackProcessor::new(
            queue_key.clone(),
            handler,
            permits,
            config.pack_processing_timeout,
            config.pack_processing_retries,
        );
        let context = LoopContext {
            queue_key: queue_key.clone(),
            processor,
            notifications,
            poll_interval: config.poll_interval,
        };
        Self {
            queue_key,
            topic: topic.into(),
            factory,
            config,
            context: Arc::new(context),
            state: Mutex::new(ManagerState::default()),
            updating: Mutex::new(()),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn with_dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        let mut context = (*self.context).clone();
        context.processor = context.processor.with_dead_letter_sink(sink);
        self.context = Arc::new(context);
        self
    }

    pub fn queue_key(&self) -> &QueueKey {
        &self.queue_key
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Partitions currently assigned to this manager
    pub async fn partitions(&self) -> BTreeSet<TopicPartitionInfo> {
        self.state.lock().await.partitions.clone()
    }

    /// Consumer tasks that are still running
    pub async fn active_tasks(&self) -> usize {
        self.state
            .lock()
            .await
            .tasks
            .values()
            .filter(|task| !task.is_finished())
            .count()
    }

    /// Converge the running tasks on `partitions`
    ///
    /// An empty set stops everything.
    pub async fn update(&self, partitions: BTreeSet<TopicPartitionInfo>) -> ConsumerResult<()> {
        if self.is_stopped() {
            return Err(ConsumerError::AlreadyStopped {
                queue_key: self.queue_key.clone(),
            });
        }

        // serializes updates; `state` itself is never held across a stop
        let _updating = self.updating.lock().await;

        let stopping: Vec<ConsumerTask> = {
            let mut state = self.state.lock().await;
            if state.partitions == partitions {
                return Ok(());
            }
            let removed: Vec<TopicPartitionInfo> =
                state.partitions.difference(&partitions).cloned().collect();
            log::info!(
                "[{}] Updating consumers: {} added, {} removed, {} total",
                self.queue_key,
                partitions.difference(&state.partitions).count(),
                removed.len(),
                partitions.len()
            );
            if self.config.consumer_per_partition {
                removed
                    .iter()
                    .filter_map(|tpi| state.tasks.remove(&tpi.full_topic_name()))
                    .collect()
            } else {
                std::mem::take(&mut state.tasks).into_values().collect()
            }
        };
        self.stop(stopping).await;

        let mut state = self.state.lock().await;
        // a stop requested while the old tasks drained wins
        if self.is_stopped() {
            return Err(ConsumerError::AlreadyStopped {
                queue_key: self.queue_key.clone(),
            });
        }
        if self.config.consumer_per_partition {
            let added: Vec<TopicPartitionInfo> =
                partitions.difference(&state.partitions).cloned().collect();
            for tpi in added {
                let label = tpi.full_topic_name();
                let task = self.spawn(Subscription::Partitions(BTreeSet::from([tpi])), label.clone());
                state.tasks.insert(label, task);
            }
        } else if !partitions.is_empty() {
            let task = self.spawn(Subscription::Partitions(partitions.clone()), self.topic.clone());
            state.tasks.insert(self.topic.clone(), task);
        }

        state.partitions = partitions;
        Ok(())
    }

    fn spawn(&self, subscription: Subscription, label: String) -> ConsumerTask {
        let consumer = self.factory.create_consumer(&self.topic);
        ConsumerTask::spawn(self.context.clone(), consumer, subscription, label)
    }

    async fn stop(&self, tasks: Vec<ConsumerTask>) {
        if tasks.is_empty() {
            return;
        }
        if !stop_tasks(tasks, self.config.stop_timeout).await {
            log::warn!("[{}] Some consumers were aborted while stopping", self.queue_key);
        }
    }

    /// Ask every task to finish its current pack and exit
    ///
    /// The manager refuses further updates afterwards.
    pub async fn signal_stop(&self) {
        self.stopped.store(true, Ordering::Release);
        let state = self.state.lock().await;
        for task in state.tasks.values() {
            task.signal_stop();
        }
    }

    /// Stop all tasks, aborting those still running after `timeout`
    ///
    /// Returns `true` when every task exited on its own.
    pub async fn await_stop(&self, timeout: Duration) -> bool {
        self.stopped.store(true, Ordering::Release);
        let tasks: Vec<ConsumerTask> = {
            let mut state = self.state.lock().await;
            state.partitions.clear();
            std::mem::take(&mut state.tasks).into_values().collect()
        };
        let graceful = stop_tasks(tasks, timeout).await;
        log::debug!("[{}] Consumer manager stopped", self.queue_key);
        graceful
    }

    /// [`signal_stop`](Self::signal_stop) followed by
    /// [`await_stop`](Self::await_stop) with the configured stop timeout
    pub async fn shutdown(&self) -> bool {
        self.signal_stop().await;
        self.await_stop(self.config.stop_timeout).await
    }
}

//! Consumer of the node's private notification topic
//!
//! Every node reads `<notifications>.<service_id>`, where other nodes put
//! events addressed to it. The topic is not partitioned, so there is a single
//! task that runs from start to stop regardless of rebalances.

use crate::consumer::config::ConsumerConfig;
use crate::consumer::error::{ConsumerError, ConsumerResult};
use crate::consumer::handler::MessageHandler;
use crate::consumer::pack::PackProcessor;
use crate::consumer::task::{stop_tasks, ConsumerTask, LoopContext, Subscription};
use crate::notifications::api::SharedNotificationManager;
use crate::queue::{QueueFactory, QueueKey, ServiceType, TenantId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};

pub const NOTIFICATIONS_QUEUE_NAME: &str = "Notifications";

pub struct NotificationConsumer {
    service_id: String,
    factory: Arc<dyn QueueFactory>,
    context: Arc<LoopContext>,
    task: Mutex<Option<ConsumerTask>>,
    stopped: AtomicBool,
}

impl NotificationConsumer {
    pub fn new(
        service_id: impl Into<String>,
        factory: Arc<dyn QueueFactory>,
        config: &ConsumerConfig,
        handler: Arc<dyn MessageHandler>,
        notifications: SharedNotificationManager,
    ) -> Self {
        let queue_key = QueueKey::new(ServiceType::Core, NOTIFICATIONS_QUEUE_NAME, TenantId::SYS);
        let processor = PackProcessor::new(
            queue_key.clone(),
            handler,
            Arc::new(Semaphore::new(config.pool_size)),
            config.pack_processing_timeout,
            config.pack_processing_retries,
        );
        Self {
            service_id: service_id.into(),
            factory,
            context: Arc::new(LoopContext {
                queue_key,
                processor,
                notifications,
                poll_interval: config.poll_interval,
            }),
            task: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn queue_key(&self) -> &QueueKey {
        &self.context.queue_key
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// Start consuming; a no-op while already running
    pub async fn start(&self) -> ConsumerResult<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(ConsumerError::AlreadyStopped {
                queue_key: self.queue_key().clone(),
            });
        }
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return Ok(());
        }

        let consumer = self.factory.create_notifications_consumer(&self.service_id);
        let label = consumer.topic().to_string();
        *task = Some(ConsumerTask::spawn(
            self.context.clone(),
            consumer,
            Subscription::Own,
            label,
        ));
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Stop the task, aborting it after `timeout`
    pub async fn stop(&self, timeout: Duration) -> bool {
        self.stopped.store(true, Ordering::Release);
        let Some(task) = self.task.lock().await.take() else {
            return true;
        };
        stop_tasks(vec![task], timeout).await
    }
}

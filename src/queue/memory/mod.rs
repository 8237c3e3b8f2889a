//! In-memory queue backend
//!
//! A full implementation of the transport contract inside one process. Several
//! nodes can share one [`InMemoryBroker`] to form a cluster in tests.

mod broker;
mod consumer;

pub use broker::InMemoryBroker;
pub use consumer::InMemoryConsumer;

use crate::core::config::QueueSettings;
use crate::partition::topic::TopicService;
use crate::queue::error::{QueueError, QueueResult};
use crate::queue::key::TopicPartitionInfo;
use crate::queue::message::{Envelope, SendMetadata};
use crate::queue::provider::QueueType;
use crate::queue::traits::{
    QueueAdmin, QueueConsumer, QueueFactory, QueueProducer, TopicProperties,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct InMemoryAdmin {
    broker: Arc<InMemoryBroker>,
}

#[async_trait]
impl QueueAdmin for InMemoryAdmin {
    async fn create_topic_if_not_exists(
        &self,
        topic: &str,
        _properties: &TopicProperties,
    ) -> QueueResult<()> {
        if self.broker.create_topic(topic) {
            log::debug!("Created topic '{}'", topic);
        }
        Ok(())
    }

    async fn delete_topic(&self, topic: &str) -> QueueResult<()> {
        self.broker.delete_topic(topic)
    }

    async fn destroy(&self) {}
}

pub struct InMemoryProducer {
    broker: Arc<InMemoryBroker>,
    default_topic: String,
    stopped: AtomicBool,
}

impl InMemoryProducer {
    pub fn new(broker: Arc<InMemoryBroker>, default_topic: &str) -> Self {
        Self {
            broker,
            default_topic: default_topic.to_string(),
            stopped: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl QueueProducer for InMemoryProducer {
    async fn init(&self) -> QueueResult<()> {
        Ok(())
    }

    fn default_topic(&self) -> &str {
        &self.default_topic
    }

    async fn send(
        &self,
        tpi: &TopicPartitionInfo,
        envelope: Envelope,
    ) -> QueueResult<SendMetadata> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(QueueError::Stopped {
                component: format!("Producer for '{}'", self.default_topic),
            });
        }
        let topic = tpi.full_topic_name();
        let offset = self.broker.publish(&topic, envelope)?;
        Ok(SendMetadata { topic, offset })
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }
}

/// Hands out admin, producers and consumers bound to one broker
pub struct InMemoryQueueFactory {
    broker: Arc<InMemoryBroker>,
    topics: TopicService,
    max_poll_messages: usize,
}

impl InMemoryQueueFactory {
    pub fn new(broker: Arc<InMemoryBroker>, settings: &QueueSettings) -> Self {
        Self {
            broker,
            topics: TopicService::new(settings),
            max_poll_messages: settings.max_poll_messages,
        }
    }

    pub fn broker(&self) -> &Arc<InMemoryBroker> {
        &self.broker
    }
}

impl QueueFactory for InMemoryQueueFactory {
    fn queue_type(&self) -> QueueType {
        QueueType::InMemory
    }

    fn create_admin(&self) -> Arc<dyn QueueAdmin> {
        Arc::new(InMemoryAdmin {
            broker: self.broker.clone(),
        })
    }

    fn create_producer(&self, default_topic: &str) -> Arc<dyn QueueProducer> {
        Arc::new(InMemoryProducer::new(self.broker.clone(), default_topic))
    }

    fn create_consumer(&self, topic: &str) -> Box<dyn QueueConsumer> {
        Box::new(InMemoryConsumer::new(
            self.broker.clone(),
            topic,
            self.max_poll_messages,
        ))
    }

    fn create_notifications_consumer(&self, service_id: &str) -> Box<dyn QueueConsumer> {
        let tpi = self.topics.notifications_topic(service_id);
        Box::new(InMemoryConsumer::new(
            self.broker.clone(),
            &tpi.full_topic_name(),
            self.max_poll_messages,
        ))
    }

    fn create_notifications_producer(&self) -> Arc<dyn QueueProducer> {
        Arc::new(InMemoryProducer::new(
            self.broker.clone(),
            self.topics.notifications_base(),
        ))
    }
}

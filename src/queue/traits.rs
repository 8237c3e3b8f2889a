//! Broker-agnostic transport contract
//!
//! Every backend implements admin, producer and consumer; a [`QueueFactory`]
//! hands out instances for the backend chosen at startup.

use crate::queue::error::QueueResult;
use crate::queue::key::TopicPartitionInfo;
use crate::queue::message::{Envelope, SendMetadata};
use crate::queue::provider::QueueType;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

/// Backend-specific topic settings (`partitions`, retention, ...)
pub type TopicProperties = BTreeMap<String, String>;

#[async_trait]
pub trait QueueAdmin: Send + Sync {
    /// Idempotent; existing topics are left untouched
    async fn create_topic_if_not_exists(
        &self,
        topic: &str,
        properties: &TopicProperties,
    ) -> QueueResult<()>;

    async fn delete_topic(&self, topic: &str) -> QueueResult<()>;

    async fn destroy(&self);
}

#[async_trait]
pub trait QueueProducer: Send + Sync {
    async fn init(&self) -> QueueResult<()>;

    fn default_topic(&self) -> &str;

    /// Publish one envelope to `tpi`
    ///
    /// The returned future resolves exactly once, with the broker
    /// acknowledgement or the terminal failure.
    async fn send(&self, tpi: &TopicPartitionInfo, envelope: Envelope)
        -> QueueResult<SendMetadata>;

    async fn stop(&self);
}

/// A consumer owned by exactly one task
#[async_trait]
pub trait QueueConsumer: Send {
    fn topic(&self) -> &str;

    /// Subscribe to the consumer's own unpartitioned topic
    async fn subscribe(&mut self) -> QueueResult<()>;

    /// Replace the subscription with exactly `partitions`
    async fn subscribe_partitions(
        &mut self,
        partitions: BTreeSet<TopicPartitionInfo>,
    ) -> QueueResult<()>;

    /// Fetch the next batch, waiting up to `timeout` when nothing is ready
    async fn poll(&mut self, timeout: Duration) -> QueueResult<Vec<Envelope>>;

    /// Acknowledge everything returned by previous polls
    async fn commit(&mut self) -> QueueResult<()>;

    /// Release the subscription; uncommitted messages are redelivered to the
    /// next subscriber
    async fn unsubscribe(&mut self);

    fn is_stopped(&self) -> bool;
}

pub trait QueueFactory: Send + Sync {
    fn queue_type(&self) -> QueueType;

    fn create_admin(&self) -> Arc<dyn QueueAdmin>;

    fn create_producer(&self, default_topic: &str) -> Arc<dyn QueueProducer>;

    /// Consumer for partitions of `topic`
    fn create_consumer(&self, topic: &str) -> Box<dyn QueueConsumer>;

    /// Consumer of the local node's private notification topic
    fn create_notifications_consumer(&self, service_id: &str) -> Box<dyn QueueConsumer>;

    fn create_notifications_producer(&self) -> Arc<dyn QueueProducer>;
}

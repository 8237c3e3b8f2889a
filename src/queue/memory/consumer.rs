//! In-memory consumer
//!
//! Holds exclusive claims on its subscribed topics and a private read
//! position per topic. Read positions start at the committed offset, so
//! anything a previous owner polled but never committed is delivered again.

use crate::queue::error::{QueueError, QueueResult};
use crate::queue::key::TopicPartitionInfo;
use crate::queue::memory::broker::InMemoryBroker;
use crate::queue::message::Envelope;
use crate::queue::traits::QueueConsumer;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub struct InMemoryConsumer {
    broker: Arc<InMemoryBroker>,
    consumer_id: u64,
    topic: String,
    max_poll_messages: usize,
    /// full topic name -> next offset to read
    positions: BTreeMap<String, u64>,
    stopped: bool,
}

impl InMemoryConsumer {
    pub fn new(broker: Arc<InMemoryBroker>, topic: &str, max_poll_messages: usize) -> Self {
        let consumer_id = broker.register_consumer();
        Self {
            broker,
            consumer_id,
            topic: topic.to_string(),
            max_poll_messages: max_poll_messages.max(1),
            positions: BTreeMap::new(),
            stopped: false,
        }
    }

    pub fn consumer_id(&self) -> u64 {
        self.consumer_id
    }

    /// Full topic names currently claimed
    pub fn subscriptions(&self) -> Vec<String> {
        self.positions.keys().cloned().collect()
    }

    fn release_all(&mut self) {
        for topic in self.positions.keys() {
            self.broker.release(topic, self.consumer_id);
        }
        self.positions.clear();
    }

    fn read_available(&mut self) -> QueueResult<Vec<Envelope>> {
        let mut batch = Vec::new();
        for (topic, position) in self.positions.iter_mut() {
            let (messages, next) = self.broker.read(topic, *position, self.max_poll_messages)?;
            *position = next;
            batch.extend(messages);
        }
        Ok(batch)
    }
}

#[async_trait]
impl QueueConsumer for InMemoryConsumer {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn subscribe(&mut self) -> QueueResult<()> {
        let own = TopicPartitionInfo::topic_only(self.topic.clone());
        self.subscribe_partitions(BTreeSet::from([own])).await
    }

    async fn subscribe_partitions(
        &mut self,
        partitions: BTreeSet<TopicPartitionInfo>,
    ) -> QueueResult<()> {
        if self.stopped {
            return Err(QueueError::Stopped {
                component: format!("Consumer of '{}'", self.topic),
            });
        }

        let wanted: BTreeSet<String> = partitions.iter().map(|p| p.full_topic_name()).collect();

        let dropped: Vec<String> = self
            .positions
            .keys()
            .filter(|t| !wanted.contains(*t))
            .cloned()
            .collect();
        for topic in dropped {
            self.broker.release(&topic, self.consumer_id);
            self.positions.remove(&topic);
        }

        let mut newly_claimed: Vec<String> = Vec::new();
        for topic in wanted {
            if self.positions.contains_key(&topic) {
                continue;
            }
            if let Err(e) = self.broker.claim(&topic, self.consumer_id) {
                for claimed in &newly_claimed {
                    self.broker.release(claimed, self.consumer_id);
                    self.positions.remove(claimed);
                }
                return Err(e);
            }
            let committed = self.broker.committed_offset(&topic)?;
            self.positions.insert(topic.clone(), committed);
            newly_claimed.push(topic);
        }

        log::trace!(
            "Consumer {} subscribed to {:?}",
            self.consumer_id,
            self.positions.keys()
        );
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> QueueResult<Vec<Envelope>> {
        if self.stopped {
            return Err(QueueError::Stopped {
                component: format!("Consumer of '{}'", self.topic),
            });
        }

        if self.positions.is_empty() {
            tokio::time::sleep(timeout).await;
            return Ok(Vec::new());
        }

        let deadline = Instant::now() + timeout;
        let broker = self.broker.clone();
        loop {
            // Register interest before reading so a publish in between is not missed
            let notified = broker.data_ready();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.read_available()?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn commit(&mut self) -> QueueResult<()> {
        for (topic, position) in &self.positions {
            self.broker.commit(topic, *position)?;
        }
        Ok(())
    }

    async fn unsubscribe(&mut self) {
        self.release_all();
        self.stopped = true;
    }

    fn is_stopped(&self) -> bool {
        self.stopped
    }
}

impl Drop for InMemoryConsumer {
    fn drop(&mut self) {
        self.release_all();
    }
}

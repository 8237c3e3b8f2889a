//! In-process broker with offset-ordered topic logs
//!
//! Each topic (one per physical partition) is an append-only log with
//! monotonic offsets starting at 1 and a single committed offset, since a
//! partition is consumed by at most one consumer at a time. Consumers claim
//! topics exclusively; a claim held by someone else is refused with
//! [`QueueError::PartitionBusy`].

use crate::core::sync::handle_mutex_poison;
use crate::queue::error::{QueueError, QueueResult};
use crate::queue::message::Envelope;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

#[derive(Debug, Clone)]
struct LogEntry {
    offset: u64,
    envelope: Envelope,
}

#[derive(Debug)]
struct TopicLog {
    /// Offset assigned to the next published message
    next_offset: u64,
    /// Every offset below this one has been acknowledged
    committed: u64,
    entries: VecDeque<LogEntry>,
}

impl Default for TopicLog {
    fn default() -> Self {
        Self {
            next_offset: 1,
            committed: 1,
            entries: VecDeque::new(),
        }
    }
}

#[derive(Debug, Default)]
struct ClaimStats {
    active: usize,
    peak: usize,
}

/// Shared in-memory broker; clone the `Arc` to connect several nodes
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    topics: DashMap<String, Arc<Mutex<TopicLog>>>,
    claims: DashMap<String, u64>,
    claim_stats: DashMap<String, ClaimStats>,
    next_consumer_id: AtomicU64,
    injected_failures: AtomicUsize,
    data_ready: Notify,
}

fn lock(log: &Mutex<TopicLog>) -> QueueResult<MutexGuard<'_, TopicLog>> {
    handle_mutex_poison(log.lock(), |message| QueueError::Internal { message })
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn topic_log(&self, topic: &str) -> Arc<Mutex<TopicLog>> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| {
                log::debug!("Creating in-memory topic '{}'", topic);
                Arc::new(Mutex::new(TopicLog::default()))
            })
            .clone()
    }

    /// Returns `true` when the topic did not exist before
    pub fn create_topic(&self, topic: &str) -> bool {
        if self.topics.contains_key(topic) {
            return false;
        }
        self.topic_log(topic);
        true
    }

    pub fn has_topic(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    pub fn delete_topic(&self, topic: &str) -> QueueResult<()> {
        self.topics
            .remove(topic)
            .map(|_| ())
            .ok_or_else(|| QueueError::TopicNotFound {
                topic: topic.to_string(),
            })
    }

    pub fn topic_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Make the next `count` publishes fail with a transient error
    pub fn inject_send_failures(&self, count: usize) {
        self.injected_failures.store(count, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> bool {
        self.injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Append to a topic, creating it on first use
    pub fn publish(&self, topic: &str, envelope: Envelope) -> QueueResult<u64> {
        if self.take_injected_failure() {
            return Err(QueueError::Transient {
                topic: topic.to_string(),
                message: "injected broker failure".to_string(),
            });
        }

        let log = self.topic_log(topic);
        let offset = {
            let mut log = lock(&log)?;
            let offset = log.next_offset;
            log.next_offset += 1;
            log.entries.push_back(LogEntry { offset, envelope });
            offset
        };

        self.data_ready.notify_waiters();
        Ok(offset)
    }

    /// Up to `max` messages at or after `from`, plus the position after the last one
    pub fn read(&self, topic: &str, from: u64, max: usize) -> QueueResult<(Vec<Envelope>, u64)> {
        let log = self.topic_log(topic);
        let log = lock(&log)?;

        let start = from.max(log.committed);
        let mut next = start;
        let mut batch = Vec::new();
        for entry in log.entries.iter().filter(|entry| entry.offset >= start).take(max) {
            next = entry.offset + 1;
            batch.push(entry.envelope.clone());
        }

        Ok((batch, next))
    }

    pub fn committed_offset(&self, topic: &str) -> QueueResult<u64> {
        let log = self.topic_log(topic);
        let committed = lock(&log)?.committed;
        Ok(committed)
    }

    /// Advance the committed offset and drop acknowledged messages
    pub fn commit(&self, topic: &str, offset: u64) -> QueueResult<()> {
        let log = self.topic_log(topic);
        let mut log = lock(&log)?;
        if offset > log.committed {
            log.committed = offset;
            let committed = log.committed;
            log.entries.retain(|entry| entry.offset >= committed);
        }
        Ok(())
    }

    /// Messages published but not yet committed
    pub fn lag(&self, topic: &str) -> QueueResult<u64> {
        let log = self.topic_log(topic);
        let log = lock(&log)?;
        Ok(log.next_offset - log.committed)
    }

    pub(crate) fn register_consumer(&self) -> u64 {
        self.next_consumer_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Take exclusive ownership of `topic` for `consumer_id`
    pub fn claim(&self, topic: &str, consumer_id: u64) -> QueueResult<()> {
        use dashmap::mapref::entry::Entry;

        match self.claims.entry(topic.to_string()) {
            Entry::Occupied(owner) if *owner.get() == consumer_id => return Ok(()),
            Entry::Occupied(_) => {
                return Err(QueueError::PartitionBusy {
                    topic: topic.to_string(),
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(consumer_id);
            }
        }

        let mut stats = self.claim_stats.entry(topic.to_string()).or_default();
        stats.active += 1;
        stats.peak = stats.peak.max(stats.active);
        Ok(())
    }

    pub fn release(&self, topic: &str, consumer_id: u64) {
        if self
            .claims
            .remove_if(topic, |_, owner| *owner == consumer_id)
            .is_some()
        {
            if let Some(mut stats) = self.claim_stats.get_mut(topic) {
                stats.active = stats.active.saturating_sub(1);
            }
        }
    }

    pub fn claim_owner(&self, topic: &str) -> Option<u64> {
        self.claims.get(topic).map(|owner| *owner)
    }

    /// Highest number of simultaneous subscribers ever seen on `topic`
    pub fn peak_subscribers(&self, topic: &str) -> usize {
        self.claim_stats.get(topic).map(|s| s.peak).unwrap_or(0)
    }

    /// Future completing on the next publish to any topic
    pub(crate) fn data_ready(&self) -> Notified<'_> {
        self.data_ready.notified()
    }
}

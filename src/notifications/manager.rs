//! AsyncNotificationManager implementation

use crate::notifications::error::NotificationError;
use crate::notifications::event::{Event, EventFilter};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;

// Queue size at which a subscriber is reported as lagging
const HIGH_WATER_MARK: usize = 10000;

pub type EventReceiver = UnboundedReceiver<Event>;

/// Manager shared by every component of one node
pub type SharedNotificationManager = Arc<Mutex<AsyncNotificationManager>>;

/// Delivery counters for one subscriber
#[derive(Debug, Default)]
pub struct SubscriberStatistics {
    queue_size: AtomicUsize,
    messages_delivered: AtomicUsize,
}

impl SubscriberStatistics {
    pub fn queue_size(&self) -> usize {
        self.queue_size.load(Ordering::Relaxed)
    }

    pub fn increment_queue_size(&self) {
        self.queue_size.fetch_add(1, Ordering::Relaxed);
    }

    /// Called by subscribers after handling an event
    pub fn decrement_queue_size(&self) {
        let _ = self
            .queue_size
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(1))
            });
    }

    pub fn messages_delivered(&self) -> usize {
        self.messages_delivered.load(Ordering::Relaxed)
    }

    fn record_delivery(&self) {
        self.increment_queue_size();
        self.messages_delivered.fetch_add(1, Ordering::Relaxed);
    }
}

struct SubscriberInfo {
    filter: EventFilter,
    source: String,
    sender: UnboundedSender<Event>,
    statistics: Arc<SubscriberStatistics>,
}

#[derive(Default)]
pub struct AsyncNotificationManager {
    subscribers: HashMap<String, SubscriberInfo>,
}

impl AsyncNotificationManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> SharedNotificationManager {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn subscribe(
        &mut self,
        subscriber_id: String,
        filter: EventFilter,
        source: String,
    ) -> EventReceiver {
        let (sender, receiver) = unbounded_channel();

        let subscriber_info = SubscriberInfo {
            filter,
            source: source.clone(),
            sender,
            statistics: Arc::new(SubscriberStatistics::default()),
        };

        if let Some(existing) = self.subscribers.insert(subscriber_id.clone(), subscriber_info) {
            log::warn!(
                "Subscriber '{}' replaced existing subscription (source: {} -> {})",
                subscriber_id,
                existing.source,
                source
            );
        }

        receiver
    }

    pub fn unsubscribe(&mut self, subscriber_id: &str) -> bool {
        self.subscribers.remove(subscriber_id).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn has_subscriber(&self, subscriber_id: &str) -> bool {
        self.subscribers.contains_key(subscriber_id)
    }

    pub fn get_subscriber_statistics(&self, subscriber_id: &str) -> Option<Arc<SubscriberStatistics>> {
        self.subscribers
            .get(subscriber_id)
            .map(|info| info.statistics.clone())
    }

    pub fn check_high_water_marks(&self) -> Vec<String> {
        self.subscribers
            .iter()
            .filter(|(_, info)| info.statistics.queue_size() >= HIGH_WATER_MARK)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Deliver `event` to every subscriber whose filter accepts it
    ///
    /// Subscribers whose receiver was dropped are removed and reported in the
    /// returned error; delivery to the others still happens.
    pub async fn publish(&mut self, event: Event) -> Result<(), NotificationError> {
        let mut failed_subscribers = Vec::new();

        for (subscriber_id, subscriber_info) in &self.subscribers {
            if !subscriber_info.filter.accepts(&event) {
                continue;
            }
            if subscriber_info.sender.send(event.clone()).is_err() {
                failed_subscribers.push(subscriber_id.clone());
            } else {
                subscriber_info.statistics.record_delivery();
            }
        }

        for subscriber_id in &failed_subscribers {
            self.subscribers.remove(subscriber_id);
        }

        if !failed_subscribers.is_empty() {
            return Err(NotificationError::PublishFailed {
                event_type: event.kind().to_string(),
                failed_subscribers,
            });
        }

        for lagging in self.check_high_water_marks() {
            log::warn!("Subscriber '{}' has {} or more undelivered events", lagging, HIGH_WATER_MARK);
        }

        Ok(())
    }
}

/// Publish on a shared manager, logging instead of failing
///
/// Closed subscribers are an expected outcome of consumer shutdown, so their
/// removal is only logged at debug level.
pub async fn publish_logged(manager: &SharedNotificationManager, event: Event) {
    let mut manager = manager.lock().await;
    if let Err(e) = manager.publish(event).await {
        log::debug!("{}", e);
    }
}

//! Topic naming

use crate::core::config::QueueSettings;
use crate::queue::TopicPartitionInfo;

/// Builds broker topic names from configured base names
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicService {
    prefix: String,
    notifications: String,
}

impl TopicService {
    pub fn new(settings: &QueueSettings) -> Self {
        Self {
            prefix: settings.topic_prefix.clone(),
            notifications: format!("{}{}", settings.topic_prefix, settings.notifications_topic),
        }
    }

    pub fn build_topic_name(&self, topic: &str) -> String {
        format!("{}{}", self.prefix, topic)
    }

    /// Prefixed base name shared by all notification topics
    pub fn notifications_base(&self) -> &str {
        &self.notifications
    }

    /// Private topic of one service: `<notifications>.<service_id>`
    pub fn notifications_topic(&self, service_id: &str) -> TopicPartitionInfo {
        TopicPartitionInfo::topic_only(format!("{}.{}", self.notifications, service_id))
    }
}

//! Public API for the notification system
//!
//! External modules should import from here rather than directly from
//! internal modules. There is no global instance: each node creates one
//! [`SharedNotificationManager`] and hands it to its components.

pub use crate::notifications::event::{
    ConsumerEvent, ConsumerEventType, Event, EventFilter, PartitionChangeEvent, ServiceEvent,
    ServiceEventType, SystemEvent, SystemEventType,
};

pub use crate::notifications::error::NotificationError;
pub use crate::notifications::manager::{
    publish_logged, AsyncNotificationManager, EventReceiver, SharedNotificationManager,
    SubscriberStatistics,
};

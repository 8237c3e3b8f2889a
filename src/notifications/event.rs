//! Event types for the node's notification bus

use crate::queue::{QueueKey, ServiceType, TopicPartitionInfo};
use std::collections::BTreeSet;
use std::time::SystemTime;

/// The local node's owned partitions of one queue changed
///
/// `partitions` is the complete new set; an empty set means the node no
/// longer owns any partition of `queue_key`.
#[derive(Clone, Debug, PartialEq)]
pub struct PartitionChangeEvent {
    pub queue_key: QueueKey,
    pub partitions: BTreeSet<TopicPartitionInfo>,
    pub timestamp: SystemTime,
}

impl PartitionChangeEvent {
    pub fn new(queue_key: QueueKey, partitions: BTreeSet<TopicPartitionInfo>) -> Self {
        Self {
            queue_key,
            partitions,
            timestamp: SystemTime::now(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServiceEventType {
    Joined,
    /// The service disappeared from the topology
    Shutdown,
}

#[derive(Clone, Debug)]
pub struct ServiceEvent {
    pub event_type: ServiceEventType,
    pub timestamp: SystemTime,
    pub service_id: String,
    pub service_types: BTreeSet<ServiceType>,
}

impl ServiceEvent {
    pub fn new(
        event_type: ServiceEventType,
        service_id: String,
        service_types: BTreeSet<ServiceType>,
    ) -> Self {
        Self {
            event_type,
            timestamp: SystemTime::now(),
            service_id,
            service_types,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsumerEventType {
    Started,
    Stopped,
    PackTimedOut,
    PackFailed,
}

#[derive(Clone, Debug)]
pub struct ConsumerEvent {
    pub event_type: ConsumerEventType,
    pub timestamp: SystemTime,
    pub queue_key: QueueKey,
    pub partition: Option<String>,
    pub message: Option<String>,
}

impl ConsumerEvent {
    pub fn new(event_type: ConsumerEventType, queue_key: QueueKey, partition: Option<String>) -> Self {
        Self {
            event_type,
            timestamp: SystemTime::now(),
            queue_key,
            partition,
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SystemEventType {
    Startup,
    Shutdown,
    ShutdownTimeout,
}

#[derive(Clone, Debug)]
pub struct SystemEvent {
    pub event_type: SystemEventType,
    pub timestamp: SystemTime,
    pub message: Option<String>,
}

impl SystemEvent {
    pub fn new(event_type: SystemEventType) -> Self {
        Self {
            event_type,
            timestamp: SystemTime::now(),
            message: None,
        }
    }

    pub fn with_message(event_type: SystemEventType, message: String) -> Self {
        Self {
            event_type,
            timestamp: SystemTime::now(),
            message: Some(message),
        }
    }
}

#[derive(Clone, Debug)]
pub enum Event {
    Partition(PartitionChangeEvent),
    Service(ServiceEvent),
    Consumer(ConsumerEvent),
    System(SystemEvent),
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Partition(_) => "Partition",
            Event::Service(_) => "Service",
            Event::Consumer(_) => "Consumer",
            Event::System(_) => "System",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum EventFilter {
    All,
    PartitionOnly,
    /// Partition changes of one service type's queues
    PartitionsFor(ServiceType),
    ServiceOnly,
    ConsumerOnly,
    SystemOnly,
    PartitionAndSystem,
    /// Ownership changes and services joining or leaving
    PartitionAndService,
}

impl EventFilter {
    pub fn accepts(&self, event: &Event) -> bool {
        match (self, event) {
            (EventFilter::All, _) => true,
            (EventFilter::PartitionOnly, Event::Partition(_)) => true,
            (EventFilter::PartitionsFor(service_type), Event::Partition(change)) => {
                change.queue_key.service_type == *service_type
            }
            (EventFilter::ServiceOnly, Event::Service(_)) => true,
            (EventFilter::ConsumerOnly, Event::Consumer(_)) => true,
            (EventFilter::SystemOnly, Event::System(_)) => true,
            (EventFilter::PartitionAndSystem, Event::Partition(_) | Event::System(_)) => true,
            (EventFilter::PartitionAndService, Event::Partition(_) | Event::Service(_)) => true,
            _ => false,
        }
    }
}

//! Identity types shared by partitioning, transport and routing
//!
//! Tenants, entities and profiles are UUID newtypes. A [`QueueKey`] names a
//! logical queue; a [`TopicPartitionInfo`] names one physical partition of it
//! and whether the local node owns that partition.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::SystemTime;
use strum_macros::{Display, EnumIter, EnumString};
use uuid::Uuid;

/// Name of the default rule-engine queue and of every service's main queue
pub const MAIN_QUEUE_NAME: &str = "Main";

/// Role a service plays in the cluster
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[strum(ascii_case_insensitive)]
pub enum ServiceType {
    #[serde(rename = "TB_CORE", alias = "core")]
    #[strum(to_string = "TB_CORE", serialize = "core")]
    Core,
    #[serde(rename = "TB_RULE_ENGINE", alias = "rule-engine")]
    #[strum(to_string = "TB_RULE_ENGINE", serialize = "rule-engine")]
    RuleEngine,
    #[serde(rename = "TB_TRANSPORT", alias = "transport")]
    #[strum(to_string = "TB_TRANSPORT", serialize = "transport")]
    Transport,
}

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn random() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

uuid_id!(
    /// Tenant identifier; [`TenantId::SYS`] owns every shared queue
    TenantId
);
uuid_id!(
    /// Device, asset or any other entity messages are keyed by
    EntityId
);
uuid_id!(TenantProfileId);

impl TenantId {
    /// The system tenant (nil UUID)
    pub const SYS: TenantId = TenantId(Uuid::nil());

    pub fn is_sys(&self) -> bool {
        self.0.is_nil()
    }

    /// Rebuild from the signed most/least significant halves carried in envelopes
    pub fn from_msb_lsb(msb: i64, lsb: i64) -> Self {
        Self(Uuid::from_u64_pair(msb as u64, lsb as u64))
    }

    pub fn msb_lsb(&self) -> (i64, i64) {
        let (msb, lsb) = self.0.as_u64_pair();
        (msb as i64, lsb as i64)
    }
}

/// Logical queue identity: `(service type, queue name, owning tenant)`
///
/// Shared queues belong to [`TenantId::SYS`]; isolated queues to their tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueKey {
    pub service_type: ServiceType,
    pub queue_name: String,
    pub tenant_id: TenantId,
}

impl QueueKey {
    pub fn new(service_type: ServiceType, queue_name: impl Into<String>, tenant_id: TenantId) -> Self {
        Self {
            service_type,
            queue_name: queue_name.into(),
            tenant_id,
        }
    }

    /// The shared main queue of a service type
    pub fn main(service_type: ServiceType) -> Self {
        Self::new(service_type, MAIN_QUEUE_NAME, TenantId::SYS)
    }

    pub fn is_isolated(&self) -> bool {
        !self.tenant_id.is_sys()
    }
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_isolated() {
            write!(
                f,
                "QK({},{},{})",
                self.queue_name, self.service_type, self.tenant_id
            )
        } else {
            write!(f, "QK({},{},system)", self.queue_name, self.service_type)
        }
    }
}

/// One physical partition of a topic
///
/// `partition == None` denotes an unpartitioned topic such as a node's
/// notification topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartitionInfo {
    pub topic: String,
    pub tenant_id: Option<TenantId>,
    pub partition: Option<u32>,
    pub my_partition: bool,
}

impl TopicPartitionInfo {
    pub fn new(
        topic: impl Into<String>,
        tenant_id: Option<TenantId>,
        partition: Option<u32>,
        my_partition: bool,
    ) -> Self {
        Self {
            topic: topic.into(),
            tenant_id,
            partition,
            my_partition,
        }
    }

    /// Unpartitioned topic, always considered local
    pub fn topic_only(topic: impl Into<String>) -> Self {
        Self::new(topic, None, None, true)
    }

    /// Broker-level name: `topic` or `topic.partition`
    pub fn full_topic_name(&self) -> String {
        match self.partition {
            Some(partition) => format!("{}.{}", self.topic, partition),
            None => self.topic.clone(),
        }
    }

    pub fn with_my_partition(mut self, my_partition: bool) -> Self {
        self.my_partition = my_partition;
        self
    }
}

impl fmt::Display for TopicPartitionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_topic_name())
    }
}

/// Topology entry for one live service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub service_id: String,
    pub service_types: BTreeSet<ServiceType>,
    pub assigned_tenant_profiles: BTreeSet<TenantProfileId>,
    pub last_seen: SystemTime,
}

impl ServiceInfo {
    pub fn new(service_id: impl Into<String>, service_types: impl IntoIterator<Item = ServiceType>) -> Self {
        Self {
            service_id: service_id.into(),
            service_types: service_types.into_iter().collect(),
            assigned_tenant_profiles: BTreeSet::new(),
            last_seen: SystemTime::now(),
        }
    }

    pub fn with_tenant_profiles(
        mut self,
        profiles: impl IntoIterator<Item = TenantProfileId>,
    ) -> Self {
        self.assigned_tenant_profiles = profiles.into_iter().collect();
        self
    }

    pub fn has_type(&self, service_type: ServiceType) -> bool {
        self.service_types.contains(&service_type)
    }
}

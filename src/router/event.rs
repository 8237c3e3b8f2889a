//! Routed notifications and their wire form
//!
//! Remote notifications travel as JSON in the envelope payload. Receivers
//! may see the same notification more than once, so every body is a
//! "set latest value" style update rather than a delta.

use crate::queue::{EntityId, Envelope, TenantId, TARGET_SERVICE_HEADER};
use crate::router::error::{RouterError, RouterResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use strum_macros::Display;
use uuid::Uuid;

/// Kind of entity an edge notification is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeEventType {
    Edge,
    Asset,
    AssetProfile,
    Device,
    DeviceProfile,
    EntityView,
    Dashboard,
    RuleChain,
    User,
    Customer,
    Alarm,
    Relation,
    Tenant,
    TenantProfile,
}

/// Change that must be pushed to an edge instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeNotification {
    pub event_type: EdgeEventType,
    /// ADDED, UPDATED, DELETED, ...
    pub action: String,
    pub entity_id: Option<Uuid>,
    pub edge_id: Option<Uuid>,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
}

impl EdgeNotification {
    pub fn new(event_type: EdgeEventType, action: impl Into<String>) -> Self {
        Self {
            event_type,
            action: action.into(),
            entity_id: None,
            edge_id: None,
            body: None,
        }
    }

    pub fn with_entity(mut self, entity_id: Uuid) -> Self {
        self.entity_id = Some(entity_id);
        self
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Envelope for the edge queue
    pub fn to_envelope(&self, tenant_id: TenantId) -> RouterResult<Envelope> {
        let payload = serde_json::to_vec(self).map_err(|e| RouterError::Encode {
            message: e.to_string(),
        })?;
        Ok(Envelope::new(
            tenant_id,
            self.entity_id.map(EntityId),
            payload,
        ))
    }

    pub fn from_envelope(envelope: &Envelope) -> RouterResult<Self> {
        serde_json::from_slice(&envelope.payload).map_err(|e| RouterError::Decode {
            message: e.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationBody {
    AttributesUpdate {
        scope: String,
        values: BTreeMap<String, serde_json::Value>,
    },
    TimeseriesUpdate {
        ts: i64,
        values: BTreeMap<String, serde_json::Value>,
    },
    AlarmUpdate {
        alarm_id: Uuid,
        status: String,
        deleted: bool,
    },
    /// Sent to the entity owner to register (or with no kinds, drop) the
    /// sender's interest in the entity
    Subscription(SubscriptionUpdate),
    /// Acknowledges a subscription event back to the subscribing node
    SubscriptionCallback { seq_number: u32 },
    Edge(EdgeNotification),
}

/// Updates a service can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SubscriptionKind {
    Attributes,
    Timeseries,
    Alarms,
}

impl SubscriptionKind {
    /// Kind of subscription that receives `body`, if any
    pub fn of(body: &NotificationBody) -> Option<Self> {
        match body {
            NotificationBody::AttributesUpdate { .. } => Some(SubscriptionKind::Attributes),
            NotificationBody::TimeseriesUpdate { .. } => Some(SubscriptionKind::Timeseries),
            NotificationBody::AlarmUpdate { .. } => Some(SubscriptionKind::Alarms),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionUpdate {
    pub service_id: String,
    /// Replaces whatever the service subscribed to before
    pub kinds: BTreeSet<SubscriptionKind>,
    pub seq_number: u32,
}

/// A business event addressed to whichever node owns `entity_id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterNotification {
    pub event_id: Uuid,
    pub tenant_id: TenantId,
    pub entity_id: EntityId,
    pub body: NotificationBody,
}

impl ClusterNotification {
    pub fn new(tenant_id: TenantId, entity_id: EntityId, body: NotificationBody) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            tenant_id,
            entity_id,
            body,
        }
    }

    /// Envelope for `target_service_id`'s notification topic
    pub fn to_envelope(&self, target_service_id: &str) -> RouterResult<Envelope> {
        let payload = serde_json::to_vec(self).map_err(|e| RouterError::Encode {
            message: e.to_string(),
        })?;
        Ok(
            Envelope::new(self.tenant_id, Some(self.entity_id), payload)
                .with_header(TARGET_SERVICE_HEADER, target_service_id),
        )
    }

    pub fn from_envelope(envelope: &Envelope) -> RouterResult<Self> {
        serde_json::from_slice(&envelope.payload).map_err(|e| RouterError::Decode {
            message: e.to_string(),
        })
    }
}

/// Lifecycle of one routed event
///
/// `Created → Routing → DeliveredLocal | SentRemote → Acked`, with
/// `Retrying` looping back to the delivery state until the budget runs out
/// and the event ends in `FailedTerminal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RouteState {
    Created,
    Routing,
    DeliveredLocal,
    SentRemote,
    Acked,
    Retrying,
    FailedTerminal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    DeliveredLocal,
    SentRemote { target_service_id: String },
}

/// Every state one routed event went through, and how it ended
#[derive(Debug)]
pub struct RouteReport {
    pub event_id: Uuid,
    pub states: Vec<RouteState>,
    pub result: RouterResult<RouteOutcome>,
}

impl RouteReport {
    pub fn final_state(&self) -> RouteState {
        self.states.last().copied().unwrap_or(RouteState::Created)
    }

    /// Delivery attempts made, including the first one
    pub fn attempts(&self) -> usize {
        self.states
            .iter()
            .filter(|s| matches!(s, RouteState::DeliveredLocal | RouteState::SentRemote))
            .count()
    }
}

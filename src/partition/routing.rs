//! Tenant and queue routing information
//!
//! Whether a tenant is isolated, and which profile it belongs to, is owned by
//! an external configuration service; the partition service only reads it
//! through [`TenantRoutingInfoService`] and caches the answers.

use crate::core::config::QueueDefinition;
use crate::queue::{QueueKey, ServiceType, TenantId, TenantProfileId};
use dashmap::DashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantRoutingInfo {
    pub tenant_id: TenantId,
    pub profile_id: Option<TenantProfileId>,
    /// Tenant has its own rule-engine queues
    pub isolated_rule_engine: bool,
}

impl TenantRoutingInfo {
    pub fn shared(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            profile_id: None,
            isolated_rule_engine: false,
        }
    }
}

pub trait TenantRoutingInfoService: Send + Sync {
    /// `None` when the tenant is unknown; it is then treated as shared
    fn get_routing_info(&self, tenant_id: TenantId) -> Option<TenantRoutingInfo>;
}

/// Routing info held in memory, fed from configuration or tests
#[derive(Debug, Default)]
pub struct InMemoryTenantRoutingInfoService {
    tenants: DashMap<TenantId, TenantRoutingInfo>,
}

impl InMemoryTenantRoutingInfoService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, info: TenantRoutingInfo) {
        self.tenants.insert(info.tenant_id, info);
    }

    pub fn remove(&self, tenant_id: TenantId) {
        self.tenants.remove(&tenant_id);
    }
}

impl TenantRoutingInfoService for InMemoryTenantRoutingInfoService {
    fn get_routing_info(&self, tenant_id: TenantId) -> Option<TenantRoutingInfo> {
        self.tenants.get(&tenant_id).map(|info| info.clone())
    }
}

/// Topic and partition count of one logical queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueRoutingInfo {
    pub queue_key: QueueKey,
    /// Prefixed topic name
    pub topic: String,
    pub partitions: u32,
}

/// Rule-engine queue created or changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueUpdate {
    pub tenant_id: TenantId,
    pub queue_name: String,
    pub topic: String,
    pub partitions: u32,
}

impl QueueUpdate {
    pub fn queue_key(&self) -> QueueKey {
        QueueKey::new(ServiceType::RuleEngine, self.queue_name.clone(), self.tenant_id)
    }
}

impl From<&QueueDefinition> for QueueUpdate {
    fn from(definition: &QueueDefinition) -> Self {
        Self {
            tenant_id: definition.tenant_id.map(TenantId).unwrap_or(TenantId::SYS),
            queue_name: definition.name.clone(),
            topic: definition.topic.clone(),
            partitions: definition.partitions,
        }
    }
}

/// Rule-engine queue removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDelete {
    pub tenant_id: TenantId,
    pub queue_name: String,
}

impl QueueDelete {
    pub fn queue_key(&self) -> QueueKey {
        QueueKey::new(ServiceType::RuleEngine, self.queue_name.clone(), self.tenant_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_in_memory_routing_info() {
        let service = InMemoryTenantRoutingInfoService::new();
        let tenant = TenantId::random();
        assert_eq!(service.get_routing_info(tenant), None);

        service.put(TenantRoutingInfo {
            tenant_id: tenant,
            profile_id: Some(TenantProfileId::random()),
            isolated_rule_engine: true,
        });
        assert!(service.get_routing_info(tenant).unwrap().isolated_rule_engine);

        service.remove(tenant);
        assert_eq!(service.get_routing_info(tenant), None);
    }

    #[test]
    fn test_queue_update_from_definition() {
        let tenant = Uuid::new_v4();
        let definition = QueueDefinition {
            name: "HighPriority".to_string(),
            topic: "tb_rule_engine.hp".to_string(),
            partitions: 4,
            tenant_id: Some(tenant),
            ..QueueDefinition::default()
        };

        let update = QueueUpdate::from(&definition);
        assert_eq!(
            update.queue_key(),
            QueueKey::new(ServiceType::RuleEngine, "HighPriority", TenantId(tenant))
        );
        assert_eq!(update.partitions, 4);

        let shared = QueueUpdate::from(&QueueDefinition::default());
        assert_eq!(shared.queue_key(), QueueKey::main(ServiceType::RuleEngine));
    }
}

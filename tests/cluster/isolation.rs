//! Isolated tenants stay on their own rule-engine queue through rebalances

use crate::common::{cluster_config, others, partition_service, service};
use clusterq::partition::{InMemoryTenantRoutingInfoService, QueueUpdate, TenantRoutingInfo};
use clusterq::queue::{EntityId, QueueKey, ServiceInfo, ServiceType, TenantId, TenantProfileId};
use std::sync::Arc;

#[tokio::test]
async fn test_isolated_tenant_never_resolves_to_shared_queue() {
    let tenant = TenantId::random();
    let profile = TenantProfileId::random();
    let routing = Arc::new(InMemoryTenantRoutingInfoService::new());
    routing.put(TenantRoutingInfo {
        tenant_id: tenant,
        profile_id: Some(profile),
        isolated_rule_engine: true,
    });
    let partitions = partition_service(&cluster_config(4, 6), routing);

    let me = service("node-a", &[ServiceType::RuleEngine]);
    partitions.recalculate_partitions(me.clone(), Vec::new()).await;
    let isolated_topic = format!("tb_rule_engine.{}", tenant);
    partitions
        .update_queues(vec![QueueUpdate {
            tenant_id: tenant,
            queue_name: "Main".to_string(),
            topic: isolated_topic.clone(),
            partitions: 3,
        }])
        .await
        .unwrap();

    let shared_topic = partitions
        .resolve_main(ServiceType::RuleEngine, TenantId::SYS, EntityId::random())
        .topic;
    assert_ne!(shared_topic, isolated_topic);

    let dedicated = service("node-iso", &[ServiceType::RuleEngine]).with_tenant_profiles([profile]);
    let topologies: Vec<Vec<ServiceInfo>> = vec![
        vec![me.clone()],
        vec![me.clone(), service("node-b", &[ServiceType::RuleEngine])],
        vec![
            me.clone(),
            service("node-b", &[ServiceType::RuleEngine]),
            dedicated.clone(),
        ],
        vec![me.clone(), dedicated.clone()],
        vec![me.clone(), service("node-c", &[ServiceType::RuleEngine])],
        vec![me.clone()],
    ];

    let entities: Vec<EntityId> = (0..50).map(|_| EntityId::random()).collect();
    for members in &topologies {
        partitions
            .recalculate_partitions(me.clone(), others(members, &me))
            .await;
        let dedicated_present = members.iter().any(|m| m.service_id == "node-iso");
        for entity in &entities {
            let tpi = partitions.resolve_main(ServiceType::RuleEngine, tenant, *entity);
            assert_eq!(tpi.topic, isolated_topic);
            assert_eq!(tpi.tenant_id, Some(tenant));
            assert!(tpi.partition.unwrap() < 3);
            // a dedicated service takes the isolated queue away from node-a
            if dedicated_present {
                assert!(!tpi.my_partition);
            }
        }
    }

    // other tenants keep using the shared queue
    let tpi = partitions.resolve_main(ServiceType::RuleEngine, TenantId::random(), EntityId::random());
    assert_eq!(tpi.topic, shared_topic);
    assert_eq!(tpi.tenant_id, None);

    let isolated_key = QueueKey::new(ServiceType::RuleEngine, "Main", tenant);
    assert!(partitions.queue_routing_info(&isolated_key).is_some());
}

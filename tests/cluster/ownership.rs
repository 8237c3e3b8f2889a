//! Ownership determinism and node departure

use crate::common::{cluster_config, others, partition_service, service};
use clusterq::partition::{InMemoryTenantRoutingInfoService, PartitionService};
use clusterq::queue::{QueueKey, ServiceInfo, ServiceType};
use std::collections::BTreeSet;
use std::sync::Arc;

async fn cluster(ids: &[&str], partitions: u32) -> Vec<(ServiceInfo, Arc<PartitionService>)> {
    let members: Vec<ServiceInfo> = ids
        .iter()
        .map(|id| service(id, &[ServiceType::RuleEngine]))
        .collect();
    let mut nodes = Vec::new();
    for me in &members {
        let partitions = partition_service(
            &cluster_config(1, partitions),
            Arc::new(InMemoryTenantRoutingInfoService::new()),
        );
        partitions
            .recalculate_partitions(me.clone(), others(&members, me))
            .await;
        nodes.push((me.clone(), partitions));
    }
    nodes
}

fn owned(partitions: &PartitionService) -> BTreeSet<u32> {
    partitions
        .get_my_partitions(&QueueKey::main(ServiceType::RuleEngine))
        .unwrap_or_default()
        .into_iter()
        .collect()
}

fn assert_exactly_one_owner(nodes: &[(ServiceInfo, Arc<PartitionService>)], partitions: u32) {
    for partition in 0..partitions {
        let owners: Vec<&str> = nodes
            .iter()
            .filter(|(_, p)| owned(p).contains(&partition))
            .map(|(me, _)| me.service_id.as_str())
            .collect();
        assert_eq!(owners.len(), 1, "partition {} owned by {:?}", partition, owners);
    }
}

#[tokio::test]
async fn test_assignment_is_deterministic_for_any_cluster_size() {
    let ids = ["node-a", "node-b", "node-c", "node-d", "node-e"];
    for size in 1..=ids.len() {
        for partitions in [1, 3, 6, 10] {
            let nodes = cluster(&ids[..size], partitions).await;
            assert_exactly_one_owner(&nodes, partitions);

            // every node computes the same owner table
            let key = QueueKey::main(ServiceType::RuleEngine);
            let reference = nodes[0].1.table();
            for (_, node) in &nodes[1..] {
                assert_eq!(node.table().owners(&key), reference.owners(&key));
            }
        }
    }
}

#[tokio::test]
async fn test_node_leaving_hands_its_partitions_to_the_rest() {
    let mut nodes = cluster(&["node-a", "node-b", "node-c"], 6).await;
    for (_, node) in &nodes {
        assert_eq!(owned(node).len(), 2);
    }
    let orphaned = owned(&nodes[2].1);

    // node-c leaves; one recalculation cycle on each survivor
    nodes.truncate(2);
    let survivors: Vec<ServiceInfo> = nodes.iter().map(|(me, _)| me.clone()).collect();
    for (me, node) in &nodes {
        let events = node
            .recalculate_partitions(me.clone(), others(&survivors, me))
            .await;
        assert!(events
            .iter()
            .any(|e| e.queue_key == QueueKey::main(ServiceType::RuleEngine)));
    }

    for (_, node) in &nodes {
        assert_eq!(owned(node).len(), 3);
    }
    assert_exactly_one_owner(&nodes, 6);
    let adopted: BTreeSet<u32> = nodes.iter().flat_map(|(_, n)| owned(n)).collect();
    assert!(orphaned.is_subset(&adopted));
}

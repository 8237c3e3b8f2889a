//! Partition ownership table
//!
//! A table is computed from one topology snapshot and never mutated
//! afterwards. The same topology and queue set produce the same table on every
//! node: responsible services are sorted by id and partition `p` goes to
//! `ids[p % ids.len()]`.

use crate::partition::routing::QueueRoutingInfo;
use crate::queue::{QueueKey, ServiceInfo, ServiceType, TenantId, TenantProfileId};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Stable partition index of an entity
///
/// Derived from a SHA-256 digest of the UUID bytes, so it is identical across
/// processes, platforms and releases.
pub fn resolve_partition_index(id: &Uuid, partitions: u32) -> u32 {
    if partitions == 0 {
        return 0;
    }
    let digest = Sha256::digest(id.as_bytes());
    let hash = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    hash % partitions
}

/// Round-robin over an already sorted id list
pub fn assign_round_robin(partitions: u32, sorted_ids: &[&str]) -> Vec<Option<String>> {
    (0..partitions as usize)
        .map(|p| {
            if sorted_ids.is_empty() {
                None
            } else {
                Some(sorted_ids[p % sorted_ids.len()].to_string())
            }
        })
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct PartitionTable {
    current_service_id: String,
    services: BTreeMap<String, ServiceInfo>,
    owners: BTreeMap<QueueKey, Vec<Option<String>>>,
    my_partitions: BTreeMap<QueueKey, BTreeSet<u32>>,
}

impl PartitionTable {
    /// Compute ownership of every queue for one topology snapshot
    ///
    /// `profile_of` resolves the tenant profile of an isolated queue's tenant.
    pub fn compute<F>(
        current: &ServiceInfo,
        others: &[ServiceInfo],
        queues: &BTreeMap<QueueKey, QueueRoutingInfo>,
        profile_of: F,
    ) -> Self
    where
        F: Fn(TenantId) -> Option<TenantProfileId>,
    {
        let mut services: BTreeMap<String, ServiceInfo> = others
            .iter()
            .map(|s| (s.service_id.clone(), s.clone()))
            .collect();
        services.insert(current.service_id.clone(), current.clone());

        let mut owners = BTreeMap::new();
        let mut my_partitions = BTreeMap::new();

        for (key, queue) in queues {
            let responsible = responsible_services(key, &services, &profile_of);
            let assignment = assign_round_robin(queue.partitions, &responsible);

            let mine: BTreeSet<u32> = assignment
                .iter()
                .enumerate()
                .filter(|(_, owner)| owner.as_deref() == Some(current.service_id.as_str()))
                .map(|(p, _)| p as u32)
                .collect();

            my_partitions.insert(key.clone(), mine);
            owners.insert(key.clone(), assignment);
        }

        Self {
            current_service_id: current.service_id.clone(),
            services,
            owners,
            my_partitions,
        }
    }

    pub fn current_service_id(&self) -> &str {
        &self.current_service_id
    }

    pub fn owner(&self, key: &QueueKey, partition: u32) -> Option<&str> {
        self.owners
            .get(key)
            .and_then(|owners| owners.get(partition as usize))
            .and_then(|owner| owner.as_deref())
    }

    pub fn owners(&self, key: &QueueKey) -> Option<&[Option<String>]> {
        self.owners.get(key).map(Vec::as_slice)
    }

    pub fn is_mine(&self, key: &QueueKey, partition: u32) -> bool {
        self.my_partitions
            .get(key)
            .is_some_and(|mine| mine.contains(&partition))
    }

    pub fn my_partitions(&self, key: &QueueKey) -> Option<&BTreeSet<u32>> {
        self.my_partitions.get(key)
    }

    pub fn all_my_partitions(&self) -> &BTreeMap<QueueKey, BTreeSet<u32>> {
        &self.my_partitions
    }

    pub fn services(&self) -> impl Iterator<Item = &ServiceInfo> {
        self.services.values()
    }

    pub fn service(&self, service_id: &str) -> Option<&ServiceInfo> {
        self.services.get(service_id)
    }

    pub fn current_service(&self) -> Option<&ServiceInfo> {
        self.services.get(&self.current_service_id)
    }
}

/// Sorted ids of the services that share the partitions of `key`
///
/// Rule-engine services dedicated to tenant profiles serve only the isolated
/// queues of those tenants. Isolated queues without a dedicated service, and
/// shared queues without a non-dedicated service, fall back to every
/// rule-engine service.
fn responsible_services<'a, F>(
    key: &QueueKey,
    services: &'a BTreeMap<String, ServiceInfo>,
    profile_of: &F,
) -> Vec<&'a str>
where
    F: Fn(TenantId) -> Option<TenantProfileId>,
{
    let of_type: Vec<&ServiceInfo> = services
        .values()
        .filter(|s| s.has_type(key.service_type))
        .collect();

    let selected: Vec<&ServiceInfo> = if key.service_type != ServiceType::RuleEngine {
        of_type
    } else if key.is_isolated() {
        let dedicated: Vec<&ServiceInfo> = match profile_of(key.tenant_id) {
            Some(profile) => of_type
                .iter()
                .copied()
                .filter(|s| s.assigned_tenant_profiles.contains(&profile))
                .collect(),
            None => Vec::new(),
        };
        if dedicated.is_empty() {
            of_type
        } else {
            dedicated
        }
    } else {
        let general: Vec<&ServiceInfo> = of_type
            .iter()
            .copied()
            .filter(|s| s.assigned_tenant_profiles.is_empty())
            .collect();
        if general.is_empty() {
            of_type
        } else {
            general
        }
    };

    // BTreeMap iteration is already ordered by service id
    selected.into_iter().map(|s| s.service_id.as_str()).collect()
}

use std::collections::{BTreeMap, BTreeSet};

use crate::api::{
    constants::TOPOLOGY_LOCATION_LABEL_PREFIX,
    v1::{
        filesystem::Filesystem,
        object_store::ObjectStore,
        pool::{FailureDomain, Pool, PoolSpec},
    },
};

/// Every pool spec the cluster's pools, filesystems and object stores declare.
pub fn pool_specs(pools: &[Pool], filesystems: &[Filesystem], stores: &[ObjectStore]) -> Vec<PoolSpec> {
    let mut specs: Vec<PoolSpec> = pools.iter().map(|p| p.spec.clone()).collect();
    for fs in filesystems {
        specs.push(fs.spec.metadata_pool.clone());
        specs.extend(fs.spec.data_pools.iter().cloned());
    }
    for store in stores {
        specs.push(store.spec.metadata_pool.clone());
        specs.push(store.spec.data_pool.clone());
    }
    specs
}

/// The narrowest failure domain any pool uses. No pools means host.
pub fn min_failure_domain<'a>(specs: impl IntoIterator<Item = &'a PoolSpec>) -> FailureDomain {
    specs
        .into_iter()
        .map(PoolSpec::failure_domain)
        .min()
        .unwrap_or_default()
}

/// The failure domain the osd deployments are bucketed by. All osds of a node
/// run in one deployment, so osd granularity collapses to host.
pub fn bucket_type(fd: FailureDomain) -> FailureDomain {
    match fd {
        FailureDomain::Osd => FailureDomain::Host,
        other => other,
    }
}

pub fn topology_label(fd: FailureDomain) -> String {
    format!("{TOPOLOGY_LOCATION_LABEL_PREFIX}{}", bucket_type(fd))
}

/// Maps each host with osds to its failure-domain value, using the topology
/// labels of its osd deployment. Hosts without a value for `fd` are skipped.
pub fn host_domains(locations: &[BTreeMap<String, String>], fd: FailureDomain) -> BTreeMap<String, String> {
    let host_key = topology_label(FailureDomain::Host);
    let domain_key = topology_label(fd);
    locations
        .iter()
        .filter_map(|labels| {
            let host = labels.get(&host_key)?;
            let domain = labels.get(&domain_key)?;
            Some((host.clone(), domain.clone()))
        })
        .collect()
}

/// Failure-domain values holding at least one draining node.
pub fn draining_domains(hosts: &BTreeMap<String, String>, draining_nodes: &BTreeSet<String>) -> BTreeSet<String> {
    draining_nodes
        .iter()
        .filter_map(|node| hosts.get(node).cloned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::v1::{
        filesystem::{FilesystemSpec, MetadataServerSpec},
        pool::ReplicatedSpec,
    };
    use rstest::rstest;

    fn spec(fd: Option<FailureDomain>) -> PoolSpec {
        PoolSpec {
            failure_domain: fd,
            crush_root: None,
            replicated: Some(ReplicatedSpec { size: 3 }),
            erasure_coded: None,
        }
    }

    #[rstest]
    #[case(vec![], FailureDomain::Host)]
    #[case(vec![Some(FailureDomain::Zone)], FailureDomain::Zone)]
    #[case(vec![Some(FailureDomain::Zone), None], FailureDomain::Host)]
    #[case(vec![Some(FailureDomain::Region), Some(FailureDomain::Osd)], FailureDomain::Osd)]
    fn narrowest_domain_wins(#[case] domains: Vec<Option<FailureDomain>>, #[case] expected: FailureDomain) {
        let specs: Vec<PoolSpec> = domains.into_iter().map(spec).collect();
        assert_eq!(min_failure_domain(&specs), expected);
    }

    #[test]
    fn filesystem_and_object_store_pools_count() {
        let fs = Filesystem::new(
            "myfs",
            FilesystemSpec {
                metadata_pool: spec(Some(FailureDomain::Zone)),
                data_pools: vec![spec(Some(FailureDomain::Osd))],
                metadata_server: MetadataServerSpec {
                    active_count: 1,
                    active_standby: true,
                    placement: Default::default(),
                    resources: None,
                },
            },
        );
        let specs = pool_specs(&[], &[fs], &[]);
        assert_eq!(specs.len(), 2);
        assert_eq!(min_failure_domain(&specs), FailureDomain::Osd);
    }

    fn location(host: &str, zone: Option<&str>) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::from([("topology-location-host".to_string(), host.to_string())]);
        if let Some(zone) = zone {
            labels.insert("topology-location-zone".to_string(), zone.to_string());
        }
        labels
    }

    #[test]
    fn hosts_map_to_their_zone() {
        let locations = vec![location("a", Some("z1")), location("b", Some("z1")), location("c", None)];
        let hosts = host_domains(&locations, FailureDomain::Zone);
        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts["b"], "z1");

        let draining = draining_domains(&hosts, &BTreeSet::from(["b".to_string(), "x".to_string()]));
        assert_eq!(draining, BTreeSet::from(["z1".to_string()]));
    }

    #[test]
    fn osd_granularity_buckets_by_host() {
        let hosts = host_domains(&[location("a", None)], FailureDomain::Osd);
        assert_eq!(hosts["a"], "a");
        assert_eq!(topology_label(FailureDomain::Osd), "topology-location-host");
    }
}

use std::collections::BTreeMap;

use k8s_openapi::{
    api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec},
    apimachinery::pkg::{apis::meta::v1::LabelSelector, util::intstr::IntOrString},
};
use kube::{api::ObjectMeta, core::OwnerReference};

use super::failure_domain::{bucket_type, topology_label};
use crate::api::{
    constants::{APP_ATTR, CLUSTER_ATTR, OSD_APP},
    v1::pool::FailureDomain,
};

const PDB_PREFIX: &str = "rook-ceph-osd-";

/// `rook-ceph-osd-<fdType>-<fdName>`
pub fn pdb_name(fd: FailureDomain, domain: &str) -> String {
    format!("{PDB_PREFIX}{}-{domain}", bucket_type(fd))
}

pub fn is_osd_pdb(name: &str) -> bool {
    name.starts_with(PDB_PREFIX)
}

pub fn pdb_labels(namespace: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (APP_ATTR.to_string(), OSD_APP.to_string()),
        (CLUSTER_ATTR.to_string(), namespace.to_string()),
    ])
}

/// A budget that refuses every voluntary eviction of the osds in one domain.
pub fn blocking_pdb(namespace: &str, fd: FailureDomain, domain: &str, owner: &OwnerReference) -> PodDisruptionBudget {
    PodDisruptionBudget {
        metadata: ObjectMeta {
            name: Some(pdb_name(fd, domain)),
            namespace: Some(namespace.to_string()),
            labels: Some(pdb_labels(namespace)),
            owner_references: Some(vec![owner.clone()]),
            ..Default::default()
        },
        spec: Some(PodDisruptionBudgetSpec {
            max_unavailable: Some(IntOrString::Int(0)),
            selector: Some(LabelSelector {
                match_labels: Some(BTreeMap::from([
                    (APP_ATTR.to_string(), OSD_APP.to_string()),
                    (topology_label(fd), domain.to_string()),
                ])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

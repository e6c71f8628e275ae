use std::fmt::Display;

use lazy_static::lazy_static;

lazy_static! {
    pub static ref CEPH_GROUP: String = "ceph.rook.io".to_string();
    pub static ref LEGACY_GROUP: String = "rook.io".to_string();
}

impl Display for CEPH_GROUP {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const FIELD_MANAGER: &str = "rook-operator";

pub const APP_ATTR: &str = "app";
pub const CLUSTER_ATTR: &str = "rook_cluster";
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

pub const DEFAULT_CLUSTER_NAME: &str = "rook";
pub const DEFAULT_ROOK_IMAGE: &str = "rook/rook:v0.8.0";
pub const DEFAULT_CONFIG_DIR: &str = "/var/lib/rook";

// mon
pub const MON_APP: &str = "rook-ceph-mon";
pub const MON_SECRET_NAME: &str = "rook-ceph-mon";
pub const ADMIN_SECRET_NAME: &str = "rook-admin";
pub const MON_ENDPOINTS_CONFIGMAP: &str = "rook-ceph-mon-endpoints";
pub const MON_ENDPOINTS_DATA_KEY: &str = "data";
pub const MON_MAX_ID_KEY: &str = "maxMonId";
pub const MON_MAPPING_KEY: &str = "mapping";
pub const MON_PORT: u16 = 6790;

// osd
pub const OSD_APP: &str = "rook-ceph-osd";
pub const OSD_STATUS_CONFIGMAP: &str = "rook-ceph-osd-orchestration-status";
pub const TOPOLOGY_LOCATION_LABEL_PREFIX: &str = "topology-location-";

// disruption
pub const PDB_STATE_CONFIGMAP: &str = "rook-ceph-pdbstatemap";
pub const DRAIN_CANARY_APP: &str = "rook-ceph-drain-canary";

// environment consumed by the daemons and the agent
pub const ENV_POD_NAMESPACE: &str = "POD_NAMESPACE";
pub const ENV_NODE_NAME: &str = "NODE_NAME";
pub const ENV_ROOK_NODE_NAME: &str = "ROOK_NODE_NAME";
pub const ENV_DATA_DEVICES: &str = "ROOK_DATA_DEVICES";
pub const ENV_DATA_DEVICE_FILTER: &str = "ROOK_DATA_DEVICE_FILTER";
pub const ENV_METADATA_DEVICE: &str = "ROOK_METADATA_DEVICE";
pub const ENV_DATA_DIRECTORIES: &str = "ROOK_DATA_DIRECTORIES";
pub const ENV_OSD_STORE: &str = "ROOK_OSD_STORE";
pub const ENV_OSD_DATABASE_SIZE: &str = "ROOK_OSD_DATABASE_SIZE";
pub const ENV_OSD_WAL_SIZE: &str = "ROOK_OSD_WAL_SIZE";
pub const ENV_OSD_JOURNAL_SIZE: &str = "ROOK_OSD_JOURNAL_SIZE";
pub const ENV_LOCATION: &str = "ROOK_LOCATION";
pub const ENV_MON_ENDPOINTS: &str = "ROOK_MON_ENDPOINTS";
pub const ENV_MON_SECRET: &str = "ROOK_MON_SECRET";
pub const ENV_ADMIN_SECRET: &str = "ROOK_ADMIN_SECRET";
pub const ENV_CLUSTER_NAME: &str = "ROOK_CLUSTER_NAME";
pub const ENV_CONFIG_DIR: &str = "ROOK_CONFIG_DIR";
pub const ENV_POD_IP: &str = "ROOK_POD_IP";

/// Name of a cluster-scoped annotation or label under the rook group.
pub fn group_key(key: &str) -> String {
    format!("{}/{}", CEPH_GROUP.as_str(), key)
}

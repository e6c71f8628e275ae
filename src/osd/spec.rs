use k8s_openapi::api::core::v1::ResourceRequirements;

use crate::api::v1::cluster::{Config, Directory, Node, Selection, StorageSpec, StoreConfig};

/// Device filter value that tells the daemon to migrate data off the node and exit.
pub const REMOVAL_SENTINEL: &str = "none";

/// Device filter value that selects every device.
pub const ALL_DEVICES: &str = "all";

pub fn is_removing_node(device_filter: Option<&str>) -> bool {
    device_filter == Some(REMOVAL_SENTINEL)
}

fn resolve_selection(node: &Selection, defaults: &Selection) -> Selection {
    Selection {
        use_all_devices: node.use_all_devices.or(defaults.use_all_devices),
        device_filter: node
            .device_filter
            .clone()
            .or_else(|| defaults.device_filter.clone()),
        metadata_device: node
            .metadata_device
            .clone()
            .or_else(|| defaults.metadata_device.clone()),
        directories: node
            .directories
            .clone()
            .or_else(|| defaults.directories.clone()),
    }
}

fn resolve_store_config(node: Option<&StoreConfig>, defaults: Option<&StoreConfig>) -> Option<StoreConfig> {
    match (node, defaults) {
        (None, None) => None,
        (Some(n), None) => Some(n.clone()),
        (None, Some(d)) => Some(d.clone()),
        (Some(n), Some(d)) => Some(StoreConfig {
            store_type: n.store_type.clone().or_else(|| d.store_type.clone()),
            wal_size_mb: n.wal_size_mb.or(d.wal_size_mb),
            database_size_mb: n.database_size_mb.or(d.database_size_mb),
            journal_size_mb: n.journal_size_mb.or(d.journal_size_mb),
        }),
    }
}

fn resolve_config(node: &Config, defaults: &Config) -> Config {
    Config {
        store_config: resolve_store_config(node.store_config.as_ref(), defaults.store_config.as_ref()),
        location: node.location.clone().or_else(|| defaults.location.clone()),
    }
}

/// The named node with every unset field taken from the storage defaults.
/// `None` when the node is not listed under `storage.nodes`.
pub fn resolve_node(storage: &StorageSpec, name: &str) -> Option<Node> {
    let node = storage.nodes.iter().find(|n| n.name == name)?;
    Some(Node {
        name: node.name.clone(),
        devices: node.devices.clone(),
        resources: node.resources.clone(),
        selection: resolve_selection(&node.selection, &storage.selection),
        config: resolve_config(&node.config, &storage.config),
    })
}

/// Node level requests win over the cluster wide osd requests.
pub fn resolve_resources(
    node: Option<&ResourceRequirements>,
    cluster: Option<&ResourceRequirements>,
) -> Option<ResourceRequirements> {
    match (node, cluster) {
        (Some(n), Some(c)) => {
            let mut limits = c.limits.clone().unwrap_or_default();
            limits.extend(n.limits.clone().unwrap_or_default());
            let mut requests = c.requests.clone().unwrap_or_default();
            requests.extend(n.requests.clone().unwrap_or_default());
            Some(ResourceRequirements {
                limits: (!limits.is_empty()).then_some(limits),
                requests: (!requests.is_empty()).then_some(requests),
                ..Default::default()
            })
        }
        (n, c) => n.or(c).cloned(),
    }
}

/// A node as discovered from its running deployment, with just enough
/// filled in to remove it: the name and the directories it serves.
pub fn removal_target(name: &str, directories: Vec<Directory>) -> Node {
    Node {
        name: name.to_string(),
        selection: Selection {
            device_filter: Some(REMOVAL_SENTINEL.to_string()),
            directories: (!directories.is_empty()).then_some(directories),
            ..Default::default()
        },
        ..Default::default()
    }
}

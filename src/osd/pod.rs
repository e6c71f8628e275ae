use std::collections::BTreeMap;

use k8s_openapi::{
    api::{
        apps::v1::{
            DaemonSet, DaemonSetSpec, DaemonSetUpdateStrategy, Deployment, DeploymentSpec,
        },
        core::v1::{
            Container, HostPathVolumeSource, PodSpec, PodTemplateSpec, ResourceRequirements,
            SecurityContext, Volume, VolumeMount,
        },
    },
    apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference},
};
use kube::api::ObjectMeta;

use super::spec::{is_removing_node, ALL_DEVICES};
use crate::{
    api::{
        constants::{
            APP_ATTR, CLUSTER_ATTR, DEFAULT_CONFIG_DIR, ENV_DATA_DEVICES, ENV_DATA_DEVICE_FILTER,
            ENV_DATA_DIRECTORIES, ENV_LOCATION, ENV_METADATA_DEVICE, ENV_OSD_DATABASE_SIZE,
            ENV_OSD_JOURNAL_SIZE, ENV_OSD_STORE, ENV_OSD_WAL_SIZE, ENV_ROOK_NODE_NAME,
            HOSTNAME_LABEL, OSD_APP, TOPOLOGY_LOCATION_LABEL_PREFIX,
        },
        v1::cluster::{Directory, Node, Placement},
    },
    mon::workload::{cluster_env, data_volume, env_from_field, env_value},
};

const DATA_VOLUME: &str = "rook-config-dir";
const DEVICES_VOLUME: &str = "devices";

/// Cluster wide inputs of every osd workload.
#[derive(Clone, Debug)]
pub struct OsdParams {
    pub namespace: String,
    pub cluster_name: String,
    pub image: String,
    pub host_network: bool,
    pub data_dir_host_path: String,
    pub placement: Placement,
    pub owner: OwnerReference,
}

pub fn deployment_name(node: &str) -> String {
    format!("{OSD_APP}-{node}")
}

/// `/rook/data` becomes `rook-data`.
pub fn path_to_volume_name(path: &str) -> String {
    path.trim_matches('/').replace('/', "-").to_lowercase()
}

fn osd_labels(namespace: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (APP_ATTR.to_string(), OSD_APP.to_string()),
        (CLUSTER_ATTR.to_string(), namespace.to_string()),
    ])
}

/// `topology-location-<type>` labels from the host and a `k=v,k=v` crush location.
pub fn topology_labels(host: &str, location: Option<&str>) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::from([(
        format!("{TOPOLOGY_LOCATION_LABEL_PREFIX}host"),
        host.to_string(),
    )]);
    for pair in location.unwrap_or_default().split(',') {
        if let Some((kind, value)) = pair.trim().split_once('=') {
            if !kind.is_empty() && !value.is_empty() {
                labels.insert(
                    format!("{TOPOLOGY_LOCATION_LABEL_PREFIX}{}", kind.trim()),
                    value.trim().to_string(),
                );
            }
        }
    }
    labels
}

fn osd_container(node: &Node, resources: Option<ResourceRequirements>, cluster_name: &str) -> Container {
    let selection = &node.selection;
    let mut env = vec![env_from_field(ENV_ROOK_NODE_NAME, "spec.nodeName")];
    env.extend(cluster_env(cluster_name));

    // device list, device filter and all devices are exclusive, in that order
    let mut dev_mount = true;
    match (&node.devices, selection.device_filter.as_deref(), selection.use_all_devices) {
        (Some(devices), _, _) if !devices.is_empty() => {
            let names: Vec<&str> = devices.iter().map(|d| d.name.as_str()).collect();
            env.push(env_value(ENV_DATA_DEVICES, names.join(",")));
        }
        (_, Some(filter), _) if !filter.is_empty() => {
            env.push(env_value(ENV_DATA_DEVICE_FILTER, filter));
            // the removal sentinel does not touch any device
            dev_mount = !is_removing_node(Some(filter));
        }
        (_, _, Some(true)) => env.push(env_value(ENV_DATA_DEVICE_FILTER, ALL_DEVICES)),
        _ => dev_mount = false,
    }
    if let Some(metadata) = selection.metadata_device.as_deref().filter(|m| !m.is_empty()) {
        env.push(env_value(ENV_METADATA_DEVICE, metadata));
        dev_mount = true;
    }

    let mut mounts = vec![VolumeMount {
        name: DATA_VOLUME.to_string(),
        mount_path: DEFAULT_CONFIG_DIR.to_string(),
        ..Default::default()
    }];
    if dev_mount {
        mounts.push(VolumeMount {
            name: DEVICES_VOLUME.to_string(),
            mount_path: "/dev".to_string(),
            ..Default::default()
        });
    }

    let directories = selection.directories.clone().unwrap_or_default();
    if !directories.is_empty() {
        let paths: Vec<&str> = directories.iter().map(|d| d.path.as_str()).collect();
        mounts.extend(directories.iter().map(|d| VolumeMount {
            name: path_to_volume_name(&d.path),
            mount_path: d.path.clone(),
            ..Default::default()
        }));
        // a node being removed still mounts its dirs to migrate data off them
        if !is_removing_node(selection.device_filter.as_deref()) {
            env.push(env_value(ENV_DATA_DIRECTORIES, paths.join(",")));
        }
    }

    if let Some(store) = &node.config.store_config {
        if let Some(store_type) = store.store_type.as_deref().filter(|s| !s.is_empty()) {
            env.push(env_value(ENV_OSD_STORE, store_type));
        }
        let sizes = [
            (ENV_OSD_DATABASE_SIZE, store.database_size_mb),
            (ENV_OSD_WAL_SIZE, store.wal_size_mb),
            (ENV_OSD_JOURNAL_SIZE, store.journal_size_mb),
        ];
        for (name, size) in sizes {
            if let Some(size) = size.filter(|s| *s != 0) {
                env.push(env_value(name, size.to_string()));
            }
        }
    }
    if let Some(location) = node.config.location.as_deref().filter(|l| !l.is_empty()) {
        env.push(env_value(ENV_LOCATION, location));
    }

    Container {
        name: OSD_APP.to_string(),
        args: Some(vec!["osd".to_string()]),
        env: Some(env),
        volume_mounts: Some(mounts),
        security_context: Some(SecurityContext {
            privileged: Some(dev_mount),
            run_as_user: Some(0),
            read_only_root_filesystem: Some(false),
            ..Default::default()
        }),
        resources,
        ..Default::default()
    }
}

/// Pod template of an osd daemon serving `node`'s storage.
pub fn osd_pod_template(params: &OsdParams, node: &Node, resources: Option<ResourceRequirements>) -> PodTemplateSpec {
    let mut container = osd_container(node, resources, &params.cluster_name);
    container.image = Some(params.image.clone());
    let dev_mount = container
        .security_context
        .as_ref()
        .and_then(|s| s.privileged)
        .unwrap_or(false);

    let mut volumes = vec![if params.data_dir_host_path.is_empty() {
        data_volume(DATA_VOLUME, "", "")
    } else {
        host_path_volume(DATA_VOLUME, &params.data_dir_host_path)
    }];
    if dev_mount {
        volumes.push(host_path_volume(DEVICES_VOLUME, "/dev"));
    }
    for dir in node.selection.directories.iter().flatten() {
        volumes.push(host_path_volume(&path_to_volume_name(&dir.path), &dir.path));
    }

    let mut spec = PodSpec {
        service_account_name: Some(OSD_APP.to_string()),
        containers: vec![container],
        restart_policy: Some("Always".to_string()),
        volumes: Some(volumes),
        host_network: params.host_network.then_some(true),
        dns_policy: params
            .host_network
            .then(|| "ClusterFirstWithHostNet".to_string()),
        ..Default::default()
    };
    params.placement.apply_to_pod_spec(&mut spec);

    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            name: Some(OSD_APP.to_string()),
            labels: Some(osd_labels(&params.namespace)),
            ..Default::default()
        }),
        spec: Some(spec),
    }
}

fn host_path_volume(name: &str, path: &str) -> Volume {
    Volume {
        name: name.to_string(),
        host_path: Some(HostPathVolumeSource {
            path: path.to_string(),
            type_: None,
        }),
        ..Default::default()
    }
}

/// One replica pinned to the node by hostname.
pub fn osd_deployment(params: &OsdParams, node: &Node, resources: Option<ResourceRequirements>) -> Deployment {
    let mut template = osd_pod_template(params, node, resources);
    if let Some(spec) = template.spec.as_mut() {
        spec.node_selector = Some(BTreeMap::from([(
            HOSTNAME_LABEL.to_string(),
            node.name.clone(),
        )]));
    }
    // pods carry the topology too, disruption budgets select on it
    let topology = topology_labels(&node.name, node.config.location.as_deref());
    let mut labels = osd_labels(&params.namespace);
    labels.extend(topology.clone());

    Deployment {
        metadata: ObjectMeta {
            name: Some(deployment_name(&node.name)),
            namespace: Some(params.namespace.clone()),
            owner_references: Some(vec![params.owner.clone()]),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(BTreeMap::from([
                    (APP_ATTR.to_string(), OSD_APP.to_string()),
                    (format!("{TOPOLOGY_LOCATION_LABEL_PREFIX}host"), node.name.clone()),
                ])),
                ..Default::default()
            },
            template: with_labels(template, topology),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn with_labels(mut template: PodTemplateSpec, extra: BTreeMap<String, String>) -> PodTemplateSpec {
    let metadata = template.metadata.get_or_insert_with(Default::default);
    metadata.labels.get_or_insert_with(Default::default).extend(extra);
    template
}

/// One osd daemon on every schedulable node matching the placement.
pub fn osd_daemon_set(params: &OsdParams, defaults: &Node, resources: Option<ResourceRequirements>) -> DaemonSet {
    DaemonSet {
        metadata: ObjectMeta {
            name: Some(OSD_APP.to_string()),
            namespace: Some(params.namespace.clone()),
            owner_references: Some(vec![params.owner.clone()]),
            labels: Some(osd_labels(&params.namespace)),
            ..Default::default()
        },
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(osd_labels(&params.namespace)),
                ..Default::default()
            },
            update_strategy: Some(DaemonSetUpdateStrategy {
                type_: Some("RollingUpdate".to_string()),
                ..Default::default()
            }),
            template: osd_pod_template(params, defaults, resources),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Hostname an osd deployment is pinned to.
pub fn node_of_deployment(deployment: &Deployment) -> Option<String> {
    deployment
        .spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .node_selector
        .as_ref()?
        .get(HOSTNAME_LABEL)
        .filter(|n| !n.is_empty())
        .cloned()
}

/// Directories an osd deployment serves, read back from its environment.
pub fn directories_of_deployment(deployment: &Deployment) -> Vec<Directory> {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|s| s.containers.first())
        .and_then(|c| c.env.as_ref())
        .and_then(|env| env.iter().find(|e| e.name == ENV_DATA_DIRECTORIES))
        .and_then(|e| e.value.as_deref())
        .map(|dirs| {
            dirs.split(',')
                .filter(|d| !d.is_empty())
                .map(|d| Directory { path: d.to_string() })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::v1::cluster::{Device, Selection},
        osd::spec::removal_target,
    };
    use rstest::rstest;

    fn params() -> OsdParams {
        OsdParams {
            namespace: "rook".into(),
            cluster_name: "rook".into(),
            image: "rook/rook:v0.8.0".into(),
            host_network: false,
            data_dir_host_path: "/var/lib/rook".into(),
            placement: Placement::default(),
            owner: OwnerReference::default(),
        }
    }

    fn env_of(d: &Deployment) -> BTreeMap<String, String> {
        d.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0]
            .env
            .clone()
            .unwrap()
            .into_iter()
            .filter_map(|e| e.value.map(|v| (e.name, v)))
            .collect()
    }

    fn privileged(d: &Deployment) -> bool {
        d.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0]
            .security_context
            .as_ref()
            .unwrap()
            .privileged
            .unwrap()
    }

    fn node(devices: Option<Vec<&str>>, filter: Option<&str>, all: Option<bool>) -> Node {
        Node {
            name: "node1".into(),
            devices: devices.map(|d| d.into_iter().map(|n| Device { name: n.into() }).collect()),
            selection: Selection {
                use_all_devices: all,
                device_filter: filter.map(str::to_string),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[rstest]
    #[case(node(Some(vec!["sda", "sdb"]), Some("^sd."), Some(true)), ENV_DATA_DEVICES, "sda,sdb")]
    #[case(node(None, Some("^sd."), Some(true)), ENV_DATA_DEVICE_FILTER, "^sd.")]
    #[case(node(None, None, Some(true)), ENV_DATA_DEVICE_FILTER, "all")]
    fn device_selection_priority(#[case] node: Node, #[case] key: &str, #[case] value: &str) {
        let d = osd_deployment(&params(), &node, None);
        let env = env_of(&d);
        assert_eq!(env.get(key).map(String::as_str), Some(value));
        if key == ENV_DATA_DEVICES {
            assert!(!env.contains_key(ENV_DATA_DEVICE_FILTER));
        }
        assert!(privileged(&d));
    }

    #[test]
    fn directories_only_node_is_unprivileged() {
        let mut n = node(None, None, None);
        n.selection.directories = Some(vec![Directory { path: "/rook/data".into() }]);
        let d = osd_deployment(&params(), &n, None);
        assert!(!privileged(&d));
        assert_eq!(env_of(&d).get(ENV_DATA_DIRECTORIES).map(String::as_str), Some("/rook/data"));
        assert_eq!(node_of_deployment(&d).as_deref(), Some("node1"));
        assert_eq!(directories_of_deployment(&d), vec![Directory { path: "/rook/data".into() }]);
        let volumes = d.spec.unwrap().template.spec.unwrap().volumes.unwrap();
        assert!(volumes.iter().any(|v| v.name == "rook-data" && v.host_path.as_ref().unwrap().path == "/rook/data"));
    }

    #[test]
    fn removal_keeps_mounts_but_drops_the_directory_list() {
        let target = removal_target("node2", vec![Directory { path: "/rook/data".into() }]);
        let d = osd_deployment(&params(), &target, None);
        let env = env_of(&d);
        assert_eq!(env.get(ENV_DATA_DEVICE_FILTER).map(String::as_str), Some("none"));
        assert!(!env.contains_key(ENV_DATA_DIRECTORIES));
        assert!(!privileged(&d));
        let mounts = d.spec.unwrap().template.spec.unwrap().containers[0].volume_mounts.clone().unwrap();
        assert!(mounts.iter().any(|m| m.mount_path == "/rook/data"));
    }

    #[test]
    fn location_becomes_topology_labels() {
        let labels = topology_labels("node1", Some("rack=r1, zone=z1"));
        assert_eq!(labels["topology-location-host"], "node1");
        assert_eq!(labels["topology-location-rack"], "r1");
        assert_eq!(labels["topology-location-zone"], "z1");
    }
}

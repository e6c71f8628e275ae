use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy},
        core::v1::{
            ConfigMapKeySelector, Container, ContainerPort, EmptyDirVolumeSource, EnvVar,
            EnvVarSource, HostPathVolumeSource, ObjectFieldSelector, PodSpec, PodTemplateSpec,
            ResourceRequirements, SecretKeySelector, Volume, VolumeMount,
        },
    },
    apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference},
};
use kube::api::ObjectMeta;
use std::collections::BTreeMap;

use crate::api::{
    constants::{
        APP_ATTR, CLUSTER_ATTR, DEFAULT_CONFIG_DIR, ENV_ADMIN_SECRET, ENV_CLUSTER_NAME,
        ENV_CONFIG_DIR, ENV_MON_ENDPOINTS, ENV_MON_SECRET, ENV_POD_IP, ENV_POD_NAMESPACE,
        HOSTNAME_LABEL, MON_APP, MON_ENDPOINTS_CONFIGMAP, MON_ENDPOINTS_DATA_KEY, MON_PORT,
        MON_SECRET_NAME,
    },
    v1::cluster::Placement,
};

pub const MON_LABEL: &str = "mon";

pub fn env_value(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

pub fn env_from_field(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn env_from_secret(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret.to_string(),
                key: key.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn env_from_config_map(name: &str, config_map: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            config_map_key_ref: Some(ConfigMapKeySelector {
                name: config_map.to_string(),
                key: key.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Env every rook daemon needs to reach the mons.
pub fn cluster_env(cluster_name: &str) -> Vec<EnvVar> {
    vec![
        env_value(ENV_CLUSTER_NAME, cluster_name),
        env_value(ENV_CONFIG_DIR, DEFAULT_CONFIG_DIR),
        env_from_field(ENV_POD_NAMESPACE, "metadata.namespace"),
        env_from_config_map(ENV_MON_ENDPOINTS, MON_ENDPOINTS_CONFIGMAP, MON_ENDPOINTS_DATA_KEY),
        env_from_secret(ENV_MON_SECRET, MON_SECRET_NAME, "mon-secret"),
        env_from_secret(ENV_ADMIN_SECRET, MON_SECRET_NAME, "admin-secret"),
    ]
}

/// Host path when the cluster keeps daemon data on the host, pod-local otherwise.
pub fn data_volume(name: &str, data_dir_host_path: &str, sub_dir: &str) -> Volume {
    if data_dir_host_path.is_empty() {
        Volume {
            name: name.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        }
    } else {
        Volume {
            name: name.to_string(),
            host_path: Some(HostPathVolumeSource {
                path: format!("{}/{}", data_dir_host_path.trim_end_matches('/'), sub_dir),
                type_: Some("DirectoryOrCreate".to_string()),
            }),
            ..Default::default()
        }
    }
}

/// Everything needed to render one mon.
#[derive(Clone, Debug, PartialEq)]
pub struct MonParams {
    pub name: String,
    pub node: String,
    pub namespace: String,
    pub cluster_name: String,
    pub image: String,
    pub host_network: bool,
    pub data_dir_host_path: String,
    pub placement: Placement,
    pub resources: Option<ResourceRequirements>,
    pub owner: OwnerReference,
}

pub fn mon_labels(name: &str, namespace: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (APP_ATTR.to_string(), MON_APP.to_string()),
        (MON_LABEL.to_string(), name.to_string()),
        (CLUSTER_ATTR.to_string(), namespace.to_string()),
    ])
}

/// Single replica deployment pinned to its node by hostname.
pub fn mon_deployment(params: &MonParams) -> Deployment {
    let labels = mon_labels(&params.name, &params.namespace);

    let mut env = cluster_env(&params.cluster_name);
    env.push(env_from_field(ENV_POD_IP, "status.podIP"));

    let mut pod_spec = PodSpec {
        containers: vec![Container {
            name: MON_LABEL.to_string(),
            image: Some(params.image.clone()),
            args: Some(vec![
                "mon".to_string(),
                format!("--config-dir={DEFAULT_CONFIG_DIR}"),
                format!("--name={}", params.name),
                format!("--port={MON_PORT}"),
            ]),
            ports: Some(vec![ContainerPort {
                container_port: MON_PORT as i32,
                name: Some("client".to_string()),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            env: Some(env),
            volume_mounts: Some(vec![VolumeMount {
                name: "rook-data".to_string(),
                mount_path: DEFAULT_CONFIG_DIR.to_string(),
                ..Default::default()
            }]),
            resources: params.resources.clone(),
            ..Default::default()
        }],
        volumes: Some(vec![data_volume(
            "rook-data",
            &params.data_dir_host_path,
            &params.name,
        )]),
        node_selector: Some(BTreeMap::from([(
            HOSTNAME_LABEL.to_string(),
            params.node.clone(),
        )])),
        host_network: params.host_network.then_some(true),
        dns_policy: params
            .host_network
            .then(|| "ClusterFirstWithHostNet".to_string()),
        restart_policy: Some("Always".to_string()),
        ..Default::default()
    };
    params.placement.apply_to_pod_spec(&mut pod_spec);

    Deployment {
        metadata: ObjectMeta {
            name: Some(params.name.clone()),
            namespace: Some(params.namespace.clone()),
            owner_references: Some(vec![params.owner.clone()]),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            // a mon must never run twice against the same data dir
            strategy: Some(DeploymentStrategy {
                type_: Some("Recreate".to_string()),
                ..Default::default()
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    name: Some(params.name.clone()),
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

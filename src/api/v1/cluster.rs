use std::fmt::Debug;

use chrono::{DateTime, Utc};
use garde::Validate;
use k8s_openapi::api::core::v1::{
    Affinity, NodeAffinity, PodAffinity, PodAntiAffinity, PodSpec, ResourceRequirements,
    Toleration,
};
use kube::{CustomResource, KubeSchema};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::api::constants::{DEFAULT_CLUSTER_NAME, DEFAULT_ROOK_IMAGE};

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, KubeSchema, Validate)]
#[kube(
    group = "ceph.rook.io",
    version = "v1",
    kind = "Cluster",
    status = "ClusterStatus",
    shortname = "rcc",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Storage backend, only `ceph` is understood.
    #[garde(custom(supported_backend))]
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Host path for persistent daemon data. Empty means pod-local storage.
    #[garde(skip)]
    #[serde(default)]
    #[x_kube(validation = Rule::new("self == oldSelf").message("is immutable"))]
    pub data_dir_host_path: String,
    /// Rook image used by the mon and osd daemons.
    #[garde(length(min = 1))]
    #[serde(default = "default_image")]
    pub image: String,
    #[garde(skip)]
    #[serde(default)]
    pub host_network: bool,
    /// Number of monitors to keep running.
    #[garde(range(min = 1, max = 9))]
    #[serde(default = "default_mon_count")]
    pub mon_count: i32,
    /// Let the operator manage pod disruption budgets for the OSDs.
    #[garde(skip)]
    #[serde(default)]
    pub managed_disruption_budgets: bool,
    #[garde(dive)]
    #[serde(default)]
    pub storage: StorageSpec,
    #[garde(skip)]
    #[serde(default)]
    pub placement: PlacementSpec,
    #[garde(skip)]
    #[serde(default)]
    pub resources: ResourceSpec,
}

fn default_backend() -> String {
    "ceph".to_string()
}

fn default_image() -> String {
    DEFAULT_ROOK_IMAGE.to_string()
}

fn default_mon_count() -> i32 {
    3
}

fn supported_backend(value: &String, _: &()) -> garde::Result {
    if value == "ceph" {
        Ok(())
    } else {
        Err(garde::Error::new(format!("unsupported backend {value}")))
    }
}

fn absolute_path(value: &String, _: &()) -> garde::Result {
    if value.starts_with('/') {
        Ok(())
    } else {
        Err(garde::Error::new("must be an absolute path"))
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    pub state: Option<ClusterState>,
    pub message: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
/// Lifecycle of a cluster as seen by the operator.
pub enum ClusterState {
    /// First reconcile has not completed.
    Creating,
    /// Mons and osds converged.
    Created,
    /// A spec change is being rolled out.
    Updating,
    /// The last reconcile failed.
    Error,
}

impl Cluster {
    /// Name the backend knows this cluster by.
    pub fn cluster_name(&self) -> String {
        self.metadata
            .namespace
            .clone()
            .unwrap_or_else(|| DEFAULT_CLUSTER_NAME.to_string())
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Validate, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// Run one OSD daemon on every schedulable node.
    #[garde(skip)]
    #[serde(default)]
    pub use_all_nodes: bool,
    #[garde(dive)]
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[garde(dive)]
    #[serde(flatten)]
    pub selection: Selection,
    #[garde(dive)]
    #[serde(default)]
    pub config: Config,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Validate, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    #[garde(length(min = 1))]
    pub name: String,
    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub devices: Option<Vec<Device>>,
    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    #[garde(dive)]
    #[serde(flatten)]
    pub selection: Selection,
    #[garde(dive)]
    #[serde(default)]
    pub config: Config,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Validate, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    #[garde(length(min = 1))]
    pub name: String,
}

/// Which devices and directories an OSD daemon consumes.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Validate, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Selection {
    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_all_devices: Option<bool>,
    /// Regular expression matched against device names.
    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_filter: Option<String>,
    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_device: Option<String>,
    #[garde(dive)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directories: Option<Vec<Directory>>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Validate, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Directory {
    #[garde(custom(absolute_path))]
    pub path: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Validate, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[garde(dive)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_config: Option<StoreConfig>,
    /// CRUSH location of the node, e.g. `rack=a,row=1`.
    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Validate, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfig {
    /// `filestore` or `bluestore`.
    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_type: Option<String>,
    #[garde(range(min = 0))]
    #[serde(default, rename = "walSizeMB", skip_serializing_if = "Option::is_none")]
    pub wal_size_mb: Option<i32>,
    #[garde(range(min = 0))]
    #[serde(default, rename = "databaseSizeMB", skip_serializing_if = "Option::is_none")]
    pub database_size_mb: Option<i32>,
    #[garde(range(min = 0))]
    #[serde(default, rename = "journalSizeMB", skip_serializing_if = "Option::is_none")]
    pub journal_size_mb: Option<i32>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlacementSpec {
    pub all: Option<Placement>,
    pub api: Option<Placement>,
    pub mgr: Option<Placement>,
    pub mon: Option<Placement>,
    pub osd: Option<Placement>,
}

#[derive(Clone, Copy, Debug)]
pub enum Component {
    Api,
    Mgr,
    Mon,
    Osd,
}

impl PlacementSpec {
    /// Placement for a component, layered over `all`.
    pub fn for_component(&self, component: Component) -> Placement {
        let specific = match component {
            Component::Api => &self.api,
            Component::Mgr => &self.mgr,
            Component::Mon => &self.mon,
            Component::Osd => &self.osd,
        };
        let base = self.all.clone().unwrap_or_default();
        match specific {
            Some(p) => base.merge(p),
            None => base,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Placement {
    pub node_affinity: Option<NodeAffinity>,
    pub pod_affinity: Option<PodAffinity>,
    pub pod_anti_affinity: Option<PodAntiAffinity>,
    pub tolerations: Option<Vec<Toleration>>,
}

impl Placement {
    /// Fields set on `other` win; tolerations accumulate.
    pub fn merge(&self, other: &Placement) -> Placement {
        let tolerations = match (&self.tolerations, &other.tolerations) {
            (Some(a), Some(b)) => Some(a.iter().chain(b.iter()).cloned().collect()),
            (a, b) => b.clone().or_else(|| a.clone()),
        };
        Placement {
            node_affinity: other.node_affinity.clone().or_else(|| self.node_affinity.clone()),
            pod_affinity: other.pod_affinity.clone().or_else(|| self.pod_affinity.clone()),
            pod_anti_affinity: other
                .pod_anti_affinity
                .clone()
                .or_else(|| self.pod_anti_affinity.clone()),
            tolerations,
        }
    }

    pub fn apply_to_pod_spec(&self, pod_spec: &mut PodSpec) {
        if self.node_affinity.is_some() || self.pod_affinity.is_some() || self.pod_anti_affinity.is_some() {
            pod_spec.affinity = Some(Affinity {
                node_affinity: self.node_affinity.clone(),
                pod_affinity: self.pod_affinity.clone(),
                pod_anti_affinity: self.pod_anti_affinity.clone(),
            });
        }
        if let Some(tolerations) = &self.tolerations {
            pod_spec.tolerations = Some(tolerations.clone());
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    pub api: Option<ResourceRequirements>,
    pub mgr: Option<ResourceRequirements>,
    pub mon: Option<ResourceRequirements>,
    pub osd: Option<ResourceRequirements>,
}

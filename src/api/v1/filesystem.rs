use std::fmt::Debug;

use garde::Validate;
use k8s_openapi::api::core::v1::ResourceRequirements;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{cluster::Placement, pool::PoolSpec};

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, Validate)]
#[kube(
    group = "ceph.rook.io",
    version = "v1",
    kind = "Filesystem",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct FilesystemSpec {
    #[garde(dive)]
    pub metadata_pool: PoolSpec,
    #[garde(dive)]
    pub data_pools: Vec<PoolSpec>,
    #[garde(dive)]
    pub metadata_server: MetadataServerSpec,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct MetadataServerSpec {
    #[garde(range(min = 1))]
    pub active_count: i32,
    #[garde(skip)]
    #[serde(default)]
    pub active_standby: bool,
    #[garde(skip)]
    #[serde(default)]
    pub placement: Placement,
    #[garde(skip)]
    pub resources: Option<ResourceRequirements>,
}

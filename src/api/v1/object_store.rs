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
    kind = "ObjectStore",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ObjectStoreSpec {
    #[garde(dive)]
    pub metadata_pool: PoolSpec,
    #[garde(dive)]
    pub data_pool: PoolSpec,
    #[garde(dive)]
    pub gateway: GatewaySpec,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySpec {
    #[garde(range(min = 1, max = 65535))]
    #[serde(default = "default_port")]
    pub port: i32,
    #[garde(range(min = 0, max = 65535))]
    #[serde(default = "default_secure_port")]
    pub secure_port: i32,
    #[garde(range(min = 1))]
    #[serde(default = "default_instances")]
    pub instances: i32,
    /// Run a gateway on every node instead of `instances` replicas.
    #[garde(skip)]
    #[serde(default)]
    pub all_nodes: bool,
    /// Secret holding the certificate served on `securePort`.
    #[garde(skip)]
    pub ssl_certificate_ref: Option<String>,
    #[garde(skip)]
    #[serde(default)]
    pub placement: Placement,
    #[garde(skip)]
    pub resources: Option<ResourceRequirements>,
}

fn default_port() -> i32 {
    80
}

fn default_secure_port() -> i32 {
    443
}

fn default_instances() -> i32 {
    1
}

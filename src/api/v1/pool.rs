use std::fmt::{self, Debug, Display};

use chrono::{DateTime, Utc};
use garde::Validate;
use kube::{CustomResource, KubeSchema};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, KubeSchema, Validate, PartialEq)]
#[kube(
    group = "ceph.rook.io",
    version = "v1",
    kind = "Pool",
    status = "PoolStatus",
    namespaced
)]
#[x_kube(validation = Rule::new("has(self.replicated) != has(self.erasureCoded)").message("exactly one of replicated or erasureCoded must be set"))]
#[serde(rename_all = "camelCase")]
pub struct PoolSpec {
    /// Smallest CRUSH bucket type a replica or chunk may share. Defaults to `host`.
    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_domain: Option<FailureDomain>,
    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crush_root: Option<String>,
    #[garde(dive)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicated: Option<ReplicatedSpec>,
    #[garde(dive)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub erasure_coded: Option<ErasureCodedSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicatedSpec {
    #[garde(range(min = 1))]
    pub size: u32,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErasureCodedSpec {
    #[garde(range(min = 1))]
    pub data_chunks: u32,
    #[garde(range(min = 1))]
    pub coding_chunks: u32,
    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<String>,
}

/// CRUSH bucket types, ordered by blast radius.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum FailureDomain {
    Osd,
    #[default]
    Host,
    Zone,
    Region,
}

impl FailureDomain {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureDomain::Osd => "osd",
            FailureDomain::Host => "host",
            FailureDomain::Zone => "zone",
            FailureDomain::Region => "region",
        }
    }
}

impl Display for FailureDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The redundancy scheme a pool asks for.
#[derive(Debug, Clone, PartialEq)]
pub enum PoolKind<'a> {
    Replicated(&'a ReplicatedSpec),
    ErasureCoded(&'a ErasureCodedSpec),
}

impl PoolSpec {
    pub fn failure_domain(&self) -> FailureDomain {
        self.failure_domain.unwrap_or_default()
    }

    pub fn kind(&self) -> Result<PoolKind<'_>> {
        match (&self.replicated, &self.erasure_coded) {
            (Some(r), None) => Ok(PoolKind::Replicated(r)),
            (None, Some(ec)) => Ok(PoolKind::ErasureCoded(ec)),
            (Some(_), Some(_)) => Err(Error::InvalidSpec(
                "both replicated and erasureCoded are set".to_string(),
            )),
            (None, None) => Err(Error::InvalidSpec(
                "one of replicated or erasureCoded must be set".to_string(),
            )),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatus {
    pub phase: Option<PoolPhase>,
    pub message: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
pub enum PoolPhase {
    /// Pool exists on the backend.
    Created,
    /// Backend rejected the pool.
    Failed,
}

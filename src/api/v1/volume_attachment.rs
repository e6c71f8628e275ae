use std::fmt::Debug;

use garde::Validate;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Which pods on which nodes currently hold a persistent volume.
///
/// The object is named after the volume. It exists only while at least one
/// attachment is recorded.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, Validate, Default, PartialEq)]
#[kube(
    group = "ceph.rook.io",
    version = "v1",
    kind = "VolumeAttachment",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct VolumeAttachmentSpec {
    #[garde(dive)]
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Validate, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    #[garde(length(min = 1))]
    pub node: String,
    #[garde(skip)]
    pub pod_namespace: String,
    #[garde(skip)]
    pub pod_name: String,
    #[garde(skip)]
    pub cluster_name: String,
    #[garde(length(min = 1))]
    pub mount_dir: String,
    #[garde(skip)]
    #[serde(default)]
    pub read_only: bool,
}

impl VolumeAttachmentSpec {
    /// At most one writer, and a writer never shares the volume.
    pub fn access_modes_consistent(&self) -> bool {
        let writers = self.attachments.iter().filter(|a| !a.read_only).count();
        writers == 0 || (writers == 1 && self.attachments.len() == 1)
    }

    pub fn mount_dirs_unique(&self) -> bool {
        let mut dirs: Vec<&str> = self.attachments.iter().map(|a| a.mount_dir.as_str()).collect();
        dirs.sort_unstable();
        dirs.windows(2).all(|w| w[0] != w[1])
    }
}

use async_trait::async_trait;
use kube::{
    api::{ApiResource, DeleteParams, DynamicObject, PostParams, Preconditions},
    core::GroupVersionKind,
    Api, Client, ResourceExt,
};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::{
    api::{
        constants::LEGACY_GROUP,
        v1::volume_attachment::{Attachment, VolumeAttachment},
    },
    error::not_found_as_none,
    Error, Result,
};

/// The attachments of one volume as last read, with the version to guard
/// the next write.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AttachmentRecord {
    pub volume: String,
    pub attachments: Vec<Attachment>,
    pub resource_version: Option<String>,
}

impl AttachmentRecord {
    pub fn new(volume: &str, attachments: Vec<Attachment>) -> Self {
        AttachmentRecord {
            volume: volume.to_string(),
            attachments,
            resource_version: None,
        }
    }
}

#[async_trait]
pub trait AttachmentStore: Send + Sync {
    async fn get(&self, volume: &str) -> Result<Option<AttachmentRecord>>;
    /// Fails with [`Error::Contended`] when a record for the volume exists.
    async fn create(&self, record: &AttachmentRecord) -> Result<()>;
    /// Fails with [`Error::Conflict`] when the record changed since it was read.
    async fn update(&self, record: &AttachmentRecord) -> Result<()>;
    /// Deletes the record only if it is still at the version it was read
    /// at, otherwise fails with [`Error::Conflict`]. Deleting a missing
    /// record succeeds.
    async fn delete(&self, record: &AttachmentRecord) -> Result<()>;
}

/// Where the attachment list sits inside the object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Layout {
    /// `spec.attachments` of `ceph.rook.io/v1`
    Spec,
    /// top level `attachments` of `rook.io/v1alpha1`
    Legacy,
}

/// True for API servers older than 1.7, which only know the legacy kind.
pub fn is_legacy_server(major: &str, minor: &str) -> bool {
    let number = |s: &str| -> Option<u32> {
        s.chars()
            .take_while(char::is_ascii_digit)
            .collect::<String>()
            .parse()
            .ok()
    };
    match (number(major), number(minor)) {
        (Some(major), Some(minor)) => major < 1 || (major == 1 && minor < 7),
        _ => false,
    }
}

/// Attachment records as custom objects in the agent's namespace.
pub struct KubeAttachmentStore {
    api: Api<DynamicObject>,
    resource: ApiResource,
    layout: Layout,
}

impl KubeAttachmentStore {
    /// Picks the record kind the API server supports.
    pub async fn discover(client: Client, namespace: &str) -> Result<Self> {
        let version = client.apiserver_version().await?;
        let legacy = is_legacy_server(&version.major, &version.minor);
        let (resource, layout) = if legacy {
            info!(
                "api server {}.{} predates 1.7, using {}/v1alpha1 attachment records",
                version.major, version.minor, LEGACY_GROUP.as_str()
            );
            let gvk = GroupVersionKind::gvk(LEGACY_GROUP.as_str(), "v1alpha1", "VolumeAttachment");
            (ApiResource::from_gvk_with_plural(&gvk, "volumeattachments"), Layout::Legacy)
        } else {
            (ApiResource::erase::<VolumeAttachment>(&()), Layout::Spec)
        };
        Ok(KubeAttachmentStore {
            api: Api::namespaced_with(client, namespace, &resource),
            resource,
            layout,
        })
    }

    fn to_object(&self, record: &AttachmentRecord) -> Result<DynamicObject> {
        let attachments = serde_json::to_value(&record.attachments)?;
        let data = match self.layout {
            Layout::Spec => json!({ "spec": { "attachments": attachments } }),
            Layout::Legacy => json!({ "attachments": attachments }),
        };
        let mut obj = DynamicObject::new(&record.volume, &self.resource).data(data);
        obj.metadata.resource_version = record.resource_version.clone();
        Ok(obj)
    }

    fn from_object(&self, obj: DynamicObject) -> Result<AttachmentRecord> {
        let list = match self.layout {
            Layout::Spec => obj.data.get("spec").and_then(|s| s.get("attachments")),
            Layout::Legacy => obj.data.get("attachments"),
        };
        let attachments = match list {
            Some(Value::Null) | None => vec![],
            Some(value) => serde_json::from_value(value.clone())?,
        };
        Ok(AttachmentRecord {
            volume: obj.name_any(),
            resource_version: obj.resource_version(),
            attachments,
        })
    }
}

#[async_trait]
impl AttachmentStore for KubeAttachmentStore {
    async fn get(&self, volume: &str) -> Result<Option<AttachmentRecord>> {
        not_found_as_none(self.api.get(volume).await)?
            .map(|obj| self.from_object(obj))
            .transpose()
    }

    async fn create(&self, record: &AttachmentRecord) -> Result<()> {
        let obj = self.to_object(record)?;
        match self.api.create(&PostParams::default(), &obj).await {
            Ok(_) => Ok(()),
            Err(e) => {
                let e = Error::from(e);
                if e.is_already_exists() {
                    Err(Error::Contended(format!(
                        "attachment record for volume {} was created concurrently",
                        record.volume
                    )))
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn update(&self, record: &AttachmentRecord) -> Result<()> {
        let obj = self.to_object(record)?;
        match self.api.replace(&record.volume, &PostParams::default(), &obj).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 409 => Err(Error::Conflict(format!(
                "attachment record {}",
                record.volume
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, record: &AttachmentRecord) -> Result<()> {
        debug!("deleting attachment record {}", record.volume);
        let params = DeleteParams {
            preconditions: Some(Preconditions {
                resource_version: record.resource_version.clone(),
                uid: None,
            }),
            ..Default::default()
        };
        match self.api.delete(&record.volume, &params).await {
            Err(kube::Error::Api(resp)) if resp.code == 409 => Err(Error::Conflict(format!(
                "attachment record {}",
                record.volume
            ))),
            result => {
                not_found_as_none(result)?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("1", "6", true)]
    #[case("1", "6+", true)]
    #[case("1", "7", false)]
    #[case("1", "30+", false)]
    #[case("2", "0", false)]
    #[case("", "", false)]
    fn legacy_detection(#[case] major: &str, #[case] minor: &str, #[case] legacy: bool) {
        assert_eq!(is_legacy_server(major, minor), legacy);
    }
}

use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use super::store::{AttachmentRecord, AttachmentStore};
use crate::{
    api::v1::volume_attachment::Attachment,
    client::{
        ceph::{BlockAdmin, CephClient},
        executor::CommandExecutor,
    },
    telemetry::metrics::Metrics,
    Error, ErrorKind, Result,
};

const CONFLICT_RETRIES: usize = 3;

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    Ro,
    #[default]
    Rw,
}

/// What the flex driver knows about a mount, filled in from the mount
/// directory when the kubelet leaves fields out.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AttachOptions {
    pub image: String,
    pub pool: String,
    pub cluster_name: String,
    pub storage_class: String,
    pub mount_dir: String,
    pub volume_name: String,
    pub pod_name: String,
    pub pod_namespace: String,
    #[serde(rename = "podID")]
    pub pod_id: String,
    #[serde(rename = "rw")]
    pub access_mode: AccessMode,
}

impl AttachOptions {
    fn read_only(&self) -> bool {
        self.access_mode == AccessMode::Ro
    }
}

/// Whether a pod still exists, and in which phase.
#[async_trait]
pub trait PodLookup: Send + Sync {
    async fn pod_phase(&self, namespace: &str, name: &str) -> Result<Option<String>>;
}

pub struct KubePodLookup {
    client: Client,
}

impl KubePodLookup {
    pub fn new(client: Client) -> Self {
        KubePodLookup { client }
    }
}

#[async_trait]
impl PodLookup for KubePodLookup {
    async fn pod_phase(&self, namespace: &str, name: &str) -> Result<Option<String>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(pods.get_opt(name).await?.map(|pod| {
            pod.status
                .and_then(|s| s.phase)
                .unwrap_or_else(|| "Unknown".to_string())
        }))
    }
}

/// Maps and unmaps block images on this node.
#[async_trait]
pub trait VolumeBackend: Send + Sync {
    /// Returns the local device path.
    async fn attach(&self, image: &str, pool: &str, cluster_name: &str) -> Result<String>;
    async fn detach(&self, image: &str, pool: &str, cluster_name: &str, force: bool) -> Result<()>;
}

/// `rbd map`/`rbd unmap` against whichever cluster the volume lives in.
pub struct RbdVolumes {
    executor: Arc<dyn CommandExecutor>,
    config_dir: PathBuf,
}

impl RbdVolumes {
    pub fn new(executor: Arc<dyn CommandExecutor>, config_dir: PathBuf) -> Self {
        RbdVolumes { executor, config_dir }
    }

    fn client(&self, cluster_name: &str) -> CephClient<Arc<dyn CommandExecutor>> {
        CephClient::new(self.executor.clone(), cluster_name, self.config_dir.clone())
    }
}

#[async_trait]
impl VolumeBackend for RbdVolumes {
    async fn attach(&self, image: &str, pool: &str, cluster_name: &str) -> Result<String> {
        self.client(cluster_name).map_image(pool, image).await
    }

    async fn detach(&self, image: &str, pool: &str, cluster_name: &str, force: bool) -> Result<()> {
        self.client(cluster_name).unmap_image(pool, image, force).await
    }
}

/// Keeps the per-volume attachment records of this node's pods consistent
/// and maps the images behind them.
pub struct AttachmentCoordinator {
    node: String,
    store: Arc<dyn AttachmentStore>,
    pods: Arc<dyn PodLookup>,
    volumes: Arc<dyn VolumeBackend>,
    metrics: Arc<Metrics>,
}

impl AttachmentCoordinator {
    pub fn new(
        node: impl Into<String>,
        store: Arc<dyn AttachmentStore>,
        pods: Arc<dyn PodLookup>,
        volumes: Arc<dyn VolumeBackend>,
        metrics: Arc<Metrics>,
    ) -> Self {
        AttachmentCoordinator {
            node: node.into(),
            store,
            pods,
            volumes,
            metrics,
        }
    }

    fn attachment_for(&self, opts: &AttachOptions) -> Attachment {
        Attachment {
            node: self.node.clone(),
            pod_namespace: opts.pod_namespace.clone(),
            pod_name: opts.pod_name.clone(),
            cluster_name: opts.cluster_name.clone(),
            mount_dir: opts.mount_dir.clone(),
            read_only: opts.read_only(),
        }
    }

    /// Records the attachment, then maps the image. Returns the device path.
    #[instrument(skip(self, opts), fields(volume = %opts.volume_name, pod = %opts.pod_name))]
    pub async fn attach(&self, opts: &AttachOptions) -> Result<String> {
        let recorded = retry_on_conflict(|| self.record_attachment(opts)).await;
        if let Err(e) = recorded {
            let outcome = match e {
                Error::AlreadyAttached(_) => "already_attached",
                Error::Contended(_) => "contended",
                _ => "error",
            };
            self.metrics.storage.attachment(outcome);
            return Err(e);
        }

        match self.volumes.attach(&opts.image, &opts.pool, &opts.cluster_name).await {
            Ok(device) => {
                self.metrics.storage.attachment("attached");
                info!("attached {}/{} at {device}", opts.pool, opts.image);
                Ok(device)
            }
            Err(e) => {
                self.metrics.storage.attachment("error");
                Err(e)
            }
        }
    }

    async fn record_attachment(&self, opts: &AttachOptions) -> Result<()> {
        let volume = opts.volume_name.as_str();
        let wanted = self.attachment_for(opts);

        let Some(mut record) = self.store.get(volume).await? else {
            info!("creating attachment record for volume {volume}");
            return self.store.create(&AttachmentRecord::new(volume, vec![wanted])).await;
        };

        if record.attachments.iter().any(|a| a.mount_dir == opts.mount_dir) {
            info!("volume {volume} is already recorded at {}", opts.mount_dir);
            return Ok(());
        }

        if let Some(index) = record.attachments.iter().position(|a| !a.read_only) {
            let owner = &record.attachments[index];
            let same_pod = owner.pod_namespace == opts.pod_namespace && owner.pod_name == opts.pod_name;
            let phase = if same_pod {
                None
            } else {
                self.pods.pod_phase(&owner.pod_namespace, &owner.pod_name).await?
            };
            return match phase {
                Some(phase) => Err(Error::AlreadyAttached(format!(
                    "volume {volume} is already attached by pod {}/{} ({phase}), cannot attach it to pod {}/{}",
                    owner.pod_namespace, owner.pod_name, opts.pod_namespace, opts.pod_name
                ))),
                None => {
                    info!(
                        "attachment of volume {volume} by pod {}/{} is orphaned, taking it over",
                        owner.pod_namespace, owner.pod_name
                    );
                    record.attachments[index] = wanted;
                    self.store.update(&record).await
                }
            };
        }

        if !opts.read_only() && !record.attachments.is_empty() {
            return Err(Error::AlreadyAttached(format!(
                "volume {volume} is attached read-only by {} pods, cannot attach it read-write to pod {}/{}",
                record.attachments.len(),
                opts.pod_namespace,
                opts.pod_name
            )));
        }

        record.attachments.push(wanted);
        self.store.update(&record).await
    }

    /// Unmaps the image, then drops the record once nothing holds the volume.
    #[instrument(skip(self, opts), fields(volume = %opts.volume_name))]
    pub async fn detach(&self, opts: &AttachOptions, force: bool) -> Result<()> {
        self.volumes
            .detach(&opts.image, &opts.pool, &opts.cluster_name, force)
            .await?;

        retry_on_conflict(|| self.delete_if_unused(&opts.volume_name)).await
    }

    async fn delete_if_unused(&self, volume: &str) -> Result<()> {
        match self.store.get(volume).await? {
            Some(record) if record.attachments.is_empty() => {
                info!("deleting attachment record {volume}");
                self.store.delete(&record).await
            }
            _ => Ok(()),
        }
    }

    /// Forgets this node's attachment at `mount_dir`. `true` when the node no
    /// longer holds the volume and the device can be unmapped.
    #[instrument(skip(self, opts), fields(volume = %opts.volume_name))]
    pub async fn remove_attachment_object(&self, opts: &AttachOptions) -> Result<bool> {
        retry_on_conflict(|| self.remove_once(opts)).await
    }

    async fn remove_once(&self, opts: &AttachOptions) -> Result<bool> {
        let volume = opts.volume_name.as_str();
        let mut record = self
            .store
            .get(volume)
            .await?
            .ok_or_else(|| Error::NotFound(format!("attachment record {volume}")))?;

        let before = record.attachments.len();
        record
            .attachments
            .retain(|a| !(a.node == self.node && a.mount_dir == opts.mount_dir));
        if record.attachments.len() == before {
            return Err(Error::NotFound(format!(
                "attachment of volume {volume} at {}",
                opts.mount_dir
            )));
        }

        let safe_to_detach = !record.attachments.iter().any(|a| a.node == self.node);
        if record.attachments.is_empty() {
            self.store.delete(&record).await?;
        } else {
            self.store.update(&record).await?;
        }
        Ok(safe_to_detach)
    }
}

async fn retry_on_conflict<T, F, Fut>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.kind() == ErrorKind::Conflict && attempt < CONFLICT_RETRIES => {
                warn!("{e}, retrying");
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakePods, FakeVolumes, MemoryAttachmentStore};

    struct Harness {
        store: Arc<MemoryAttachmentStore>,
        pods: Arc<FakePods>,
        volumes: Arc<FakeVolumes>,
    }

    impl Harness {
        fn new() -> Self {
            Harness {
                store: Arc::new(MemoryAttachmentStore::default()),
                pods: Arc::new(FakePods::default()),
                volumes: Arc::new(FakeVolumes::default()),
            }
        }

        fn on(&self, node: &str) -> AttachmentCoordinator {
            AttachmentCoordinator::new(
                node,
                self.store.clone(),
                self.pods.clone(),
                self.volumes.clone(),
                Arc::new(Metrics::default()),
            )
        }
    }

    fn opts(pod: &str, mount_dir: &str, mode: AccessMode) -> AttachOptions {
        AttachOptions {
            image: "pvc-1".into(),
            pool: "replicapool".into(),
            cluster_name: "rook".into(),
            storage_class: "rook-block".into(),
            mount_dir: mount_dir.into(),
            volume_name: "pvc-1".into(),
            pod_name: pod.into(),
            pod_namespace: "default".into(),
            access_mode: mode,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn first_attach_creates_the_record() {
        let h = Harness::new();
        let device = h.on("node1").attach(&opts("a", "/mnt/a", AccessMode::Rw)).await.unwrap();
        assert_eq!(device, "/dev/rbd0");
        let record = h.store.record("pvc-1").unwrap();
        assert_eq!(record.len(), 1);
        assert_eq!(record[0].node, "node1");
        assert!(!record[0].read_only);
    }

    #[tokio::test]
    async fn second_writer_is_refused_while_the_owner_lives() {
        let h = Harness::new();
        h.pods.running("default", "a");
        h.on("node1").attach(&opts("a", "/mnt/a", AccessMode::Rw)).await.unwrap();
        let before = h.store.record("pvc-1");

        let err = h
            .on("node2")
            .attach(&opts("b", "/mnt/b", AccessMode::Rw))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyAttached(_)));
        assert!(err.to_string().contains("default/a"));
        assert_eq!(h.store.record("pvc-1"), before);
        assert_eq!(h.volumes.attached(), vec!["rook replicapool/pvc-1".to_string()]);
    }

    #[tokio::test]
    async fn same_mount_dir_is_idempotent() {
        let h = Harness::new();
        let c = h.on("node1");
        c.attach(&opts("a", "/mnt/a", AccessMode::Rw)).await.unwrap();
        let writes = h.store.writes();
        c.attach(&opts("a", "/mnt/a", AccessMode::Rw)).await.unwrap();
        assert_eq!(h.store.writes(), writes);
    }

    #[tokio::test]
    async fn orphaned_writer_is_taken_over() {
        let h = Harness::new();
        h.on("node1").attach(&opts("a", "/mnt/a", AccessMode::Rw)).await.unwrap();
        // pod a is gone
        h.on("node2").attach(&opts("b", "/mnt/b", AccessMode::Rw)).await.unwrap();
        let record = h.store.record("pvc-1").unwrap();
        assert_eq!(record.len(), 1);
        assert_eq!(record[0].pod_name, "b");
        assert_eq!(record[0].node, "node2");
    }

    #[tokio::test]
    async fn readers_share_but_block_writers() {
        let h = Harness::new();
        h.on("node1").attach(&opts("a", "/mnt/a", AccessMode::Ro)).await.unwrap();
        h.on("node2").attach(&opts("b", "/mnt/b", AccessMode::Ro)).await.unwrap();
        assert_eq!(h.store.record("pvc-1").unwrap().len(), 2);

        let err = h
            .on("node3")
            .attach(&opts("c", "/mnt/c", AccessMode::Rw))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyAttached(_)));
    }

    #[tokio::test]
    async fn conflicting_update_is_retried() {
        let h = Harness::new();
        h.on("node1").attach(&opts("a", "/mnt/a", AccessMode::Ro)).await.unwrap();
        h.store.conflict_next(1);
        h.on("node2").attach(&opts("b", "/mnt/b", AccessMode::Ro)).await.unwrap();
        assert_eq!(h.store.record("pvc-1").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn removing_the_last_local_attachment_allows_detach() {
        let h = Harness::new();
        let c = h.on("node1");
        c.attach(&opts("a", "/mnt/a", AccessMode::Ro)).await.unwrap();
        c.attach(&opts("b", "/mnt/b", AccessMode::Ro)).await.unwrap();
        h.on("node2").attach(&opts("c", "/mnt/c", AccessMode::Ro)).await.unwrap();

        assert!(!c.remove_attachment_object(&opts("a", "/mnt/a", AccessMode::Ro)).await.unwrap());
        assert!(c.remove_attachment_object(&opts("b", "/mnt/b", AccessMode::Ro)).await.unwrap());
        assert_eq!(h.store.record("pvc-1").unwrap().len(), 1);

        let err = c
            .remove_attachment_object(&opts("b", "/mnt/b", AccessMode::Ro))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn last_removal_deletes_the_record() {
        let h = Harness::new();
        let c = h.on("node1");
        c.attach(&opts("a", "/mnt/a", AccessMode::Rw)).await.unwrap();
        assert!(c.remove_attachment_object(&opts("a", "/mnt/a", AccessMode::Rw)).await.unwrap());
        assert!(h.store.record("pvc-1").is_none());
    }

    #[tokio::test]
    async fn reader_arriving_before_the_last_removal_keeps_the_record() {
        let h = Harness::new();
        let c = h.on("node1");
        c.attach(&opts("a", "/mnt/a", AccessMode::Ro)).await.unwrap();
        h.store.attach_before_next_delete(Attachment {
            node: "node2".into(),
            pod_namespace: "default".into(),
            pod_name: "b".into(),
            cluster_name: "rook".into(),
            mount_dir: "/mnt/b".into(),
            read_only: true,
        });

        assert!(c.remove_attachment_object(&opts("a", "/mnt/a", AccessMode::Ro)).await.unwrap());
        let record = h.store.record("pvc-1").unwrap();
        assert_eq!(record.len(), 1);
        assert_eq!(record[0].mount_dir, "/mnt/b");

        let err = h
            .on("node3")
            .attach(&opts("c", "/mnt/c", AccessMode::Rw))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyAttached(_)));
    }

    #[tokio::test]
    async fn stale_empty_record_is_not_deleted_on_detach() {
        let h = Harness::new();
        let c = h.on("node1");
        c.attach(&opts("a", "/mnt/a", AccessMode::Ro)).await.unwrap();
        let mut emptied = h.store.get("pvc-1").await.unwrap().unwrap();
        emptied.attachments.clear();
        h.store.update(&emptied).await.unwrap();
        h.store.attach_before_next_delete(Attachment {
            node: "node2".into(),
            pod_namespace: "default".into(),
            pod_name: "b".into(),
            cluster_name: "rook".into(),
            mount_dir: "/mnt/b".into(),
            read_only: true,
        });

        c.detach(&opts("a", "/mnt/a", AccessMode::Ro), false).await.unwrap();
        assert_eq!(h.store.record("pvc-1").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn detach_without_a_record_still_unmaps() {
        let h = Harness::new();
        h.on("node1").detach(&opts("a", "/mnt/a", AccessMode::Rw), true).await.unwrap();
        assert_eq!(h.volumes.detached(), vec!["rook replicapool/pvc-1 force".to_string()]);
    }

    #[tokio::test]
    async fn failed_unmap_leaves_the_record() {
        let h = Harness::new();
        let c = h.on("node1");
        c.attach(&opts("a", "/mnt/a", AccessMode::Rw)).await.unwrap();
        h.volumes.fail_detach();
        assert!(c.detach(&opts("a", "/mnt/a", AccessMode::Rw), false).await.is_err());
        assert!(h.store.record("pvc-1").is_some());
    }

    #[test]
    fn options_use_the_driver_field_names() {
        let raw = r#"{"image":"img","pool":"p","clusterName":"rook","mountDir":"/m","volumeName":"pv","podName":"a","podNamespace":"ns","podID":"uid","rw":"ro"}"#;
        let opts: AttachOptions = serde_json::from_str(raw).unwrap();
        assert_eq!(opts.pod_id, "uid");
        assert_eq!(opts.access_mode, AccessMode::Ro);
        assert!(opts.storage_class.is_empty());
    }
}

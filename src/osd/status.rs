use std::{collections::BTreeMap, fmt, time::Duration};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{
    api::{ObjectMeta, Patch, PatchParams, PostParams, WatchParams},
    core::OwnerReference,
    Api, Client, ResourceExt,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    api::constants::OSD_STATUS_CONFIGMAP,
    client::watch::{Event, ResumableWatch},
    error::not_found_as_none,
    Error, Result,
};

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum NodeStatus {
    #[default]
    Starting,
    ComputingDiff,
    Orchestrating,
    Completed,
    Failed,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, NodeStatus::Completed | NodeStatus::Failed)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeStatus::Starting => "starting",
            NodeStatus::ComputingDiff => "computingDiff",
            NodeStatus::Orchestrating => "orchestrating",
            NodeStatus::Completed => "completed",
            NodeStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Per-node progress, written by the orchestrator and the osd daemon.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct OrchestrationStatus {
    pub status: NodeStatus,
    #[serde(default)]
    pub message: String,
}

impl OrchestrationStatus {
    pub fn new(status: NodeStatus, message: impl Into<String>) -> Self {
        OrchestrationStatus {
            status,
            message: message.into(),
        }
    }

    pub fn starting() -> Self {
        Self::new(NodeStatus::Starting, "")
    }
}

/// Reads one node's status out of the map. Unreadable entries count as absent.
pub fn parse_status(data: &BTreeMap<String, String>, node: &str) -> Option<OrchestrationStatus> {
    let raw = data.get(node)?;
    match serde_json::from_str(raw) {
        Ok(status) => Some(status),
        Err(e) => {
            warn!("failed to read orchestration status of node {node} ({raw}): {e}");
            None
        }
    }
}

/// `Ok` for completed, an error carrying the daemon's message for failed.
pub fn outcome(node: &str, status: &OrchestrationStatus) -> Result<()> {
    match status.status {
        NodeStatus::Failed => Err(Error::Transient(format!(
            "orchestration for node {node} failed: {}",
            status.message
        ))),
        _ => Ok(()),
    }
}

#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Creates the status map if missing.
    async fn ensure(&self) -> Result<()>;
    async fn set(&self, node: &str, status: &OrchestrationStatus) -> Result<()>;
    async fn all(&self) -> Result<BTreeMap<String, OrchestrationStatus>>;
    /// Blocks until `node` reaches a terminal status.
    async fn wait_terminal(&self, node: &str, cancel: &CancellationToken) -> Result<OrchestrationStatus>;

    /// A node left in a non-terminal state by an earlier run.
    async fn in_progress(&self) -> Result<Option<(String, OrchestrationStatus)>> {
        Ok(self
            .all()
            .await?
            .into_iter()
            .find(|(_, status)| !status.status.is_terminal()))
    }
}

const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// The status map as a config map, waited on through a resumable watch.
pub struct KubeStatusStore {
    api: Api<ConfigMap>,
    owner: Option<OwnerReference>,
}

impl KubeStatusStore {
    pub fn new(client: Client, namespace: &str, owner: Option<OwnerReference>) -> Self {
        KubeStatusStore {
            api: Api::namespaced(client, namespace),
            owner,
        }
    }
}

#[async_trait]
impl StatusStore for KubeStatusStore {
    async fn ensure(&self) -> Result<()> {
        if not_found_as_none(self.api.get(OSD_STATUS_CONFIGMAP).await)?.is_some() {
            return Ok(());
        }
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some(OSD_STATUS_CONFIGMAP.to_string()),
                owner_references: self.owner.clone().map(|o| vec![o]),
                ..Default::default()
            },
            data: Some(BTreeMap::new()),
            ..Default::default()
        };
        match self.api.create(&PostParams::default(), &cm).await {
            Ok(_) => Ok(()),
            Err(e) => {
                let e = Error::from(e);
                if e.is_already_exists() {
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn set(&self, node: &str, status: &OrchestrationStatus) -> Result<()> {
        self.ensure().await?;
        let value = serde_json::to_string(status)?;
        let patch = json!({ "data": { node: value } });
        self.api
            .patch(OSD_STATUS_CONFIGMAP, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn all(&self) -> Result<BTreeMap<String, OrchestrationStatus>> {
        let data = not_found_as_none(self.api.get(OSD_STATUS_CONFIGMAP).await)?
            .and_then(|cm| cm.data)
            .unwrap_or_default();
        Ok(data
            .keys()
            .filter_map(|node| parse_status(&data, node).map(|s| (node.clone(), s)))
            .collect())
    }

    async fn wait_terminal(&self, node: &str, cancel: &CancellationToken) -> Result<OrchestrationStatus> {
        // check before watching, and watch from the version just read so no
        // transition in between is missed
        let current = not_found_as_none(self.api.get(OSD_STATUS_CONFIGMAP).await)?;
        let mut version = String::new();
        if let Some(cm) = current {
            version = cm.resource_version().unwrap_or_default();
            if let Some(status) = cm.data.as_ref().and_then(|d| parse_status(d, node)) {
                if status.status.is_terminal() {
                    return Ok(status);
                }
            }
        }

        let params = WatchParams::default().fields(&format!("metadata.name={OSD_STATUS_CONFIGMAP}"));
        let mut watch = ResumableWatch::new(self.api.clone(), params, version);
        let mut progress = tokio::time::interval(PROGRESS_LOG_INTERVAL);
        progress.tick().await;
        loop {
            let event = tokio::select! {
                event = watch.next(cancel) => event?,
                _ = progress.tick() => {
                    info!("waiting on orchestration status update from node {node}");
                    continue;
                }
            };
            let cm = match event {
                Event::Added(cm) | Event::Modified(cm) => cm,
                Event::Deleted(_) | Event::Restart => continue,
            };
            if let Some(status) = cm.data.as_ref().and_then(|d| parse_status(d, node)) {
                if status.status.is_terminal() {
                    return Ok(status);
                }
            }
        }
    }
}

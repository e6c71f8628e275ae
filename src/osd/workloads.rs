use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet};
use kube::{
    api::{DeleteParams, ListParams, Patch, PatchParams, PostParams},
    Api, Client, ResourceExt,
};
use tracing::{debug, info};

use super::pod::deployment_name;
use crate::{
    api::constants::{APP_ATTR, FIELD_MANAGER, OSD_APP, TOPOLOGY_LOCATION_LABEL_PREFIX},
    error::not_found_as_none,
    Error, Result,
};

/// The osd workloads of one cluster.
#[async_trait]
pub trait OsdWorkloads: Send + Sync {
    /// Creates the deployment. `false` when one by that name already exists.
    async fn create(&self, deployment: &Deployment) -> Result<bool>;
    async fn update(&self, deployment: &Deployment) -> Result<()>;
    /// Deletes the replica set behind the node's deployment so the pod is
    /// recreated from the current template.
    async fn restart(&self, node: &str) -> Result<()>;
    async fn delete(&self, node: &str) -> Result<()>;
    async fn list(&self) -> Result<Vec<Deployment>>;
    async fn apply_daemon_set(&self, daemon_set: &DaemonSet) -> Result<()>;
}

pub struct KubeOsdWorkloads {
    deployments: Api<Deployment>,
    replica_sets: Api<ReplicaSet>,
    daemon_sets: Api<DaemonSet>,
}

impl KubeOsdWorkloads {
    pub fn new(client: Client, namespace: &str) -> Self {
        KubeOsdWorkloads {
            deployments: Api::namespaced(client.clone(), namespace),
            replica_sets: Api::namespaced(client.clone(), namespace),
            daemon_sets: Api::namespaced(client, namespace),
        }
    }
}

fn name_of<K: kube::Resource>(obj: &K) -> Result<String> {
    obj.meta()
        .name
        .clone()
        .ok_or_else(|| Error::Fatal("workload without a name".to_string()))
}

#[async_trait]
impl OsdWorkloads for KubeOsdWorkloads {
    async fn create(&self, deployment: &Deployment) -> Result<bool> {
        match self.deployments.create(&PostParams::default(), deployment).await {
            Ok(_) => Ok(true),
            Err(e) => {
                let e = Error::from(e);
                if e.is_already_exists() {
                    debug!("deployment {} already exists", deployment.name_any());
                    Ok(false)
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn update(&self, deployment: &Deployment) -> Result<()> {
        let name = name_of(deployment)?;
        self.deployments
            .patch(&name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(deployment))
            .await?;
        Ok(())
    }

    async fn restart(&self, node: &str) -> Result<()> {
        let owner = deployment_name(node);
        let selector = format!("{APP_ATTR}={OSD_APP},{TOPOLOGY_LOCATION_LABEL_PREFIX}host={node}");
        let sets = self
            .replica_sets
            .list(&ListParams::default().labels(&selector))
            .await?;
        for rs in sets.items.iter().filter(|rs| {
            rs.owner_references()
                .iter()
                .any(|o| o.kind == "Deployment" && o.name == owner)
        }) {
            let name = rs.name_any();
            info!("deleting replica set {name} to restart the osd on node {node}");
            not_found_as_none(self.replica_sets.delete(&name, &DeleteParams::foreground()).await)?;
        }
        Ok(())
    }

    async fn delete(&self, node: &str) -> Result<()> {
        not_found_as_none(
            self.deployments
                .delete(&deployment_name(node), &DeleteParams::foreground())
                .await,
        )?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Deployment>> {
        let lp = ListParams::default().labels(&format!("{APP_ATTR}={OSD_APP}"));
        Ok(self.deployments.list(&lp).await?.items)
    }

    async fn apply_daemon_set(&self, daemon_set: &DaemonSet) -> Result<()> {
        let name = name_of(daemon_set)?;
        self.daemon_sets
            .patch(&name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(daemon_set))
            .await?;
        Ok(())
    }
}

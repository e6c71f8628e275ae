use std::{collections::BTreeSet, panic::AssertUnwindSafe, sync::Arc};

use futures::FutureExt;
use k8s_openapi::api::core::v1::ResourceRequirements;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use super::{
    pod::{directories_of_deployment, node_of_deployment, osd_daemon_set, osd_deployment, OsdParams},
    safety::check_removal,
    spec::{removal_target, resolve_node, resolve_resources},
    status::{outcome, NodeStatus, OrchestrationStatus, StatusStore},
    workloads::OsdWorkloads,
};
use crate::{
    api::v1::cluster::{Node, StorageSpec},
    client::{ceph::CephAdmin, kv_store::KvStore},
    telemetry::metrics::Metrics,
    Error, Result,
};

/// Realizes the storage spec of one cluster, one node at a time.
pub struct OsdOrchestrator {
    ceph: Arc<dyn CephAdmin>,
    kv: Arc<dyn KvStore>,
    statuses: Arc<dyn StatusStore>,
    workloads: Arc<dyn OsdWorkloads>,
    metrics: Arc<Metrics>,
}

impl OsdOrchestrator {
    pub fn new(
        ceph: Arc<dyn CephAdmin>,
        kv: Arc<dyn KvStore>,
        statuses: Arc<dyn StatusStore>,
        workloads: Arc<dyn OsdWorkloads>,
        metrics: Arc<Metrics>,
    ) -> Self {
        OsdOrchestrator {
            ceph,
            kv,
            statuses,
            workloads,
            metrics,
        }
    }

    #[instrument(skip_all, fields(namespace = %params.namespace))]
    pub async fn reconcile(
        &self,
        params: &OsdParams,
        storage: &StorageSpec,
        resources: Option<&ResourceRequirements>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if storage.use_all_nodes {
            let defaults = Node {
                selection: storage.selection.clone(),
                config: storage.config.clone(),
                ..Default::default()
            };
            info!("running osds on all nodes");
            return self
                .workloads
                .apply_daemon_set(&osd_daemon_set(params, &defaults, resources.cloned()))
                .await;
        }

        self.statuses.ensure().await?;
        self.ceph.disable_scrubbing().await?;
        let result = AssertUnwindSafe(self.orchestrate(params, storage, resources, cancel))
            .catch_unwind()
            .await;
        if let Err(e) = self.ceph.enable_scrubbing().await {
            warn!("failed to re-enable scrubbing: {e}");
        }
        match result {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    async fn orchestrate(
        &self,
        params: &OsdParams,
        storage: &StorageSpec,
        resources: Option<&ResourceRequirements>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if let Some((node, status)) = self.statuses.in_progress().await? {
            info!("resuming orchestration of node {node} from {}", status.status);
            let done = self.statuses.wait_terminal(&node, cancel).await?;
            self.metrics.storage.orchestration(&done.status.to_string());
            if let Err(e) = outcome(&node, &done) {
                warn!("{e}");
            }
        }

        let mut errors = Vec::new();
        for node in &storage.nodes {
            match self.provision(params, storage, &node.name, resources, cancel).await {
                Ok(()) => {}
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    error!("osd orchestration on node {} failed: {e}", node.name);
                    errors.push(e);
                }
            }
        }

        let wanted: BTreeSet<&str> = storage.nodes.iter().map(|n| n.name.as_str()).collect();
        let removed: Vec<_> = self
            .workloads
            .list()
            .await?
            .into_iter()
            .filter_map(|d| {
                let node = node_of_deployment(&d)?;
                (!wanted.contains(node.as_str())).then(|| (node, directories_of_deployment(&d)))
            })
            .collect();

        for (node, directories) in removed {
            let target = removal_target(&node, directories);
            match self.remove(params, &target, resources, cancel).await {
                Ok(()) => {}
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    error!("removal of node {node} failed: {e}");
                    errors.push(e);
                }
            }
        }

        join_errors(errors)
    }

    async fn provision(
        &self,
        params: &OsdParams,
        storage: &StorageSpec,
        name: &str,
        resources: Option<&ResourceRequirements>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.statuses.set(name, &OrchestrationStatus::starting()).await?;
        let node = self
            .or_fail(name, resolve_node(storage, name).ok_or_else(|| Error::NotFound(format!("node {name}"))))
            .await?;
        let deployment = osd_deployment(params, &node, resolve_resources(node.resources.as_ref(), resources));

        let created = self.or_fail(name, self.workloads.create(&deployment).await).await?;
        if !created {
            self.or_fail(name, self.workloads.update(&deployment).await).await?;
            return self
                .finish(
                    name,
                    OrchestrationStatus::new(NodeStatus::Completed, "no-op: osd deployment already exists"),
                )
                .await;
        }

        info!("waiting for osd orchestration on node {name}");
        let done = self.statuses.wait_terminal(name, cancel).await?;
        self.metrics.storage.orchestration(&done.status.to_string());
        outcome(name, &done)
    }

    async fn remove(
        &self,
        params: &OsdParams,
        target: &Node,
        resources: Option<&ResourceRequirements>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let name = target.name.as_str();
        let statuses = self.statuses.all().await?;
        let checked = check_removal(self.ceph.as_ref(), self.kv.as_ref(), &statuses, name).await;
        self.or_fail(name, checked).await?;

        info!("removing osds from node {name}");
        self.statuses.set(name, &OrchestrationStatus::starting()).await?;
        let deployment = osd_deployment(params, target, resources.cloned());
        let drained = async {
            self.workloads.update(&deployment).await?;
            self.workloads.restart(name).await
        }
        .await;
        self.or_fail(name, drained).await?;

        let done = self.statuses.wait_terminal(name, cancel).await?;
        self.metrics.storage.orchestration(&done.status.to_string());
        outcome(name, &done)?;
        self.workloads.delete(name).await?;
        info!("node {name} removed");
        Ok(())
    }

    async fn finish(&self, node: &str, status: OrchestrationStatus) -> Result<()> {
        self.metrics.storage.orchestration(&status.status.to_string());
        self.statuses.set(node, &status).await
    }

    /// A node marked starting never stays there: a failed step becomes its
    /// terminal status before the error is passed on.
    async fn or_fail<T>(&self, node: &str, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                self.finish(node, OrchestrationStatus::new(NodeStatus::Failed, e.to_string()))
                    .await?;
                Err(e)
            }
        }
    }
}

/// One error passes through as is. Several become a single retryable error.
fn join_errors(mut errors: Vec<Error>) -> Result<()> {
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        n => Err(Error::Transient(format!(
            "{n} osd orchestration failures: {}",
            errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
        ))),
    }
}

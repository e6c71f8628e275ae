use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{ConfigMap, Node, Pod, Secret},
};
use kube::{
    api::{DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, WatchParams},
    core::OwnerReference,
    Api, Client, ResourceExt,
};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::{
    cluster_info::{self, ClusterInfo, ClusterSecrets},
    config::ConfigWriter,
    endpoints::{flatten, PersistedMons},
    health::{HealthAction, HealthReport, HealthTracker},
    placement::{hostname, valid_node},
    workload::{mon_deployment, MonParams, MON_LABEL},
};
use crate::{
    api::constants::{
        APP_ATTR, FIELD_MANAGER, MON_APP, MON_ENDPOINTS_CONFIGMAP, MON_PORT, MON_SECRET_NAME,
    },
    client::{
        ceph::CephAdmin,
        executor::CommandExecutor,
        kv_store::apply_config_map,
        watch::{Event, ResumableWatch},
    },
    error::not_found_as_none,
    telemetry::metrics::Metrics,
    Error, Result,
};

/// Where mons live and where their bookkeeping is persisted.
#[async_trait]
pub trait MonHost: Send + Sync {
    async fn load_secrets(&self) -> Result<Option<ClusterSecrets>>;
    async fn save_secrets(&self, secrets: &ClusterSecrets) -> Result<()>;
    async fn load_mons(&self) -> Result<PersistedMons>;
    async fn save_mons(&self, mons: &PersistedMons) -> Result<()>;
    /// Hostnames a mon may be placed on.
    async fn schedulable_nodes(&self) -> Result<Vec<String>>;
    async fn apply_mon(&self, name: &str, node: &str) -> Result<()>;
    /// Address of the running mon pod, `None` until it is ready.
    async fn mon_pod_ip(&self, name: &str) -> Result<Option<String>>;
    async fn remove_mon(&self, name: &str) -> Result<()>;
    /// Replaces the settings mons are rendered from. True when they changed.
    async fn set_template(&self, template: MonParams) -> bool;
}

/// Bounded retry loop for the waits in the startup path.
#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    pub retries: u32,
    pub delay: Duration,
}

#[derive(Clone, Debug)]
pub struct MonSettings {
    pub out_timeout: Duration,
    pub probe_timeout: Duration,
    pub pod_ready: Backoff,
    pub quorum: Backoff,
}

impl Default for MonSettings {
    fn default() -> Self {
        MonSettings {
            out_timeout: Duration::from_secs(300),
            probe_timeout: Duration::from_secs(30),
            pod_ready: Backoff {
                retries: 60,
                delay: Duration::from_secs(5),
            },
            quorum: Backoff {
                retries: 20,
                delay: Duration::from_secs(5),
            },
        }
    }
}

#[derive(Default)]
struct MonState {
    secrets: Option<ClusterSecrets>,
    mons: PersistedMons,
}

/// Keeps `size` mons running for one cluster.
pub struct MonManager {
    namespace: String,
    cluster_name: String,
    host: Arc<dyn MonHost>,
    ceph: Arc<dyn CephAdmin>,
    executor: Arc<dyn CommandExecutor>,
    writer: ConfigWriter,
    settings: MonSettings,
    size: AtomicUsize,
    state: RwLock<MonState>,
    tracker: Mutex<HealthTracker>,
    // start and health ticks never interleave
    serial: Mutex<()>,
    cancel: CancellationToken,
    metrics: Arc<Metrics>,
}

impl MonManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        namespace: &str,
        cluster_name: &str,
        size: usize,
        host: Arc<dyn MonHost>,
        ceph: Arc<dyn CephAdmin>,
        executor: Arc<dyn CommandExecutor>,
        writer: ConfigWriter,
        settings: MonSettings,
        metrics: Arc<Metrics>,
    ) -> Self {
        MonManager {
            namespace: namespace.to_string(),
            cluster_name: cluster_name.to_string(),
            host,
            ceph,
            executor,
            writer,
            settings,
            size: AtomicUsize::new(size),
            state: RwLock::new(MonState {
                secrets: None,
                mons: PersistedMons::empty(),
            }),
            tracker: Mutex::new(HealthTracker::default()),
            serial: Mutex::new(()),
            cancel: CancellationToken::new(),
            metrics,
        }
    }

    pub fn set_size(&self, size: usize) {
        self.size.store(size, Ordering::Relaxed);
    }

    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub fn ceph(&self) -> Arc<dyn CephAdmin> {
        self.ceph.clone()
    }

    /// Stops the waits and the endpoint watcher.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Adopts new mon settings and re-applies every placed mon with them.
    #[instrument(skip_all, fields(namespace = %self.namespace))]
    pub async fn set_template(&self, template: MonParams) -> Result<()> {
        let _serial = self.serial.lock().await;
        if !self.host.set_template(template).await {
            return Ok(());
        }
        let placed = self.host.load_mons().await?.mapping.node;
        for (name, node) in placed {
            info!("re-applying mon {name} on {node} with new settings");
            self.host.apply_mon(&name, &node).await?;
        }
        Ok(())
    }

    /// Secrets plus the current endpoint map, once secrets are known.
    pub async fn cluster_info(&self) -> Option<ClusterInfo> {
        let state = self.state.read().await;
        state.secrets.clone().map(|secrets| ClusterInfo {
            secrets,
            monitors: state.mons.endpoints.clone(),
        })
    }

    /// Brings the mon set up to size. Safe to call repeatedly.
    #[instrument(skip(self), fields(namespace = %self.namespace))]
    pub async fn start(&self) -> Result<()> {
        let _serial = self.serial.lock().await;
        self.start_locked().await
    }

    async fn start_locked(&self) -> Result<()> {
        self.ensure_secrets().await?;
        let persisted = self.host.load_mons().await?;
        self.update(|mons| *mons = persisted).await?;

        loop {
            let mons = self.state.read().await.mons.clone();
            if mons.endpoints.len() >= self.size() {
                return Ok(());
            }

            // a mon placed by an earlier, interrupted start keeps its id and node
            let (name, node) = match mons.pending().into_iter().next() {
                Some(pending) => pending,
                None => {
                    let used = mons.used_nodes();
                    let Some(node) = self
                        .host
                        .schedulable_nodes()
                        .await?
                        .into_iter()
                        .find(|n| !used.contains(n))
                    else {
                        warn!("no node available for another mon, waiting for the next health check");
                        return Ok(());
                    };
                    let mut name = String::new();
                    self.update(|mons| {
                        name = mons.allocate();
                        mons.mapping.node.insert(name.clone(), node.clone());
                    })
                    .await?;
                    (name, node)
                }
            };
            self.bring_up(&name, &node).await?;
        }
    }

    async fn ensure_secrets(&self) -> Result<ClusterSecrets> {
        if let Some(secrets) = self.state.read().await.secrets.clone() {
            return Ok(secrets);
        }
        let secrets = match self.host.load_secrets().await? {
            Some(secrets) => secrets,
            None => {
                info!("creating secrets for cluster {}", self.cluster_name);
                let secrets = cluster_info::generate(
                    self.executor.as_ref(),
                    self.writer.config_dir(),
                    &self.cluster_name,
                )
                .await?;
                self.host
                    .save_secrets(&secrets)
                    .await
                    .map_err(|e| Error::Fatal(format!("failed to save cluster secrets: {e}")))?;
                secrets
            }
        };
        self.state.write().await.secrets = Some(secrets.clone());
        Ok(secrets)
    }

    /// Read-modify-write of the persisted mons. The lock is held until the
    /// config map and the connection config reflect the change.
    async fn update<F: FnOnce(&mut PersistedMons)>(&self, f: F) -> Result<()> {
        let mut state = self.state.write().await;
        let mut mons = state.mons.clone();
        f(&mut mons);
        if mons != state.mons {
            self.host.save_mons(&mons).await?;
        }
        if let Some(secrets) = state.secrets.clone() {
            if !mons.endpoints.is_empty() {
                self.writer
                    .write_connection_config(&ClusterInfo {
                        secrets,
                        monitors: mons.endpoints.clone(),
                    })
                    .await?;
            }
        }
        state.mons = mons;
        Ok(())
    }

    async fn bring_up(&self, name: &str, node: &str) -> Result<()> {
        info!("starting mon {name} on node {node}");
        self.host.apply_mon(name, node).await?;
        let ip = self.wait_for_pod_ip(name).await?;
        let endpoint = format!("{ip}:{MON_PORT}");
        self.update(|mons| {
            mons.endpoints.insert(name.to_string(), endpoint.clone());
        })
        .await?;
        info!("mon {name} published at {endpoint}");
        self.wait_for_quorum(&[name.to_string()]).await
    }

    async fn pause(&self, delay: Duration) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    async fn wait_for_pod_ip(&self, name: &str) -> Result<String> {
        let backoff = self.settings.pod_ready;
        for attempt in 0..backoff.retries {
            match self.host.mon_pod_ip(name).await {
                Ok(Some(ip)) => return Ok(ip),
                Ok(None) => debug!("mon {name} not ready yet ({attempt})"),
                Err(e) => warn!("failed to look up mon {name}: {e}"),
            }
            self.pause(backoff.delay).await?;
        }
        Err(Error::Transient(format!("mon {name} did not become ready")))
    }

    async fn wait_for_quorum(&self, names: &[String]) -> Result<()> {
        let backoff = self.settings.quorum;
        for _ in 0..backoff.retries {
            match self.ceph.mon_status().await {
                Ok(status) if names.iter().all(|n| status.in_quorum(n)) => {
                    info!("mons {} in quorum", names.join(","));
                    return Ok(());
                }
                Ok(status) => debug!("waiting for quorum, current quorum {:?}", status.quorum),
                Err(e) => warn!("failed to get mon status: {e}"),
            }
            self.pause(backoff.delay).await?;
        }
        Err(Error::Transient(format!(
            "mons {} did not join quorum",
            names.join(",")
        )))
    }

    /// One health tick. Returns what was observed and acted on.
    #[instrument(skip(self), fields(namespace = %self.namespace))]
    pub async fn check_health(&self) -> Result<HealthReport> {
        let _serial = self.serial.lock().await;
        let status = tokio::time::timeout(self.settings.probe_timeout, self.ceph.mon_status())
            .await
            .map_err(|_| Error::Transient("mon status probe timed out".to_string()))??;

        let truth = self.state.read().await.mons.endpoints.clone();
        let report = self.tracker.lock().await.evaluate(
            &truth,
            &status,
            self.size(),
            self.settings.out_timeout,
            Utc::now(),
        );
        self.metrics
            .storage
            .quorum_size(&self.namespace, report.in_quorum.len());

        match &report.action {
            HealthAction::Steady => {}
            HealthAction::MajorityLost { in_quorum, total } => {
                error!("only {in_quorum} of {total} mons in quorum, manual recovery required");
            }
            HealthAction::Failover(name) => {
                warn!("mon {name} out of quorum past the timeout, failing over");
                self.remove(name).await?;
                self.metrics.storage.failover(&self.namespace);
                self.start_locked().await?;
            }
            HealthAction::ScaleDown(name) => {
                info!("removing surplus mon {name}");
                self.remove(name).await?;
            }
            HealthAction::ScaleUp(count) => {
                info!("{count} mons missing, starting them");
                self.start_locked().await?;
            }
        }
        Ok(report)
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.ceph.mon_remove(name).await?;
        self.host.remove_mon(name).await?;
        self.update(|mons| mons.forget(name)).await?;
        self.tracker.lock().await.forget(name);
        Ok(())
    }

    /// Republishes the endpoint of `name` when its pod moved.
    pub async fn observe_pod_ip(&self, name: &str, ip: &str) -> Result<bool> {
        let endpoint = format!("{ip}:{MON_PORT}");
        {
            let state = self.state.read().await;
            match state.mons.endpoints.get(name) {
                Some(current) if *current != endpoint => {}
                _ => return Ok(false),
            }
        }
        info!("mon {name} moved to {endpoint}");
        self.update(|mons| {
            if let Some(current) = mons.endpoints.get_mut(name) {
                *current = endpoint.clone();
            }
        })
        .await?;
        Ok(true)
    }

    /// Follows mon pod changes until shutdown.
    pub async fn watch_endpoints(&self, pods: Api<Pod>) {
        let params = WatchParams::default().labels(&format!("{APP_ATTR}={MON_APP}"));
        let mut watch = ResumableWatch::new(pods, params, "");
        loop {
            match watch.next(&self.cancel).await {
                Ok(Event::Added(pod)) | Ok(Event::Modified(pod)) => {
                    let name = pod.labels().get(MON_LABEL).cloned();
                    let ip = pod.status.as_ref().and_then(|s| s.pod_ip.clone());
                    if let (Some(name), Some(ip)) = (name, ip.filter(|ip| !ip.is_empty())) {
                        if let Err(e) = self.observe_pod_ip(&name, &ip).await {
                            warn!("failed to update endpoint of mon {name}: {e}");
                        }
                    }
                }
                Ok(Event::Deleted(_)) | Ok(Event::Restart) => {}
                Err(Error::Cancelled) => {
                    debug!("mon endpoint watcher stopped");
                    return;
                }
                Err(e) => {
                    warn!("mon endpoint watch failed: {e}");
                    if self.pause(Duration::from_secs(5)).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

/// Mons as single replica deployments, bookkeeping in secrets and config maps.
pub struct KubeMonHost {
    client: Client,
    namespace: String,
    owner: OwnerReference,
    template: RwLock<MonParams>,
}

impl KubeMonHost {
    /// `template` carries everything but the mon name and node.
    pub fn new(client: Client, template: MonParams) -> Self {
        KubeMonHost {
            namespace: template.namespace.clone(),
            owner: template.owner.clone(),
            client,
            template: RwLock::new(template),
        }
    }

    fn secrets(&self) -> Api<Secret> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn deployments(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    async fn apply<K>(api: &Api<K>, name: &str, obj: &K) -> Result<()>
    where
        K: kube::Resource + Clone + serde::Serialize + serde::de::DeserializeOwned + std::fmt::Debug,
    {
        api.patch(name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(obj))
            .await?;
        Ok(())
    }
}

fn pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|c| c.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
}

#[async_trait]
impl MonHost for KubeMonHost {
    async fn load_secrets(&self) -> Result<Option<ClusterSecrets>> {
        not_found_as_none(self.secrets().get(MON_SECRET_NAME).await)?
            .map(|s| ClusterSecrets::from_secret(&s))
            .transpose()
    }

    async fn save_secrets(&self, secrets: &ClusterSecrets) -> Result<()> {
        let (mon, admin) = secrets.to_secrets(&self.namespace, &self.owner);
        let api = self.secrets();
        Self::apply(&api, &mon.name_any(), &mon).await?;
        Self::apply(&api, &admin.name_any(), &admin).await
    }

    async fn load_mons(&self) -> Result<PersistedMons> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        Ok(not_found_as_none(api.get(MON_ENDPOINTS_CONFIGMAP).await)?
            .and_then(|cm| cm.data)
            .map(|data| PersistedMons::from_data(&data))
            .unwrap_or_else(PersistedMons::empty))
    }

    async fn save_mons(&self, mons: &PersistedMons) -> Result<()> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some(MON_ENDPOINTS_CONFIGMAP.to_string()),
                namespace: Some(self.namespace.clone()),
                owner_references: Some(vec![self.owner.clone()]),
                ..Default::default()
            },
            data: Some(mons.to_data()),
            ..Default::default()
        };
        debug!("saving mon endpoints {}", flatten(&mons.endpoints));
        apply_config_map(&api, &cm)
            .await
            .map_err(|e| Error::Fatal(format!("failed to save mon endpoints: {e}")))
    }

    async fn schedulable_nodes(&self) -> Result<Vec<String>> {
        let placement = self.template.read().await.placement.clone();
        let nodes: Api<Node> = Api::all(self.client.clone());
        Ok(nodes
            .list(&ListParams::default())
            .await?
            .items
            .iter()
            .filter(|n| valid_node(n, &placement))
            .filter_map(hostname)
            .collect())
    }

    async fn apply_mon(&self, name: &str, node: &str) -> Result<()> {
        let params = MonParams {
            name: name.to_string(),
            node: node.to_string(),
            ..self.template.read().await.clone()
        };
        Self::apply(&self.deployments(), name, &mon_deployment(&params)).await
    }

    async fn mon_pod_ip(&self, name: &str) -> Result<Option<String>> {
        let host_network = self.template.read().await.host_network;
        let pods = self
            .pods()
            .list(&ListParams::default().labels(&format!("{MON_LABEL}={name}")))
            .await?;
        Ok(pods
            .items
            .iter()
            .filter(|p| pod_ready(p))
            .find_map(|p| {
                let status = p.status.as_ref()?;
                if host_network {
                    status.host_ip.clone()
                } else {
                    status.pod_ip.clone()
                }
            })
            .filter(|ip| !ip.is_empty()))
    }

    async fn remove_mon(&self, name: &str) -> Result<()> {
        not_found_as_none(self.deployments().delete(name, &DeleteParams::background()).await)?;
        Ok(())
    }

    async fn set_template(&self, template: MonParams) -> bool {
        let mut current = self.template.write().await;
        if *current == template {
            return false;
        }
        *current = template;
        true
    }
}

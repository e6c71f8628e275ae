use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::{
    apps::v1::{Deployment, DeploymentSpec},
    core::v1::{Container, PodSpec, PodTemplateSpec},
    policy::v1::PodDisruptionBudget,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::{
    api::{DeleteParams, ListParams, ObjectMeta, Patch, PatchParams},
    core::OwnerReference,
    Api, Client, Resource, ResourceExt,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{
    failure_domain::{draining_domains, host_domains, min_failure_domain, pool_specs},
    pdb::{blocking_pdb, is_osd_pdb, pdb_labels, pdb_name},
    state::{plan, PdbState},
};
use crate::{
    api::{
        constants::{
            APP_ATTR, CLUSTER_ATTR, DRAIN_CANARY_APP, FIELD_MANAGER, HOSTNAME_LABEL, OSD_APP,
            TOPOLOGY_LOCATION_LABEL_PREFIX,
        },
        v1::{
            cluster::{Cluster, Component, Placement},
            filesystem::Filesystem,
            object_store::ObjectStore,
            pool::{FailureDomain, Pool, PoolSpec},
        },
    },
    client::{
        ceph::{CephAdmin, NOOUT},
        kv_store::{ConfigMapKvStore, KvStore},
    },
    error::not_found_as_none,
    telemetry::state::{Context, State},
    Error, Result,
};

/// A fresh canary is not ready yet either; it only signals a drain once it
/// is older than this.
const CANARY_GRACE: Duration = Duration::from_secs(120);

pub fn canary_name(node: &str) -> String {
    format!("{DRAIN_CANARY_APP}-{node}")
}

/// The per-node canary as last observed.
#[derive(Clone, Debug, PartialEq)]
pub struct Canary {
    pub node: String,
    pub ready_replicas: i32,
    pub created: Option<DateTime<Utc>>,
}

impl Canary {
    pub fn is_draining(&self, now: DateTime<Utc>) -> bool {
        let grace = chrono::Duration::from_std(CANARY_GRACE).unwrap_or_default();
        self.ready_replicas == 0 && self.created.is_none_or(|created| now - created >= grace)
    }
}

/// The host objects the disruption controller reads and writes.
#[async_trait]
pub trait DisruptionHost: Send + Sync {
    /// Every pool spec of the cluster's pools, filesystems and object stores.
    async fn pool_specs(&self) -> Result<Vec<PoolSpec>>;
    /// Topology labels of each osd deployment.
    async fn osd_locations(&self) -> Result<Vec<BTreeMap<String, String>>>;
    async fn canaries(&self) -> Result<Vec<Canary>>;
    async fn apply_canary(&self, canary: &Deployment) -> Result<()>;
    async fn delete_canary(&self, node: &str) -> Result<()>;
    /// Names of the osd budgets that exist.
    async fn pdbs(&self) -> Result<Vec<String>>;
    async fn apply_pdb(&self, pdb: &PodDisruptionBudget) -> Result<()>;
    async fn delete_pdb(&self, name: &str) -> Result<()>;
}

/// Sleeps on its node until the node is drained.
pub fn canary_deployment(
    namespace: &str,
    node: &str,
    image: &str,
    placement: &Placement,
    owner: &OwnerReference,
) -> Deployment {
    let mut pod = PodSpec {
        node_selector: Some(BTreeMap::from([(HOSTNAME_LABEL.to_string(), node.to_string())])),
        containers: vec![Container {
            name: "sleep".to_string(),
            image: Some(image.to_string()),
            command: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            ..Default::default()
        }],
        termination_grace_period_seconds: Some(0),
        ..Default::default()
    };
    placement.apply_to_pod_spec(&mut pod);
    let labels = BTreeMap::from([
        (APP_ATTR.to_string(), DRAIN_CANARY_APP.to_string()),
        (CLUSTER_ATTR.to_string(), namespace.to_string()),
        (format!("{TOPOLOGY_LOCATION_LABEL_PREFIX}host"), node.to_string()),
    ]);
    Deployment {
        metadata: ObjectMeta {
            name: Some(canary_name(node)),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner.clone()]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(pod),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// What one tick decided.
#[derive(Clone, Debug, PartialEq)]
pub struct DisruptionReport {
    pub failure_domain: FailureDomain,
    pub draining: BTreeSet<String>,
    pub disabled: String,
}

/// Keeps every failure domain but at most one behind a blocking budget.
pub struct DisruptionController {
    namespace: String,
    image: String,
    placement: Placement,
    owner: OwnerReference,
    maintenance_timeout: Duration,
    host: Arc<dyn DisruptionHost>,
    ceph: Arc<dyn CephAdmin>,
    kv: Arc<dyn KvStore>,
}

impl DisruptionController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        namespace: &str,
        image: &str,
        placement: Placement,
        owner: OwnerReference,
        maintenance_timeout: Duration,
        host: Arc<dyn DisruptionHost>,
        ceph: Arc<dyn CephAdmin>,
        kv: Arc<dyn KvStore>,
    ) -> Self {
        DisruptionController {
            namespace: namespace.to_string(),
            image: image.to_string(),
            placement,
            owner,
            maintenance_timeout,
            host,
            ceph,
            kv,
        }
    }

    /// Canaries follow the hosts that run osds.
    async fn sync_canaries(&self, hosts: &BTreeMap<String, String>) -> Result<Vec<Canary>> {
        let canaries = self.host.canaries().await?;
        let existing: BTreeSet<&str> = canaries.iter().map(|c| c.node.as_str()).collect();
        for node in hosts.keys().filter(|n| !existing.contains(n.as_str())) {
            info!("creating drain canary for {node}");
            self.host
                .apply_canary(&canary_deployment(&self.namespace, node, &self.image, &self.placement, &self.owner))
                .await?;
        }
        for canary in canaries.iter().filter(|c| !hosts.contains_key(&c.node)) {
            debug!("removing drain canary of {}, it runs no osds", canary.node);
            self.host.delete_canary(&canary.node).await?;
        }
        Ok(canaries
            .into_iter()
            .filter(|c| hosts.contains_key(&c.node))
            .collect())
    }

    #[instrument(skip(self, now), fields(namespace = %self.namespace))]
    pub async fn reconcile(&self, now: DateTime<Utc>) -> Result<DisruptionReport> {
        let fd = min_failure_domain(&self.host.pool_specs().await?);
        let hosts = host_domains(&self.host.osd_locations().await?, fd);

        let draining_nodes: BTreeSet<String> = self
            .sync_canaries(&hosts)
            .await?
            .into_iter()
            .filter(|c| c.is_draining(now))
            .map(|c| c.node)
            .collect();
        let draining = draining_domains(&hosts, &draining_nodes);
        let clean = self.ceph.is_cluster_clean().await?;

        let previous = PdbState::load(self.kv.as_ref()).await?;
        let mut state = previous.clone();
        let domains: BTreeSet<String> = hosts.values().cloned().collect();
        let actions = plan(&mut state, &domains, &draining, clean, now, self.maintenance_timeout);
        if state.disabled != previous.disabled {
            info!(
                "{fd} {:?} is now open for disruption (was {:?}, clean: {clean})",
                state.disabled, previous.disabled
            );
        } else if !draining.is_empty() && !draining.contains(&state.disabled) {
            warn!("{fd} {draining:?} draining but the cluster is not clean, holding their budgets");
        }

        let mut wanted = BTreeSet::new();
        for action in &actions {
            let name = pdb_name(fd, &action.domain);
            if action.protected {
                self.host
                    .apply_pdb(&blocking_pdb(&self.namespace, fd, &action.domain, &self.owner))
                    .await?;
                wanted.insert(name);
            } else {
                self.host.delete_pdb(&name).await?;
            }
            if self
                .ceph
                .update_crush_unit_flag(&action.domain, NOOUT, action.noout)
                .await?
            {
                info!(
                    "{} {NOOUT} on {fd} {}",
                    if action.noout { "set" } else { "cleared" },
                    action.domain
                );
            }
        }
        for stale in self
            .host
            .pdbs()
            .await?
            .into_iter()
            .filter(|n| is_osd_pdb(n) && !wanted.contains(n))
        {
            debug!("removing stale budget {stale}");
            self.host.delete_pdb(&stale).await?;
        }

        state.save(self.kv.as_ref(), &previous).await?;
        Ok(DisruptionReport {
            failure_domain: fd,
            draining,
            disabled: state.disabled,
        })
    }
}

/// Reads and writes the disruption objects of one cluster namespace.
pub struct KubeDisruptionHost {
    client: Client,
    namespace: String,
}

impl KubeDisruptionHost {
    pub fn new(client: Client, namespace: &str) -> Self {
        KubeDisruptionHost {
            client,
            namespace: namespace.to_string(),
        }
    }

    fn api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    async fn list_deployments(&self, app: &str) -> Result<Vec<Deployment>> {
        let api: Api<Deployment> = self.api();
        Ok(api
            .list(&ListParams::default().labels(&format!("{APP_ATTR}={app}")))
            .await?
            .items)
    }
}

#[async_trait]
impl DisruptionHost for KubeDisruptionHost {
    async fn pool_specs(&self) -> Result<Vec<PoolSpec>> {
        let lp = ListParams::default();
        let pools = self.api::<Pool>().list(&lp).await?.items;
        let filesystems = self.api::<Filesystem>().list(&lp).await?.items;
        let stores = self.api::<ObjectStore>().list(&lp).await?.items;
        Ok(pool_specs(&pools, &filesystems, &stores))
    }

    async fn osd_locations(&self) -> Result<Vec<BTreeMap<String, String>>> {
        Ok(self
            .list_deployments(OSD_APP)
            .await?
            .iter()
            .map(|d| {
                d.labels()
                    .iter()
                    .filter(|(k, _)| k.starts_with(TOPOLOGY_LOCATION_LABEL_PREFIX))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .collect())
    }

    async fn canaries(&self) -> Result<Vec<Canary>> {
        let host_key = format!("{TOPOLOGY_LOCATION_LABEL_PREFIX}host");
        Ok(self
            .list_deployments(DRAIN_CANARY_APP)
            .await?
            .iter()
            .filter_map(|d| {
                Some(Canary {
                    node: d.labels().get(&host_key)?.clone(),
                    ready_replicas: d
                        .status
                        .as_ref()
                        .and_then(|s| s.ready_replicas)
                        .unwrap_or_default(),
                    created: d.creation_timestamp().map(|t| t.0),
                })
            })
            .collect())
    }

    async fn apply_canary(&self, canary: &Deployment) -> Result<()> {
        let api: Api<Deployment> = self.api();
        api.patch(
            &canary.name_any(),
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(canary),
        )
        .await?;
        Ok(())
    }

    async fn delete_canary(&self, node: &str) -> Result<()> {
        let api: Api<Deployment> = self.api();
        not_found_as_none(api.delete(&canary_name(node), &DeleteParams::default()).await)?;
        Ok(())
    }

    async fn pdbs(&self) -> Result<Vec<String>> {
        let api: Api<PodDisruptionBudget> = self.api();
        let selector = pdb_labels(&self.namespace)
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        Ok(api
            .list(&ListParams::default().labels(&selector))
            .await?
            .items
            .iter()
            .map(ResourceExt::name_any)
            .collect())
    }

    async fn apply_pdb(&self, pdb: &PodDisruptionBudget) -> Result<()> {
        let api: Api<PodDisruptionBudget> = self.api();
        api.patch(&pdb.name_any(), &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(pdb))
            .await?;
        Ok(())
    }

    async fn delete_pdb(&self, name: &str) -> Result<()> {
        let api: Api<PodDisruptionBudget> = self.api();
        not_found_as_none(api.delete(name, &DeleteParams::default()).await)?;
        Ok(())
    }
}

async fn reconcile_cluster(ctx: &Context, cluster: &Cluster) -> Result<DisruptionReport> {
    let namespace = cluster
        .namespace()
        .ok_or_else(|| Error::InvalidSpec("cluster without a namespace".to_string()))?;
    let ceph = ctx
        .clusters
        .get(&namespace)
        .await
        .ok_or_else(|| Error::Transient(format!("mons of cluster {namespace} not started yet")))?
        .ceph();
    let owner = cluster
        .controller_owner_ref(&())
        .ok_or_else(|| Error::Fatal("cluster without a uid".to_string()))?;
    let image = if cluster.spec.image.is_empty() {
        ctx.config.image.clone()
    } else {
        cluster.spec.image.clone()
    };
    let controller = DisruptionController::new(
        &namespace,
        &image,
        cluster.spec.placement.for_component(Component::Osd),
        owner.clone(),
        ctx.config.maintenance_timeout,
        Arc::new(KubeDisruptionHost::new(ctx.client.clone(), &namespace)),
        ceph,
        Arc::new(ConfigMapKvStore::new(ctx.client.clone(), &namespace, Some(owner))),
    );
    controller.reconcile(Utc::now()).await
}

/// Polls every cluster that asked for managed disruption budgets.
pub async fn run(ctx: Arc<Context>, cancel: CancellationToken) {
    let clusters: Api<Cluster> = Api::all(ctx.client.clone());
    let mut interval = tokio::time::interval(ctx.config.disruption_interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {}
        }
        State::touch(&ctx.diagnostics, "disruption").await;
        let list = match clusters.list(&ListParams::default()).await {
            Ok(list) => list,
            Err(e) => {
                warn!("failed to list clusters: {e}");
                continue;
            }
        };
        for cluster in list.items.iter().filter(|c| c.spec.managed_disruption_budgets) {
            match reconcile_cluster(&ctx, cluster).await {
                Ok(report) => debug!(
                    "disruption budgets of {} by {}: open {:?}",
                    cluster.name_any(),
                    report.failure_domain,
                    report.disabled
                ),
                Err(e) => {
                    warn!("disruption reconcile of {} failed: {e}", cluster.name_any());
                    ctx.metrics.reconcile.set_failure(cluster, &e);
                }
            }
        }
    }
}

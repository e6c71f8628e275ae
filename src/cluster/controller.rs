use std::{collections::BTreeMap, future::Future, sync::Arc, time::Duration};

use chrono::Utc;
use futures::StreamExt;
use garde::Validate;
use k8s_openapi::api::{
    apps::v1::{DaemonSet, Deployment},
    core::v1::{Pod, Secret},
};
use kube::{
    api::{ListParams, Patch, PatchParams},
    runtime::{
        controller::Action,
        events::{Event, EventType},
        watcher, Controller,
    },
    Api, Resource, ResourceExt,
};
use serde_json::json;
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, field, info, instrument, warn, Span};

use crate::{
    api::{
        constants::FIELD_MANAGER,
        v1::cluster::{Cluster, ClusterState, ClusterStatus, Component},
    },
    client::{ceph::CephClient, kv_store::ConfigMapKvStore},
    mon::{
        manager::{KubeMonHost, MonManager, MonSettings},
        workload::MonParams,
    },
    osd::{orchestrator::OsdOrchestrator, pod::OsdParams, status::KubeStatusStore, workloads::KubeOsdWorkloads},
    telemetry::{
        state::{Context, State},
        telemetry,
    },
    Error, ErrorKind, Result,
};

/// The live mon manager of every cluster namespace.
#[derive(Clone, Default)]
pub struct ClusterRegistry {
    managers: Arc<RwLock<BTreeMap<String, Arc<MonManager>>>>,
}

impl ClusterRegistry {
    pub async fn get(&self, namespace: &str) -> Option<Arc<MonManager>> {
        self.managers.read().await.get(namespace).cloned()
    }

    /// The manager of `namespace`, created by `create` on first use. The bool
    /// is true when it was just created.
    pub async fn get_or_insert_with(
        &self,
        namespace: &str,
        create: impl FnOnce() -> MonManager,
    ) -> (Arc<MonManager>, bool) {
        let mut managers = self.managers.write().await;
        if let Some(existing) = managers.get(namespace) {
            return (existing.clone(), false);
        }
        let manager = Arc::new(create());
        managers.insert(namespace.to_string(), manager.clone());
        (manager, true)
    }

    pub async fn remove(&self, namespace: &str) -> Option<Arc<MonManager>> {
        self.managers.write().await.remove(namespace)
    }

    pub async fn all(&self) -> Vec<(String, Arc<MonManager>)> {
        self.managers
            .read()
            .await
            .iter()
            .map(|(ns, m)| (ns.clone(), m.clone()))
            .collect()
    }
}

pub async fn run(ctx: Arc<Context>) {
    let client = ctx.client.clone();
    let clusters: Api<Cluster> = Api::all(client.clone());
    let deployments: Api<Deployment> = Api::all(client.clone());
    let daemon_sets: Api<DaemonSet> = Api::all(client.clone());
    let secrets: Api<Secret> = Api::all(client);

    info!("starting cluster controller");
    Controller::new(clusters, watcher::Config::default())
        .owns(deployments, watcher::Config::default())
        .owns(daemon_sets, watcher::Config::default())
        .owns(secrets, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}

async fn patch_status(api: &Api<Cluster>, name: &str, state: ClusterState, message: Option<String>) -> Result<()> {
    let status = Patch::Apply(json!({
        "apiVersion": Cluster::api_version(&()),
        "kind": Cluster::kind(&()),
        "status": ClusterStatus {
            state: Some(state),
            message,
            last_updated: Some(Utc::now()),
        }
    }));
    api.patch_status(name, &PatchParams::apply(FIELD_MANAGER).force(), &status)
        .await?;
    Ok(())
}

fn mon_settings(ctx: &Context) -> MonSettings {
    MonSettings {
        out_timeout: ctx.config.mon_out_timeout,
        probe_timeout: ctx.config.quorum_probe_timeout,
        ..Default::default()
    }
}

#[instrument(skip(object, ctx), fields(trace_id))]
async fn reconcile(object: Arc<Cluster>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    if trace_id != opentelemetry::trace::TraceId::INVALID {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.metrics.reconcile.count_and_measure(object.as_ref(), &trace_id);
    State::touch(&ctx.diagnostics, "cluster").await;

    let name = object.name_any();
    let ns = object
        .namespace()
        .ok_or_else(|| Error::InvalidSpec(format!("cluster {name} has no namespace")))?;
    let owner = object
        .controller_owner_ref(&())
        .ok_or_else(|| Error::Fatal(format!("cluster {name} has no uid")))?;
    let clusters: Api<Cluster> = Api::namespaced(ctx.client.clone(), &ns);
    info!("reconciling cluster \"{name}\" in {ns}");

    if let Err(report) = object.spec.validate() {
        let message = report.to_string();
        error!("cluster {name} is invalid: {message}");
        let event = Event {
            type_: EventType::Warning,
            reason: "InvalidSpec".into(),
            note: Some(message.clone()),
            action: "Validating".into(),
            secondary: None,
        };
        if let Err(e) = ctx.recorder.publish(&event, &object.object_ref(&())).await {
            warn!("failed to publish event for {name}: {e}");
        }
        patch_status(&clusters, &name, ClusterState::Error, Some(message.clone())).await?;
        return Err(Error::InvalidSpec(message));
    }
    if object.status.as_ref().and_then(|s| s.state.as_ref()).is_none() {
        patch_status(&clusters, &name, ClusterState::Creating, None).await?;
    }

    let spec = &object.spec;
    let cluster_name = object.cluster_name();
    let image = if spec.image.is_empty() {
        ctx.config.image.clone()
    } else {
        spec.image.clone()
    };

    let template = MonParams {
        name: String::new(),
        node: String::new(),
        namespace: ns.clone(),
        cluster_name: cluster_name.clone(),
        image: image.clone(),
        host_network: spec.host_network,
        data_dir_host_path: spec.data_dir_host_path.clone(),
        placement: spec.placement.for_component(Component::Mon),
        resources: spec.resources.mon.clone(),
        owner: owner.clone(),
    };
    let (manager, created) = ctx
        .clusters
        .get_or_insert_with(&ns, || {
            MonManager::new(
                &ns,
                &cluster_name,
                spec.mon_count as usize,
                Arc::new(KubeMonHost::new(ctx.client.clone(), template.clone())),
                Arc::new(CephClient::new(
                    ctx.executor.clone(),
                    cluster_name.clone(),
                    ctx.writer.config_dir().to_path_buf(),
                )),
                ctx.executor.clone(),
                ctx.writer.clone(),
                mon_settings(&ctx),
                ctx.metrics.clone(),
            )
        })
        .await;
    if created {
        let watcher = manager.clone();
        let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &ns);
        tokio::spawn(async move { watcher.watch_endpoints(pods).await });
    } else if manager.size() != spec.mon_count as usize {
        info!("mon count of {name} changed to {}", spec.mon_count);
        if object.status.as_ref().and_then(|s| s.state.as_ref()) == Some(&ClusterState::Created) {
            patch_status(&clusters, &name, ClusterState::Updating, None).await?;
        }
    }
    manager.set_size(spec.mon_count as usize);
    manager.set_template(template).await?;
    manager.start().await?;

    let osd_params = OsdParams {
        namespace: ns.clone(),
        cluster_name: cluster_name.clone(),
        image,
        host_network: spec.host_network,
        data_dir_host_path: spec.data_dir_host_path.clone(),
        placement: spec.placement.for_component(Component::Osd),
        owner: owner.clone(),
    };
    let orchestrator = OsdOrchestrator::new(
        manager.ceph(),
        Arc::new(ConfigMapKvStore::new(ctx.client.clone(), &ns, Some(owner.clone()))),
        Arc::new(KubeStatusStore::new(ctx.client.clone(), &ns, Some(owner))),
        Arc::new(KubeOsdWorkloads::new(ctx.client.clone(), &ns)),
        ctx.metrics.clone(),
    );
    orchestrator
        .reconcile(&osd_params, &spec.storage, spec.resources.osd.as_ref(), &ctx.cancel.child_token())
        .await?;

    patch_status(&clusters, &name, ClusterState::Created, None).await?;
    Ok(Action::requeue(Duration::from_secs(3600 / 2)))
}

/// Requeue delay for a failed reconcile.
pub fn retry_after(kind: ErrorKind) -> Duration {
    match kind {
        ErrorKind::Conflict => Duration::from_secs(1),
        ErrorKind::Transient | ErrorKind::Contended => Duration::from_secs(30),
        ErrorKind::Unsafe => Duration::from_secs(5 * 60),
        ErrorKind::Fatal => Duration::from_secs(15 * 60),
    }
}

fn error_policy(object: Arc<Cluster>, err: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile of cluster {} failed: {err}", object.name_any());
    ctx.metrics.reconcile.set_failure(object.as_ref(), err);
    Action::requeue(retry_after(err.kind()))
}

/// Health ticks in flight, at most one per cluster namespace.
#[derive(Default)]
pub struct HealthTicks {
    running: BTreeMap<String, JoinHandle<()>>,
}

impl HealthTicks {
    /// Spawns `tick` for `namespace` unless the previous one is still
    /// running. False when it was skipped.
    pub fn launch<F>(&mut self, namespace: &str, tick: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.running.get(namespace).is_some_and(|t| !t.is_finished()) {
            return false;
        }
        self.running.insert(namespace.to_string(), tokio::spawn(tick));
        true
    }

    /// Stops tracking the tick of a namespace, aborting it when still running.
    pub fn forget(&mut self, namespace: &str) {
        if let Some(tick) = self.running.remove(namespace) {
            tick.abort();
        }
    }
}

/// One health tick per cluster every interval. Managers of deleted clusters
/// are shut down. A tick replacing a mon can wait minutes for quorum, so
/// each cluster ticks in its own task.
pub async fn run_health(ctx: Arc<Context>, cancel: CancellationToken) {
    let clusters: Api<Cluster> = Api::all(ctx.client.clone());
    let mut interval = tokio::time::interval(ctx.config.mon_health_interval);
    let mut ticks = HealthTicks::default();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {}
        }
        State::touch(&ctx.diagnostics, "mon-health").await;
        let live: Vec<String> = match clusters.list(&ListParams::default()).await {
            Ok(list) => list.items.iter().filter_map(|c| c.namespace()).collect(),
            Err(e) => {
                warn!("failed to list clusters: {e}");
                continue;
            }
        };
        for (ns, manager) in ctx.clusters.all().await {
            if !live.contains(&ns) {
                info!("cluster in {ns} is gone, stopping its mon manager");
                manager.shutdown();
                ctx.clusters.remove(&ns).await;
                ticks.forget(&ns);
                continue;
            }
            let namespace = ns.clone();
            let launched = ticks.launch(&ns, async move {
                match manager.check_health().await {
                    Ok(report) => debug!("mon health of {namespace}: {} in quorum", report.in_quorum.len()),
                    Err(e) => warn!("mon health check of {namespace} failed: {e}"),
                }
            });
            if !launched {
                debug!("previous mon health check of {ns} still running");
            }
        }
    }
}

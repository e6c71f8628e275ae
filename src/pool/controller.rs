use std::{sync::Arc, time::Duration};

use chrono::Utc;
use futures::StreamExt;
use kube::{
    api::{Patch, PatchParams},
    runtime::{
        controller::Action,
        finalizer::{finalizer, Error as FinalizerError, Event as Finalizer},
        watcher, Controller,
    },
    Api, Resource, ResourceExt,
};
use serde_json::json;
use tracing::{debug, field, info, instrument, warn, Span};

use crate::{
    api::{
        constants::FIELD_MANAGER,
        v1::pool::{Pool, PoolKind, PoolPhase, PoolSpec, PoolStatus},
    },
    client::ceph::CephAdmin,
    cluster::controller::retry_after,
    telemetry::{
        state::{Context, State},
        telemetry,
    },
    Error, Result,
};

pub const POOL_FINALIZER: &str = "pool.ceph.rook.io";
const DEFAULT_CRUSH_ROOT: &str = "default";

pub fn rule_name(pool: &str) -> String {
    format!("{pool}_rule")
}

/// Creates the pool unless the backend already has one by that name.
pub async fn create_pool(ceph: &dyn CephAdmin, name: &str, spec: &PoolSpec) -> Result<bool> {
    if ceph.list_pools().await?.iter().any(|p| p.name == name) {
        debug!("pool {name} already exists");
        return Ok(false);
    }
    let fd = spec.failure_domain();
    match spec.kind()? {
        PoolKind::Replicated(replicated) => {
            let rule = rule_name(name);
            let root = spec.crush_root.as_deref().unwrap_or(DEFAULT_CRUSH_ROOT);
            ceph.create_crush_rule(&rule, root, fd.as_str()).await?;
            ceph.create_replicated_pool(name, &rule, replicated.size).await?;
        }
        PoolKind::ErasureCoded(ec) => {
            ceph.create_erasure_coded_pool(
                name,
                ec.data_chunks,
                ec.coding_chunks,
                fd.as_str(),
                ec.algorithm.as_deref(),
            )
            .await?;
        }
    }
    info!("created pool {name} with failure domain {fd}");
    Ok(true)
}

pub async fn delete_pool(ceph: &dyn CephAdmin, name: &str) -> Result<()> {
    if ceph.list_pools().await?.iter().any(|p| p.name == name) {
        info!("deleting pool {name}");
        ceph.delete_pool(name).await?;
    }
    Ok(())
}

pub async fn run(ctx: Arc<Context>) {
    let pools: Api<Pool> = Api::all(ctx.client.clone());
    info!("starting pool controller");
    Controller::new(pools, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}

async fn patch_status(api: &Api<Pool>, name: &str, phase: PoolPhase, message: Option<String>) -> Result<()> {
    let status = Patch::Apply(json!({
        "apiVersion": Pool::api_version(&()),
        "kind": Pool::kind(&()),
        "status": PoolStatus {
            phase: Some(phase),
            message,
            last_updated: Some(Utc::now()),
        }
    }));
    api.patch_status(name, &PatchParams::apply(FIELD_MANAGER).force(), &status)
        .await?;
    Ok(())
}

async fn ceph_for(ctx: &Context, namespace: &str) -> Result<Arc<dyn CephAdmin>> {
    Ok(ctx
        .clusters
        .get(namespace)
        .await
        .ok_or_else(|| Error::Transient(format!("no running cluster in {namespace}")))?
        .ceph())
}

async fn apply(pool: Arc<Pool>, ctx: &Context, api: &Api<Pool>) -> Result<Action> {
    let name = pool.name_any();
    let ns = pool.namespace().unwrap_or_default();
    let ceph = ceph_for(ctx, &ns).await?;
    match create_pool(ceph.as_ref(), &name, &pool.spec).await {
        Ok(_) => {
            if pool.status.as_ref().and_then(|s| s.phase.as_ref()) != Some(&PoolPhase::Created) {
                patch_status(api, &name, PoolPhase::Created, None).await?;
            }
            Ok(Action::requeue(Duration::from_secs(3600)))
        }
        Err(e) => {
            patch_status(api, &name, PoolPhase::Failed, Some(e.to_string())).await?;
            Err(e)
        }
    }
}

async fn cleanup(pool: Arc<Pool>, ctx: &Context) -> Result<Action> {
    let ns = pool.namespace().unwrap_or_default();
    match ctx.clusters.get(&ns).await {
        Some(manager) => delete_pool(manager.ceph().as_ref(), &pool.name_any()).await?,
        None => warn!("cluster of pool {} is gone, nothing to delete", pool.name_any()),
    }
    Ok(Action::await_change())
}

#[instrument(skip(pool, ctx), fields(trace_id))]
async fn reconcile(pool: Arc<Pool>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    if trace_id != opentelemetry::trace::TraceId::INVALID {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.metrics.reconcile.count_and_measure(pool.as_ref(), &trace_id);
    State::touch(&ctx.diagnostics, "pool").await;

    let ns = pool
        .namespace()
        .ok_or_else(|| Error::InvalidSpec(format!("pool {} has no namespace", pool.name_any())))?;
    let api: Api<Pool> = Api::namespaced(ctx.client.clone(), &ns);
    let (ctx, pools) = (ctx.as_ref(), &api);
    finalizer(&api, POOL_FINALIZER, pool, |event| async move {
        match event {
            Finalizer::Apply(pool) => apply(pool, ctx, pools).await,
            Finalizer::Cleanup(pool) => cleanup(pool, ctx).await,
        }
    })
    .await
    .map_err(|e| match e {
        FinalizerError::ApplyFailed(e) | FinalizerError::CleanupFailed(e) => e,
        FinalizerError::AddFinalizer(e) | FinalizerError::RemoveFinalizer(e) => Error::Kube(e),
        other => Error::Fatal(other.to_string()),
    })
}

fn error_policy(pool: Arc<Pool>, err: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile of pool {} failed: {err}", pool.name_any());
    ctx.metrics.reconcile.set_failure(pool.as_ref(), err);
    Action::requeue(retry_after(err.kind()))
}

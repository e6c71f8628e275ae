use std::collections::BTreeMap;

use k8s_openapi::api::{
    core::v1::{PersistentVolume, Pod},
    storage::v1::StorageClass,
};
use kube::{api::ListParams, Api, Client, ResourceExt};
use tracing::info;

use super::coordinator::AttachOptions;
use crate::{api::constants::DEFAULT_CLUSTER_NAME, Error, Result};

const IMAGE_KEY: &str = "image";
const POOL_KEY: &str = "pool";
const STORAGE_CLASS_KEY: &str = "storageClass";
const CLUSTER_NAMESPACE_KEY: &str = "clusterNamespace";
const CLUSTER_NAME_KEY: &str = "clusterName";

/// Pod uid and volume name out of
/// `<root>/pods/<podUID>/volumes/<vendor~driver>/<pvName>`.
pub fn parse_mount_dir(mount_dir: &str) -> Result<(String, String)> {
    let segments: Vec<&str> = mount_dir.split('/').collect();
    if segments.len() < 5 {
        return Err(Error::InvalidSpec(format!(
            "mount dir {mount_dir} does not name a pod volume"
        )));
    }
    let n = segments.len();
    Ok((segments[n - 4].to_string(), segments[n - 1].to_string()))
}

/// Options of the flex volume source backing a persistent volume.
fn flex_options(pv: &PersistentVolume) -> BTreeMap<String, String> {
    pv.spec
        .as_ref()
        .and_then(|s| s.flex_volume.as_ref())
        .and_then(|f| f.options.clone())
        .unwrap_or_default()
}

/// `clusterNamespace`, then the older `clusterName`, then the default.
pub fn cluster_from_storage_class(sc: &StorageClass) -> String {
    let params = sc.parameters.clone().unwrap_or_default();
    params
        .get(CLUSTER_NAMESPACE_KEY)
        .or_else(|| params.get(CLUSTER_NAME_KEY))
        .cloned()
        .unwrap_or_else(|| {
            info!(
                "storage class {} names no cluster, using {DEFAULT_CLUSTER_NAME}",
                sc.name_any()
            );
            DEFAULT_CLUSTER_NAME.to_string()
        })
}

/// Fills unset fields from the persistent volume and the pods running here.
pub fn hydrate(opts: &mut AttachOptions, pv: &PersistentVolume, pods: &[Pod]) {
    if opts.pod_namespace.is_empty() {
        if let Some(ns) = pv
            .spec
            .as_ref()
            .and_then(|s| s.claim_ref.as_ref())
            .and_then(|c| c.namespace.clone())
        {
            opts.pod_namespace = ns;
        }
    }
    if opts.pod_name.is_empty() {
        if let Some(pod) = pods
            .iter()
            .find(|p| p.metadata.uid.as_deref() == Some(opts.pod_id.as_str()))
        {
            opts.pod_name = pod.name_any();
        }
    }
    let options = flex_options(pv);
    let fill = |field: &mut String, key: &str| {
        if field.is_empty() {
            if let Some(v) = options.get(key) {
                *field = v.clone();
            }
        }
    };
    fill(&mut opts.image, IMAGE_KEY);
    fill(&mut opts.pool, POOL_KEY);
    fill(&mut opts.storage_class, STORAGE_CLASS_KEY);
}

/// Recovers the attach context the kubelet does not pass on detach.
pub async fn attach_info_from_mount_dir(
    client: Client,
    node: &str,
    mount_dir: &str,
    mut opts: AttachOptions,
) -> Result<AttachOptions> {
    if opts.pod_id.is_empty() {
        let (pod_id, volume) = parse_mount_dir(mount_dir)?;
        opts.pod_id = pod_id;
        opts.volume_name = volume;
    }
    opts.mount_dir = mount_dir.to_string();

    let pvs: Api<PersistentVolume> = Api::all(client.clone());
    let pv = pvs.get(&opts.volume_name).await?;

    let mut pods = vec![];
    if opts.pod_name.is_empty() {
        let namespace = pv
            .spec
            .as_ref()
            .and_then(|s| s.claim_ref.as_ref())
            .and_then(|c| c.namespace.clone())
            .unwrap_or_else(|| opts.pod_namespace.clone());
        let api: Api<Pod> = Api::namespaced(client.clone(), &namespace);
        pods = api
            .list(&ListParams::default().fields(&format!("spec.nodeName={node}")))
            .await?
            .items;
    }
    hydrate(&mut opts, &pv, &pods);

    let classes: Api<StorageClass> = Api::all(client);
    let sc = classes.get(&opts.storage_class).await?;
    opts.cluster_name = cluster_from_storage_class(&sc);
    Ok(opts)
}

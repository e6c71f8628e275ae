use std::path::{Path, PathBuf};

use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::{Api, Client};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    api::constants::{ADMIN_SECRET_NAME, MON_ENDPOINTS_CONFIGMAP, MON_ENDPOINTS_DATA_KEY},
    client::executor::CommandExecutor,
    mon::{cluster_info::admin_key, endpoints},
    Error, Result,
};

const CLIENT_USER: &str = "admin";

/// Where the kubelet mounts a volume once for every pod on the node.
pub fn global_mount_path(kubelet_root: &Path, vendor: &str, driver: &str, volume: &str) -> PathBuf {
    kubelet_root
        .join("plugins")
        .join(vendor)
        .join(driver)
        .join("mounts")
        .join(volume)
}

/// `vendor~driver` directory name split in two.
pub fn driver_info(driver_dir: &Path) -> Result<(String, String)> {
    let name = driver_dir
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    match name.split_once('~') {
        Some((vendor, driver)) if !vendor.is_empty() && !driver.is_empty() => {
            Ok((vendor.to_string(), driver.to_string()))
        }
        _ => Err(Error::InvalidSpec(format!(
            "{} is not a vendor~driver directory",
            driver_dir.display()
        ))),
    }
}

/// What a kernel client needs to reach the cluster.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClientAccessInfo {
    pub mon_addresses: Vec<String>,
    pub user_name: String,
    pub secret_key: String,
}

pub async fn client_access_info(client: Client, cluster_namespace: &str) -> Result<ClientAccessInfo> {
    let maps: Api<ConfigMap> = Api::namespaced(client.clone(), cluster_namespace);
    let secrets: Api<Secret> = Api::namespaced(client, cluster_namespace);

    let data = maps
        .get_opt(MON_ENDPOINTS_CONFIGMAP)
        .await?
        .and_then(|cm| cm.data)
        .and_then(|mut d| d.remove(MON_ENDPOINTS_DATA_KEY))
        .ok_or_else(|| {
            Error::NotFound(format!("mon endpoints of cluster {cluster_namespace}"))
        })?;
    let secret = secrets
        .get_opt(ADMIN_SECRET_NAME)
        .await?
        .ok_or_else(|| Error::NotFound(format!("secret {ADMIN_SECRET_NAME} in {cluster_namespace}")))?;

    Ok(ClientAccessInfo {
        mon_addresses: endpoints::addresses(&endpoints::parse(&data)),
        user_name: CLIENT_USER.to_string(),
        secret_key: admin_key(&secret)?,
    })
}

pub async fn kernel_version(executor: &dyn CommandExecutor) -> Result<String> {
    Ok(executor
        .execute("uname", &["-r".to_string()])
        .await?
        .trim()
        .to_string())
}

/// Copies the driver binary next to its final name and renames it into
/// place, so the kubelet never runs a half written file.
pub async fn install_driver(binary: &Path, driver_dir: &Path, driver: &str) -> Result<PathBuf> {
    let io = |what: &str, e: std::io::Error| Error::Fatal(format!("{what}: {e}"));
    tokio::fs::create_dir_all(driver_dir)
        .await
        .map_err(|e| io("creating driver dir", e))?;
    let target = driver_dir.join(driver);
    let staging = driver_dir.join(format!(".{driver}.tmp"));
    tokio::fs::copy(binary, &staging)
        .await
        .map_err(|e| io("copying driver", e))?;
    tokio::fs::rename(&staging, &target)
        .await
        .map_err(|e| io("installing driver", e))?;
    info!("installed flex driver at {}", target.display());
    Ok(target)
}

use std::{collections::BTreeMap, path::Path};

use k8s_openapi::{api::core::v1::Secret, ByteString};
use kube::{api::ObjectMeta, core::OwnerReference};
use tracing::{info, instrument};
use uuid::Uuid;

use super::endpoints::MonEndpoints;
use crate::{
    api::constants::{ADMIN_SECRET_NAME, MON_SECRET_NAME},
    client::executor::CommandExecutor,
    Error, Result,
};

const FSID_KEY: &str = "fsid";
const MON_SECRET_KEY: &str = "mon-secret";
const ADMIN_SECRET_KEY: &str = "admin-secret";
const CLUSTER_NAME_KEY: &str = "cluster-name";
const ADMIN_KEY: &str = "key";

pub const ADMIN_USER: &str = "client.admin";

/// Identity and credentials of one backend cluster.
#[derive(Clone, Debug, PartialEq)]
pub struct ClusterSecrets {
    pub fsid: String,
    pub mon_secret: String,
    pub admin_secret: String,
    pub cluster_name: String,
}

/// Secrets plus the live monitor endpoints.
#[derive(Clone, Debug, PartialEq)]
pub struct ClusterInfo {
    pub secrets: ClusterSecrets,
    pub monitors: MonEndpoints,
}

impl ClusterInfo {
    pub fn name(&self) -> &str {
        &self.secrets.cluster_name
    }
}

fn admin_caps() -> Vec<String> {
    ["mon", "osd", "mgr", "mds"]
        .iter()
        .flat_map(|daemon| {
            let cap = if *daemon == "mds" { "allow" } else { "allow *" };
            ["--cap".to_string(), daemon.to_string(), cap.to_string()]
        })
        .collect()
}

/// The key is the third field of the keyring line mentioning `key`.
pub fn extract_key(contents: &str) -> Result<String> {
    contents
        .lines()
        .find(|line| line.contains("key"))
        .and_then(|line| line.split_whitespace().nth(2))
        .map(str::to_string)
        .ok_or_else(|| Error::Fatal("failed to parse secret".to_string()))
}

/// Generates a key for `entity` with `ceph-authtool` and reads it back from
/// the keyring it writes under `dir`.
pub async fn generate_key<E: CommandExecutor + ?Sized>(
    executor: &E,
    dir: &Path,
    entity: &str,
    caps: &[String],
) -> Result<String> {
    let path = dir.join(format!("{}.keyring", entity.trim_end_matches('.')));
    let mut args = vec![
        "--create-keyring".to_string(),
        path.display().to_string(),
        "--gen-key".to_string(),
        "-n".to_string(),
        entity.to_string(),
    ];
    args.extend_from_slice(caps);
    executor
        .execute("ceph-authtool", &args)
        .await
        .map_err(|e| Error::Fatal(format!("failed to generate secret for {entity}: {e}")))?;
    let contents = tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| Error::Fatal(format!("failed to read keyring {}: {e}", path.display())))?;
    let key = extract_key(&contents);
    let _ = tokio::fs::remove_file(&path).await;
    key
}

/// Fresh fsid and secrets for a new cluster.
#[instrument(skip(executor, config_dir))]
pub async fn generate<E: CommandExecutor + ?Sized>(
    executor: &E,
    config_dir: &Path,
    cluster_name: &str,
) -> Result<ClusterSecrets> {
    let dir = config_dir.join(cluster_name);
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| Error::Fatal(format!("failed to create dir {}: {e}", dir.display())))?;

    let mon_caps = vec!["--cap".to_string(), "mon".to_string(), "allow *".to_string()];
    let mon_secret = generate_key(executor, &dir, "mon.", &mon_caps).await?;
    let admin_secret = generate_key(executor, &dir, ADMIN_USER, &admin_caps()).await?;
    info!("generated secrets for cluster {cluster_name}");

    Ok(ClusterSecrets {
        fsid: Uuid::new_v4().to_string(),
        mon_secret,
        admin_secret,
        cluster_name: cluster_name.to_string(),
    })
}

fn secret(name: &str, namespace: &str, owner: &OwnerReference, data: BTreeMap<String, String>) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            owner_references: Some(vec![owner.clone()]),
            ..Default::default()
        },
        data: Some(
            data.into_iter()
                .map(|(k, v)| (k, ByteString(v.into_bytes())))
                .collect(),
        ),
        type_: Some("kubernetes.io/rook".to_string()),
        ..Default::default()
    }
}

impl ClusterSecrets {
    /// The mon secret and the admin key secret, both owned by the cluster.
    pub fn to_secrets(&self, namespace: &str, owner: &OwnerReference) -> (Secret, Secret) {
        let mon = secret(
            MON_SECRET_NAME,
            namespace,
            owner,
            BTreeMap::from([
                (FSID_KEY.to_string(), self.fsid.clone()),
                (MON_SECRET_KEY.to_string(), self.mon_secret.clone()),
                (ADMIN_SECRET_KEY.to_string(), self.admin_secret.clone()),
                (CLUSTER_NAME_KEY.to_string(), self.cluster_name.clone()),
            ]),
        );
        let admin = secret(
            ADMIN_SECRET_NAME,
            namespace,
            owner,
            BTreeMap::from([(ADMIN_KEY.to_string(), self.admin_secret.clone())]),
        );
        (mon, admin)
    }

    /// Reads the mon secret. Missing fields mean the secret was tampered with.
    pub fn from_secret(secret: &Secret) -> Result<Self> {
        let data = secret.data.clone().unwrap_or_default();
        let field = |key: &str| -> Result<String> {
            data.get(key)
                .map(|v| String::from_utf8_lossy(&v.0).to_string())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| Error::Fatal(format!("mon secret is missing {key}")))
        };
        Ok(ClusterSecrets {
            fsid: field(FSID_KEY)?,
            mon_secret: field(MON_SECRET_KEY)?,
            admin_secret: field(ADMIN_SECRET_KEY)?,
            cluster_name: field(CLUSTER_NAME_KEY)?,
        })
    }
}

/// Reads the admin key out of the `rook-admin` secret.
pub fn admin_key(secret: &Secret) -> Result<String> {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(ADMIN_KEY))
        .map(|v| String::from_utf8_lossy(&v.0).to_string())
        .ok_or_else(|| Error::NotFound(format!("{ADMIN_KEY} in secret {ADMIN_SECRET_NAME}")))
}

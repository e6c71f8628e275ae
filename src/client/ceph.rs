use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, info};

use super::executor::CommandExecutor;
use crate::{Error, Result};

pub const CEPH_TOOL: &str = "ceph";
pub const RBD_TOOL: &str = "rbd";
pub const RGW_ADMIN_TOOL: &str = "radosgw-admin";

/// Crush unit flag that stops the backend from marking osds out.
pub const NOOUT: &str = "noout";

lazy_static! {
    static ref CLEAN_PGS: Regex =
        Regex::new(r"^(active\+clean|active\+clean\+scrubbing|active\+clean\+scrubbing\+deep)$")
            .expect("static regex");
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct MonStatus {
    #[serde(default)]
    pub quorum: Vec<i32>,
    #[serde(default)]
    pub monmap: MonMap,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct MonMap {
    #[serde(default)]
    pub mons: Vec<MonMapEntry>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct MonMapEntry {
    pub name: String,
    pub rank: i32,
    #[serde(default)]
    pub addr: String,
}

impl MonStatus {
    pub fn in_quorum(&self, name: &str) -> bool {
        self.monmap
            .mons
            .iter()
            .any(|m| m.name == name && self.quorum.contains(&m.rank))
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct CephStatus {
    #[serde(default)]
    pub pgmap: PgMap,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct PgMap {
    #[serde(default)]
    pub pgs_by_state: Vec<PgStateEntry>,
    #[serde(default)]
    pub num_pgs: u64,
    #[serde(default)]
    pub bytes_total: u64,
    #[serde(default)]
    pub bytes_avail: u64,
    #[serde(default)]
    pub bytes_used: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct PgStateEntry {
    pub state_name: String,
    pub count: u64,
}

impl PgMap {
    /// Every placement group is in a clean state. An empty map is clean.
    pub fn is_clean(&self) -> bool {
        if self.num_pgs == 0 {
            return true;
        }
        let clean: u64 = self
            .pgs_by_state
            .iter()
            .filter(|s| CLEAN_PGS.is_match(&s.state_name))
            .map(|s| s.count)
            .sum();
        clean == self.num_pgs
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct OsdDump {
    #[serde(default)]
    pub osds: Vec<OsdDumpEntry>,
    #[serde(default)]
    pub flags: String,
    #[serde(default)]
    pub crush_node_flags: BTreeMap<String, Vec<String>>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct OsdDumpEntry {
    pub osd: i32,
    pub up: i32,
    #[serde(rename = "in")]
    pub in_: i32,
}

impl OsdDump {
    pub fn is_flag_set_on_crush_unit(&self, flag: &str, unit: &str) -> bool {
        self.crush_node_flags
            .get(unit)
            .is_some_and(|flags| flags.iter().any(|f| f == flag))
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct OsdUsage {
    #[serde(default)]
    pub nodes: Vec<OsdUsageEntry>,
    #[serde(default)]
    pub summary: OsdUsageSummary,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct OsdUsageEntry {
    pub id: i32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kb_used: u64,
    #[serde(default)]
    pub kb_avail: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct OsdUsageSummary {
    #[serde(default)]
    pub total_kb: u64,
    #[serde(default)]
    pub total_kb_used: u64,
    #[serde(default)]
    pub total_kb_avail: u64,
}

impl OsdUsage {
    /// Bytes used by the given osd, zero when the backend does not report it.
    pub fn used_bytes(&self, id: i32) -> u64 {
        self.nodes
            .iter()
            .find(|n| n.id == id)
            .map(|n| n.kb_used * 1024)
            .unwrap_or_default()
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct Usage {
    #[serde(default)]
    pub stats: UsageStats,
    #[serde(default)]
    pub pools: Vec<PoolUsage>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct UsageStats {
    #[serde(default)]
    pub total_bytes: u64,
    #[serde(default)]
    pub total_used_bytes: u64,
    #[serde(default)]
    pub total_avail_bytes: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct PoolUsage {
    pub name: String,
    pub id: i32,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct FilesystemInfo {
    pub name: String,
    #[serde(default)]
    pub metadata_pool: String,
    #[serde(default)]
    pub data_pools: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct PoolInfo {
    #[serde(rename = "poolnum")]
    pub number: i32,
    #[serde(rename = "poolname")]
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct ImageInfo {
    pub image: String,
    #[serde(default)]
    pub size: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct ObjectUser {
    pub user_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub keys: Vec<ObjectUserKey>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct ObjectUserKey {
    pub user: String,
    pub access_key: String,
    pub secret_key: String,
}

/// Cluster level administration through the `ceph` tool.
#[async_trait]
pub trait CephAdmin: Send + Sync {
    async fn mon_status(&self) -> Result<MonStatus>;
    async fn status(&self) -> Result<CephStatus>;
    async fn osd_dump(&self) -> Result<OsdDump>;
    async fn osd_usage(&self) -> Result<OsdUsage>;
    async fn usage(&self) -> Result<Usage>;
    async fn set_crush_unit_flag(&self, unit: &str, flag: &str) -> Result<()>;
    async fn unset_crush_unit_flag(&self, unit: &str, flag: &str) -> Result<()>;
    async fn set_osd_flag(&self, flag: &str, set: bool) -> Result<()>;
    async fn list_filesystems(&self) -> Result<Vec<FilesystemInfo>>;
    async fn auth_get_or_create_key(&self, entity: &str, caps: &[String]) -> Result<String>;
    async fn mon_remove(&self, name: &str) -> Result<()>;
    async fn list_pools(&self) -> Result<Vec<PoolInfo>>;
    async fn create_crush_rule(&self, name: &str, root: &str, failure_domain: &str) -> Result<()>;
    async fn create_replicated_pool(&self, name: &str, rule: &str, size: u32) -> Result<()>;
    async fn create_erasure_coded_pool(
        &self,
        name: &str,
        data_chunks: u32,
        coding_chunks: u32,
        failure_domain: &str,
        algorithm: Option<&str>,
    ) -> Result<()>;
    async fn delete_pool(&self, name: &str) -> Result<()>;

    async fn is_cluster_clean(&self) -> Result<bool> {
        Ok(self.status().await?.pgmap.is_clean())
    }

    async fn disable_scrubbing(&self) -> Result<()> {
        self.set_osd_flag("noscrub", true).await?;
        self.set_osd_flag("nodeep-scrub", true).await
    }

    async fn enable_scrubbing(&self) -> Result<()> {
        self.set_osd_flag("noscrub", false).await?;
        self.set_osd_flag("nodeep-scrub", false).await
    }

    /// Sets or clears `flag` on a crush unit, reporting whether anything changed.
    async fn update_crush_unit_flag(&self, unit: &str, flag: &str, set: bool) -> Result<bool> {
        let dump = self.osd_dump().await?;
        let current = dump.is_flag_set_on_crush_unit(flag, unit);
        if current == set {
            return Ok(false);
        }
        if set {
            self.set_crush_unit_flag(unit, flag).await?;
        } else {
            self.unset_crush_unit_flag(unit, flag).await?;
        }
        Ok(true)
    }
}

/// Block images and the kernel rbd driver.
#[async_trait]
pub trait BlockAdmin: Send + Sync {
    async fn create_image(&self, pool: &str, image: &str, size_mb: u64) -> Result<()>;
    async fn delete_image(&self, pool: &str, image: &str) -> Result<()>;
    async fn list_images(&self, pool: &str) -> Result<Vec<ImageInfo>>;
    /// Maps the image and returns the local device path.
    async fn map_image(&self, pool: &str, image: &str) -> Result<String>;
    async fn unmap_image(&self, pool: &str, image: &str, force: bool) -> Result<()>;
}

/// Object store users and buckets.
#[async_trait]
pub trait ObjectAdmin: Send + Sync {
    async fn create_user(&self, store: &str, user_id: &str, display_name: &str) -> Result<ObjectUser>;
    async fn delete_user(&self, store: &str, user_id: &str) -> Result<()>;
    async fn list_users(&self, store: &str) -> Result<Vec<String>>;
    async fn list_buckets(&self, store: &str) -> Result<Vec<String>>;
    async fn delete_bucket(&self, store: &str, bucket: &str) -> Result<()>;
}

/// Where the admin connection config for a cluster lives.
pub fn connection_paths(config_dir: &Path, cluster_name: &str) -> (PathBuf, PathBuf) {
    let dir = config_dir.join(cluster_name);
    (
        dir.join(format!("{cluster_name}.config")),
        dir.join("client.admin.keyring"),
    )
}

/// Backend client that shells out to the ceph tools.
#[derive(Clone)]
pub struct CephClient<E> {
    executor: E,
    cluster_name: String,
    config_dir: PathBuf,
}

impl<E: CommandExecutor> CephClient<E> {
    pub fn new(executor: E, cluster_name: impl Into<String>, config_dir: impl Into<PathBuf>) -> Self {
        CephClient {
            executor,
            cluster_name: cluster_name.into(),
            config_dir: config_dir.into(),
        }
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    fn connection_args(&self) -> Vec<String> {
        let (config, keyring) = connection_paths(&self.config_dir, &self.cluster_name);
        vec![
            format!("--cluster={}", self.cluster_name),
            format!("--conf={}", config.display()),
            format!("--keyring={}", keyring.display()),
        ]
    }

    fn args(&self, args: &[&str], json: bool) -> Vec<String> {
        let mut full: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        full.extend(self.connection_args());
        if json {
            full.push("--format".to_string());
            full.push("json".to_string());
        }
        full
    }

    async fn run(&self, tool: &str, args: &[&str]) -> Result<String> {
        let args = self.args(args, false);
        self.executor.execute(tool, &args).await
    }

    async fn run_json<T: DeserializeOwned>(&self, tool: &str, args: &[&str]) -> Result<T> {
        let args = self.args(args, true);
        let out = self.executor.execute(tool, &args).await?;
        serde_json::from_str(&out).map_err(|e| {
            Error::command(tool, &args, format!("unparseable output: {e}"))
        })
    }
}

#[async_trait]
impl<E: CommandExecutor> CephAdmin for CephClient<E> {
    async fn mon_status(&self) -> Result<MonStatus> {
        self.run_json(CEPH_TOOL, &["mon_status"]).await
    }

    async fn status(&self) -> Result<CephStatus> {
        self.run_json(CEPH_TOOL, &["status"]).await
    }

    async fn osd_dump(&self) -> Result<OsdDump> {
        self.run_json(CEPH_TOOL, &["osd", "dump"]).await
    }

    async fn osd_usage(&self) -> Result<OsdUsage> {
        self.run_json(CEPH_TOOL, &["osd", "df"]).await
    }

    async fn usage(&self) -> Result<Usage> {
        self.run_json(CEPH_TOOL, &["df", "detail"]).await
    }

    async fn set_crush_unit_flag(&self, unit: &str, flag: &str) -> Result<()> {
        info!("setting {flag} on crush unit {unit}");
        self.run(CEPH_TOOL, &["osd", "set-group", flag, unit]).await?;
        Ok(())
    }

    async fn unset_crush_unit_flag(&self, unit: &str, flag: &str) -> Result<()> {
        info!("clearing {flag} on crush unit {unit}");
        self.run(CEPH_TOOL, &["osd", "unset-group", flag, unit]).await?;
        Ok(())
    }

    async fn set_osd_flag(&self, flag: &str, set: bool) -> Result<()> {
        let verb = if set { "set" } else { "unset" };
        self.run(CEPH_TOOL, &["osd", verb, flag]).await?;
        Ok(())
    }

    async fn list_filesystems(&self) -> Result<Vec<FilesystemInfo>> {
        self.run_json(CEPH_TOOL, &["fs", "ls"]).await
    }

    async fn auth_get_or_create_key(&self, entity: &str, caps: &[String]) -> Result<String> {
        let mut args = vec!["auth", "get-or-create-key", entity];
        args.extend(caps.iter().map(String::as_str));
        #[derive(Deserialize)]
        struct Key {
            key: String,
        }
        let key: Key = self.run_json(CEPH_TOOL, &args).await?;
        Ok(key.key)
    }

    async fn mon_remove(&self, name: &str) -> Result<()> {
        self.run(CEPH_TOOL, &["mon", "remove", name]).await?;
        Ok(())
    }

    async fn list_pools(&self) -> Result<Vec<PoolInfo>> {
        self.run_json(CEPH_TOOL, &["osd", "lspools"]).await
    }

    async fn create_crush_rule(&self, name: &str, root: &str, failure_domain: &str) -> Result<()> {
        self.run(
            CEPH_TOOL,
            &["osd", "crush", "rule", "create-simple", name, root, failure_domain],
        )
        .await?;
        Ok(())
    }

    async fn create_replicated_pool(&self, name: &str, rule: &str, size: u32) -> Result<()> {
        self.run(CEPH_TOOL, &["osd", "pool", "create", name, "0", "replicated", rule])
            .await?;
        let size = size.to_string();
        self.run(CEPH_TOOL, &["osd", "pool", "set", name, "size", &size])
            .await?;
        Ok(())
    }

    async fn create_erasure_coded_pool(
        &self,
        name: &str,
        data_chunks: u32,
        coding_chunks: u32,
        failure_domain: &str,
        algorithm: Option<&str>,
    ) -> Result<()> {
        let profile = format!("{name}_ecprofile");
        let k = format!("k={data_chunks}");
        let m = format!("m={coding_chunks}");
        let domain = format!("crush-failure-domain={failure_domain}");
        let plugin = algorithm.map(|a| format!("plugin={a}"));
        let mut args = vec![
            "osd",
            "erasure-code-profile",
            "set",
            profile.as_str(),
            k.as_str(),
            m.as_str(),
            domain.as_str(),
        ];
        if let Some(plugin) = &plugin {
            args.push(plugin.as_str());
        }
        self.run(CEPH_TOOL, &args).await?;
        self.run(CEPH_TOOL, &["osd", "pool", "create", name, "0", "erasure", &profile])
            .await?;
        Ok(())
    }

    async fn delete_pool(&self, name: &str) -> Result<()> {
        self.run(
            CEPH_TOOL,
            &["osd", "pool", "delete", name, name, "--yes-i-really-really-mean-it"],
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl<E: CommandExecutor> BlockAdmin for CephClient<E> {
    async fn create_image(&self, pool: &str, image: &str, size_mb: u64) -> Result<()> {
        let size = size_mb.to_string();
        self.run(RBD_TOOL, &["create", &format!("{pool}/{image}"), "--size", &size])
            .await?;
        Ok(())
    }

    async fn delete_image(&self, pool: &str, image: &str) -> Result<()> {
        self.run(RBD_TOOL, &["rm", &format!("{pool}/{image}")]).await?;
        Ok(())
    }

    async fn list_images(&self, pool: &str) -> Result<Vec<ImageInfo>> {
        self.run_json(RBD_TOOL, &["ls", "-l", pool]).await
    }

    async fn map_image(&self, pool: &str, image: &str) -> Result<String> {
        let spec = format!("{pool}/{image}");
        let out = self.run(RBD_TOOL, &["map", &spec]).await?;
        let device = out.trim().to_string();
        if device.is_empty() {
            return Err(Error::Transient(format!("rbd map {spec} returned no device")));
        }
        debug!("mapped {spec} to {device}");
        Ok(device)
    }

    async fn unmap_image(&self, pool: &str, image: &str, force: bool) -> Result<()> {
        let spec = format!("{pool}/{image}");
        if force {
            self.run(RBD_TOOL, &["unmap", "-o", "force", &spec]).await?;
        } else {
            self.run(RBD_TOOL, &["unmap", &spec]).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<E: CommandExecutor> ObjectAdmin for CephClient<E> {
    async fn create_user(&self, store: &str, user_id: &str, display_name: &str) -> Result<ObjectUser> {
        let uid = format!("--uid={user_id}");
        let name = format!("--display-name={display_name}");
        let zone = format!("--rgw-zone={store}");
        self.run_json(RGW_ADMIN_TOOL, &["user", "create", &uid, &name, &zone])
            .await
    }

    async fn delete_user(&self, store: &str, user_id: &str) -> Result<()> {
        let uid = format!("--uid={user_id}");
        let zone = format!("--rgw-zone={store}");
        self.run(RGW_ADMIN_TOOL, &["user", "rm", &uid, &zone]).await?;
        Ok(())
    }

    async fn list_users(&self, store: &str) -> Result<Vec<String>> {
        let zone = format!("--rgw-zone={store}");
        self.run_json(RGW_ADMIN_TOOL, &["user", "list", &zone]).await
    }

    async fn list_buckets(&self, store: &str) -> Result<Vec<String>> {
        let zone = format!("--rgw-zone={store}");
        self.run_json(RGW_ADMIN_TOOL, &["bucket", "list", &zone]).await
    }

    async fn delete_bucket(&self, store: &str, bucket: &str) -> Result<()> {
        let bucket = format!("--bucket={bucket}");
        let zone = format!("--rgw-zone={store}");
        self.run(RGW_ADMIN_TOOL, &["bucket", "rm", &bucket, "--purge-objects", &zone])
            .await?;
        Ok(())
    }
}

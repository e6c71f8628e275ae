use std::{
    fmt::Write as _,
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{
    cluster_info::{ClusterInfo, ADMIN_USER},
    endpoints,
};
use crate::{client::ceph::connection_paths, Error, Result};

pub const KV_BACKEND: &str = "rocksdb";

/// INI text of the client connection config.
pub fn connection_config(info: &ClusterInfo, config_dir: &Path) -> String {
    let name = info.name();
    let (_, keyring) = connection_paths(config_dir, name);
    let mons = endpoints::ordered(&info.monitors);
    let members: Vec<&str> = mons.iter().map(|(name, _)| *name).collect();
    let hosts: Vec<&str> = mons.iter().map(|(_, addr)| *addr).collect();

    let mut out = String::new();
    let _ = writeln!(out, "[global]");
    let _ = writeln!(out, "fsid = {}", info.secrets.fsid);
    let _ = writeln!(out, "run dir = {}", config_dir.join(name).display());
    let _ = writeln!(out, "mon initial members = {}", members.join(" "));
    let _ = writeln!(out, "mon host = {}", hosts.join(","));
    let _ = writeln!(out, "log file = /dev/stderr");
    let _ = writeln!(out, "mon cluster log file = /dev/stderr");
    let _ = writeln!(out, "mon keyvaluedb = {KV_BACKEND}");
    let _ = writeln!(out, "osd pool default size = 1");
    let _ = writeln!(out, "osd pool default min size = 1");
    let _ = writeln!(out, "osd pool default pg num = 100");
    let _ = writeln!(out, "rbd_default_features = 3");
    let _ = writeln!(out);
    let _ = writeln!(out, "[{ADMIN_USER}]");
    let _ = writeln!(out, "keyring = {}", keyring.display());
    for (mon, addr) in &mons {
        let _ = writeln!(out);
        let _ = writeln!(out, "[mon.{mon}]");
        let _ = writeln!(out, "name = {mon}");
        let _ = writeln!(out, "mon addr = {addr}");
    }
    out
}

pub fn keyring(user: &str, key: &str) -> String {
    format!("[{user}]\n\tkey = {key}\n")
}

/// Writes connection config and keyrings under the config dir. Writers share
/// one lock so concurrent clusters never interleave partial files.
#[derive(Clone)]
pub struct ConfigWriter {
    config_dir: PathBuf,
    keyring_mirror: Option<PathBuf>,
    lock: Arc<Mutex<()>>,
}

async fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::Fatal(format!("failed to create {}: {e}", parent.display())))?;
    }
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, contents)
        .await
        .map_err(|e| Error::Fatal(format!("failed to write {}: {e}", tmp.display())))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| Error::Fatal(format!("failed to write {}: {e}", path.display())))
}

impl ConfigWriter {
    pub fn new(config_dir: PathBuf, keyring_mirror: Option<PathBuf>) -> Self {
        ConfigWriter {
            config_dir,
            keyring_mirror,
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Regenerates `<name>.config` and the admin keyring for `info`.
    pub async fn write_connection_config(&self, info: &ClusterInfo) -> Result<()> {
        let _guard = self.lock.lock().await;
        let (config, keyring_path) = connection_paths(&self.config_dir, info.name());
        let admin_keyring = keyring(ADMIN_USER, &info.secrets.admin_secret);
        write_file(&keyring_path, &admin_keyring).await?;
        write_file(&config, &connection_config(info, &self.config_dir)).await?;
        debug!("wrote connection config {}", config.display());

        if let Some(mirror) = &self.keyring_mirror {
            // best effort, only diagnostic pods read it
            if let Err(e) = write_file(mirror, &admin_keyring).await {
                warn!("failed to mirror the admin keyring: {e}");
            }
        }
        Ok(())
    }
}

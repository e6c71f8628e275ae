use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;
use tracing::{debug, info};

use super::status::{NodeStatus, OrchestrationStatus};
use crate::{
    client::{ceph::CephAdmin, kv_store::KvStore},
    Error, Result,
};

const SCHEME_KEY: &str = "partition-scheme";
const DIRS_KEY: &str = "osd-dirs";

/// Share of the raw capacity that must stay available once a node's data
/// has migrated, expressed as a divisor (1/20 = 5%).
const RESERVE_DIVISOR: u128 = 20;

/// Key-value store holding the provisioning scheme of one node.
pub fn node_config_store(node: &str) -> String {
    format!("rook-ceph-osd-{node}-config")
}

#[derive(Deserialize, Debug, Default)]
struct PartitionScheme {
    #[serde(default)]
    entries: Vec<SchemeEntry>,
}

#[derive(Deserialize, Debug)]
struct SchemeEntry {
    id: i32,
}

/// Ids of every osd the node provisioned, from both device partitions and
/// directories.
pub async fn osd_ids_for_node(kv: &dyn KvStore, node: &str) -> Result<BTreeSet<i32>> {
    let store = node_config_store(node);
    let data = match kv.list(&store).await {
        Ok(data) => data,
        Err(e) if e.is_not_found() => return Ok(BTreeSet::new()),
        Err(e) => return Err(e),
    };

    let mut ids = BTreeSet::new();
    if let Some(raw) = data.get(SCHEME_KEY) {
        let scheme: PartitionScheme = serde_json::from_str(raw)?;
        ids.extend(scheme.entries.iter().map(|e| e.id));
    }
    if let Some(raw) = data.get(DIRS_KEY) {
        let dirs: BTreeMap<String, i32> = serde_json::from_str(raw)?;
        ids.extend(dirs.values().copied());
    }
    Ok(ids)
}

/// True when `used` bytes still fit after keeping the reserve free.
/// Landing exactly on the reserve is not enough.
pub fn has_room_for(used: u64, avail: u64, total: u64) -> bool {
    let headroom = avail as i128 * RESERVE_DIVISOR as i128 - total as i128;
    (used as i128) * (RESERVE_DIVISOR as i128) < headroom
}

/// Refuses the removal of `node` with an [`Error::Unsafe`] unless the
/// cluster is clean, nothing else is orchestrating, and the rest of the
/// cluster can absorb its data.
pub async fn check_removal(
    ceph: &dyn CephAdmin,
    kv: &dyn KvStore,
    statuses: &BTreeMap<String, OrchestrationStatus>,
    node: &str,
) -> Result<()> {
    if !ceph.is_cluster_clean().await? {
        return Err(Error::Unsafe(format!(
            "cannot remove node {node}: placement groups are not all active+clean"
        )));
    }

    if let Some((other, _)) = statuses
        .iter()
        .find(|(name, s)| name.as_str() != node && s.status == NodeStatus::Orchestrating)
    {
        return Err(Error::Unsafe(format!(
            "cannot remove node {node} while node {other} is orchestrating"
        )));
    }

    let ids = osd_ids_for_node(kv, node).await?;
    let per_osd = ceph.osd_usage().await?;
    let used: u64 = ids.iter().map(|id| per_osd.used_bytes(*id)).sum();
    let stats = ceph.usage().await?.stats;
    debug!(
        "node {node} osds {ids:?} use {used} bytes, cluster has {} of {} bytes available",
        stats.total_avail_bytes, stats.total_bytes
    );

    if !has_room_for(used, stats.total_avail_bytes, stats.total_bytes) {
        return Err(Error::Unsafe(format!(
            "insufficient available space to remove node {node}: it holds {used} bytes and the cluster has {} of {} bytes available",
            stats.total_avail_bytes, stats.total_bytes
        )));
    }
    info!("node {node} is safe to remove");
    Ok(())
}

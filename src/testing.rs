//! In-memory stand-ins for the host and backend seams.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::{
    apps::v1::{DaemonSet, Deployment},
    policy::v1::PodDisruptionBudget,
};
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;

use crate::{
    api::v1::{pool::PoolSpec, volume_attachment::Attachment},
    attachment::{
        coordinator::{PodLookup, VolumeBackend},
        store::{AttachmentRecord, AttachmentStore},
    },
    client::{
        ceph::{
            CephAdmin, CephStatus, FilesystemInfo, MonMap, MonMapEntry, MonStatus, OsdDump,
            OsdUsage, OsdUsageEntry, PgMap, PgStateEntry, PoolInfo, Usage, UsageStats,
        },
        executor::CommandExecutor,
        kv_store::KvStore,
    },
    disruption::controller::{Canary, DisruptionHost},
    mon::{cluster_info::ClusterSecrets, endpoints::PersistedMons, manager::MonHost, workload::MonParams},
    osd::{
        pod::{deployment_name, node_of_deployment},
        status::{NodeStatus, OrchestrationStatus, StatusStore},
        workloads::OsdWorkloads,
    },
    Error, Result,
};

/// Answers commands from a script of `(pattern, output)` pairs and records
/// every call as `program arg1 arg2 ...`.
#[derive(Default)]
pub struct ScriptedExecutor {
    responses: Mutex<Vec<(String, String)>>,
    failures: Mutex<Vec<String>>,
    keyring_key: Mutex<Option<String>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    /// The first registered pattern contained in the call wins.
    pub fn respond(&self, pattern: &str, output: &str) {
        self.responses
            .lock()
            .unwrap()
            .push((pattern.to_string(), output.to_string()));
    }

    pub fn fail(&self, pattern: &str) {
        self.failures.lock().unwrap().push(pattern.to_string());
    }

    /// Makes `ceph-authtool` write a keyring holding `key`.
    pub fn write_keyrings(&self, key: &str) {
        *self.keyring_key.lock().unwrap() = Some(key.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandExecutor for ScriptedExecutor {
    async fn execute(&self, program: &str, args: &[String]) -> Result<String> {
        let call = std::iter::once(program.to_string())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");
        self.calls.lock().unwrap().push(call.clone());

        if self.failures.lock().unwrap().iter().any(|p| call.contains(p.as_str())) {
            return Err(Error::command(program, args, "scripted failure"));
        }

        if program == "ceph-authtool" {
            let key = self.keyring_key.lock().unwrap().clone();
            let path = args
                .iter()
                .position(|a| a == "--create-keyring")
                .and_then(|i| args.get(i + 1));
            let name = args.iter().position(|a| a == "-n").and_then(|i| args.get(i + 1));
            if let (Some(key), Some(path), Some(name)) = (key, path, name) {
                std::fs::write(PathBuf::from(path), format!("[{name}]\n\tkey = {key}\n")).unwrap();
            }
        }

        Ok(self
            .responses
            .lock()
            .unwrap()
            .iter()
            .find(|(pattern, _)| call.contains(pattern.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or_default())
    }
}

#[derive(Default)]
struct CephState {
    mons: Vec<String>,
    down: BTreeSet<String>,
    status: CephStatus,
    osd_dump: OsdDump,
    osd_usage: OsdUsage,
    usage: Usage,
    pools: Vec<PoolInfo>,
    calls: Vec<String>,
}

/// A backend whose mon map follows the mons the fake host runs.
#[derive(Default)]
pub struct FakeCeph {
    state: Mutex<CephState>,
}

impl FakeCeph {
    pub fn mon_started(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        if !state.mons.iter().any(|m| m == name) {
            state.mons.push(name.to_string());
        }
    }

    pub fn mon_down(&self, name: &str) {
        self.state.lock().unwrap().down.insert(name.to_string());
    }

    pub fn set_status(&self, status: CephStatus) {
        self.state.lock().unwrap().status = status;
    }

    pub fn set_osd_usage(&self, usage: OsdUsage) {
        self.state.lock().unwrap().osd_usage = usage;
    }

    pub fn set_usage(&self, usage: Usage) {
        self.state.lock().unwrap().usage = usage;
    }

    pub fn osd_flags(&self) -> String {
        self.state.lock().unwrap().osd_dump.flags.clone()
    }

    pub fn unit_flags(&self, unit: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .osd_dump
            .crush_node_flags
            .get(unit)
            .cloned()
            .unwrap_or_default()
    }

    pub fn pools(&self) -> Vec<String> {
        self.state.lock().unwrap().pools.iter().map(|p| p.name.clone()).collect()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    fn record(&self, call: String) {
        self.state.lock().unwrap().calls.push(call);
    }
}

#[async_trait]
impl CephAdmin for FakeCeph {
    async fn mon_status(&self) -> Result<MonStatus> {
        let state = self.state.lock().unwrap();
        let mons: Vec<MonMapEntry> = state
            .mons
            .iter()
            .enumerate()
            .map(|(rank, name)| MonMapEntry {
                name: name.clone(),
                rank: rank as i32,
                addr: String::new(),
            })
            .collect();
        let quorum = mons
            .iter()
            .filter(|m| !state.down.contains(&m.name))
            .map(|m| m.rank)
            .collect();
        Ok(MonStatus {
            quorum,
            monmap: MonMap { mons },
        })
    }

    async fn status(&self) -> Result<CephStatus> {
        Ok(self.state.lock().unwrap().status.clone())
    }

    async fn osd_dump(&self) -> Result<OsdDump> {
        Ok(self.state.lock().unwrap().osd_dump.clone())
    }

    async fn osd_usage(&self) -> Result<OsdUsage> {
        Ok(self.state.lock().unwrap().osd_usage.clone())
    }

    async fn usage(&self) -> Result<Usage> {
        Ok(self.state.lock().unwrap().usage.clone())
    }

    async fn set_crush_unit_flag(&self, unit: &str, flag: &str) -> Result<()> {
        self.record(format!("set-group {flag} {unit}"));
        let mut state = self.state.lock().unwrap();
        let flags = state
            .osd_dump
            .crush_node_flags
            .entry(unit.to_string())
            .or_default();
        if !flags.iter().any(|f| f == flag) {
            flags.push(flag.to_string());
        }
        Ok(())
    }

    async fn unset_crush_unit_flag(&self, unit: &str, flag: &str) -> Result<()> {
        self.record(format!("unset-group {flag} {unit}"));
        let mut state = self.state.lock().unwrap();
        if let Some(flags) = state.osd_dump.crush_node_flags.get_mut(unit) {
            flags.retain(|f| f != flag);
        }
        Ok(())
    }

    async fn set_osd_flag(&self, flag: &str, set: bool) -> Result<()> {
        self.record(format!("{} {flag}", if set { "set" } else { "unset" }));
        let mut state = self.state.lock().unwrap();
        let mut flags: Vec<String> = state
            .osd_dump
            .flags
            .split(',')
            .filter(|f| !f.is_empty() && *f != flag)
            .map(str::to_string)
            .collect();
        if set {
            flags.push(flag.to_string());
        }
        state.osd_dump.flags = flags.join(",");
        Ok(())
    }

    async fn list_filesystems(&self) -> Result<Vec<FilesystemInfo>> {
        Ok(vec![])
    }

    async fn auth_get_or_create_key(&self, entity: &str, _caps: &[String]) -> Result<String> {
        Ok(format!("key-for-{entity}"))
    }

    async fn mon_remove(&self, name: &str) -> Result<()> {
        self.record(format!("mon remove {name}"));
        let mut state = self.state.lock().unwrap();
        state.mons.retain(|m| m != name);
        state.down.remove(name);
        Ok(())
    }

    async fn list_pools(&self) -> Result<Vec<PoolInfo>> {
        Ok(self.state.lock().unwrap().pools.clone())
    }

    async fn create_crush_rule(&self, name: &str, root: &str, failure_domain: &str) -> Result<()> {
        self.record(format!("crush rule {name} {root} {failure_domain}"));
        Ok(())
    }

    async fn create_replicated_pool(&self, name: &str, rule: &str, size: u32) -> Result<()> {
        self.record(format!("pool create {name} replicated {rule} {size}"));
        let mut state = self.state.lock().unwrap();
        if !state.pools.iter().any(|p| p.name == name) {
            let number = state.pools.len() as i32 + 1;
            state.pools.push(PoolInfo {
                number,
                name: name.to_string(),
            });
        }
        Ok(())
    }

    async fn create_erasure_coded_pool(
        &self,
        name: &str,
        data_chunks: u32,
        coding_chunks: u32,
        failure_domain: &str,
        _algorithm: Option<&str>,
    ) -> Result<()> {
        self.record(format!(
            "pool create {name} erasure k={data_chunks} m={coding_chunks} {failure_domain}"
        ));
        let mut state = self.state.lock().unwrap();
        if !state.pools.iter().any(|p| p.name == name) {
            let number = state.pools.len() as i32 + 1;
            state.pools.push(PoolInfo {
                number,
                name: name.to_string(),
            });
        }
        Ok(())
    }

    async fn delete_pool(&self, name: &str) -> Result<()> {
        self.record(format!("pool delete {name}"));
        self.state.lock().unwrap().pools.retain(|p| p.name != name);
        Ok(())
    }
}

#[derive(Default)]
struct MonHostState {
    secrets: Option<ClusterSecrets>,
    mons: Option<PersistedMons>,
    deployments: BTreeMap<String, String>,
    ips: BTreeMap<String, String>,
    held: BTreeSet<String>,
    removed: Vec<String>,
    template: Option<MonParams>,
    applied: Vec<String>,
}

/// Runs mons by registering them with a [`FakeCeph`].
pub struct FakeMonHost {
    ceph: Arc<FakeCeph>,
    nodes: Vec<String>,
    state: Mutex<MonHostState>,
}

impl FakeMonHost {
    pub fn new(ceph: Arc<FakeCeph>, nodes: &[&str]) -> Self {
        FakeMonHost {
            ceph,
            nodes: nodes.iter().map(|n| n.to_string()).collect(),
            state: Mutex::new(MonHostState::default()),
        }
    }

    pub fn persisted(&self) -> PersistedMons {
        self.state
            .lock()
            .unwrap()
            .mons
            .clone()
            .unwrap_or_else(PersistedMons::empty)
    }

    pub fn secrets(&self) -> Option<ClusterSecrets> {
        self.state.lock().unwrap().secrets.clone()
    }

    /// The pod of `name` never becomes ready until released.
    pub fn hold_ip(&self, name: &str) {
        self.state.lock().unwrap().held.insert(name.to_string());
    }

    pub fn release_ip(&self, name: &str) {
        self.state.lock().unwrap().held.remove(name);
    }

    pub fn removed(&self) -> Vec<String> {
        self.state.lock().unwrap().removed.clone()
    }

    /// Every `apply_mon` call in order.
    pub fn applied(&self) -> Vec<String> {
        self.state.lock().unwrap().applied.clone()
    }

    pub fn template(&self) -> Option<MonParams> {
        self.state.lock().unwrap().template.clone()
    }
}

#[async_trait]
impl MonHost for FakeMonHost {
    async fn load_secrets(&self) -> Result<Option<ClusterSecrets>> {
        Ok(self.secrets())
    }

    async fn save_secrets(&self, secrets: &ClusterSecrets) -> Result<()> {
        self.state.lock().unwrap().secrets = Some(secrets.clone());
        Ok(())
    }

    async fn load_mons(&self) -> Result<PersistedMons> {
        Ok(self.persisted())
    }

    async fn save_mons(&self, mons: &PersistedMons) -> Result<()> {
        self.state.lock().unwrap().mons = Some(mons.clone());
        Ok(())
    }

    async fn schedulable_nodes(&self) -> Result<Vec<String>> {
        Ok(self.nodes.clone())
    }

    async fn apply_mon(&self, name: &str, node: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.deployments.insert(name.to_string(), node.to_string());
        state.applied.push(name.to_string());
        let next = state.ips.len() + 1;
        state
            .ips
            .entry(name.to_string())
            .or_insert_with(|| format!("10.0.0.{next}"));
        Ok(())
    }

    async fn mon_pod_ip(&self, name: &str) -> Result<Option<String>> {
        let ip = {
            let state = self.state.lock().unwrap();
            if state.held.contains(name) || !state.deployments.contains_key(name) {
                return Ok(None);
            }
            state.ips.get(name).cloned()
        };
        // a ready pod has joined the mon map
        self.ceph.mon_started(name);
        Ok(ip)
    }

    async fn remove_mon(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.deployments.remove(name);
        state.removed.push(name.to_string());
        Ok(())
    }

    async fn set_template(&self, template: MonParams) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.template.as_ref() == Some(&template) {
            return false;
        }
        state.template = Some(template);
        true
    }
}

/// Named string maps held in memory.
#[derive(Default)]
pub struct MemoryKvStore {
    stores: Mutex<BTreeMap<String, BTreeMap<String, String>>>,
}

impl MemoryKvStore {
    pub fn store(&self, store: &str) -> Option<BTreeMap<String, String>> {
        self.stores.lock().unwrap().get(store).cloned()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, store: &str, key: &str) -> Result<String> {
        self.stores
            .lock()
            .unwrap()
            .get(store)
            .and_then(|s| s.get(key).cloned())
            .ok_or_else(|| Error::NotFound(format!("key {key} in store {store}")))
    }

    async fn set(&self, store: &str, key: &str, value: &str) -> Result<()> {
        self.stores
            .lock()
            .unwrap()
            .entry(store.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, store: &str, key: &str) -> Result<()> {
        if let Some(s) = self.stores.lock().unwrap().get_mut(store) {
            s.remove(key);
        }
        Ok(())
    }

    async fn list(&self, store: &str) -> Result<BTreeMap<String, String>> {
        self.store(store)
            .ok_or_else(|| Error::NotFound(format!("store {store}")))
    }

    async fn delete_store(&self, store: &str) -> Result<()> {
        self.stores.lock().unwrap().remove(store);
        Ok(())
    }
}

pub const GIB: u64 = 1 << 30;
pub const TIB: u64 = 1 << 40;

/// A backend status with `clean` of 100 placement groups active+clean.
pub fn pg_status(clean: u64) -> CephStatus {
    let mut pgs_by_state = vec![PgStateEntry {
        state_name: "active+clean".to_string(),
        count: clean,
    }];
    if clean < 100 {
        pgs_by_state.push(PgStateEntry {
            state_name: "active+degraded".to_string(),
            count: 100 - clean,
        });
    }
    CephStatus {
        pgmap: PgMap {
            pgs_by_state,
            num_pgs: 100,
            ..Default::default()
        },
    }
}

pub fn cluster_usage(avail_bytes: u64, total_bytes: u64) -> Usage {
    Usage {
        stats: UsageStats {
            total_bytes,
            total_used_bytes: total_bytes - avail_bytes,
            total_avail_bytes: avail_bytes,
        },
        pools: vec![],
    }
}

/// Per-osd usage from `(id, used bytes)` pairs.
pub fn osd_usage(osds: &[(i32, u64)]) -> OsdUsage {
    OsdUsage {
        nodes: osds
            .iter()
            .map(|(id, used)| OsdUsageEntry {
                id: *id,
                name: format!("osd.{id}"),
                kb_used: used / 1024,
                kb_avail: 0,
            })
            .collect(),
        summary: Default::default(),
    }
}

#[derive(Default)]
struct StatusState {
    statuses: BTreeMap<String, OrchestrationStatus>,
    outcomes: BTreeMap<String, OrchestrationStatus>,
    history: Vec<(String, NodeStatus)>,
}

/// Status map whose waits are answered as if the node's daemon ran to the
/// scripted outcome, `completed` unless told otherwise.
#[derive(Default)]
pub struct FakeStatusStore {
    state: Mutex<StatusState>,
}

impl FakeStatusStore {
    pub fn finish_with(&self, node: &str, status: OrchestrationStatus) {
        self.state.lock().unwrap().outcomes.insert(node.to_string(), status);
    }

    /// Leaves a status behind as an earlier run would have.
    pub fn seed(&self, node: &str, status: OrchestrationStatus) {
        self.state.lock().unwrap().statuses.insert(node.to_string(), status);
    }

    pub fn get(&self, node: &str) -> Option<OrchestrationStatus> {
        self.state.lock().unwrap().statuses.get(node).cloned()
    }

    /// Every status written for `node`, in order.
    pub fn history(&self, node: &str) -> Vec<NodeStatus> {
        self.state
            .lock()
            .unwrap()
            .history
            .iter()
            .filter(|(n, _)| n == node)
            .map(|(_, s)| *s)
            .collect()
    }
}

#[async_trait]
impl StatusStore for FakeStatusStore {
    async fn ensure(&self) -> Result<()> {
        Ok(())
    }

    async fn set(&self, node: &str, status: &OrchestrationStatus) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.history.push((node.to_string(), status.status));
        state.statuses.insert(node.to_string(), status.clone());
        Ok(())
    }

    async fn all(&self) -> Result<BTreeMap<String, OrchestrationStatus>> {
        Ok(self.state.lock().unwrap().statuses.clone())
    }

    async fn wait_terminal(&self, node: &str, cancel: &CancellationToken) -> Result<OrchestrationStatus> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let mut state = self.state.lock().unwrap();
        if let Some(current) = state.statuses.get(node) {
            if current.status.is_terminal() {
                return Ok(current.clone());
            }
        }
        let outcome = state
            .outcomes
            .get(node)
            .cloned()
            .unwrap_or_else(|| OrchestrationStatus::new(NodeStatus::Completed, "done"));
        state.history.push((node.to_string(), NodeStatus::Orchestrating));
        state.history.push((node.to_string(), outcome.status));
        state.statuses.insert(node.to_string(), outcome.clone());
        Ok(outcome)
    }
}

#[derive(Default)]
struct WorkloadState {
    deployments: BTreeMap<String, Deployment>,
    daemon_set: Option<DaemonSet>,
    failing: BTreeSet<String>,
    failing_updates: BTreeSet<String>,
    events: Vec<String>,
}

/// Osd deployments kept in a map, with every mutation recorded.
#[derive(Default)]
pub struct FakeOsdWorkloads {
    state: Mutex<WorkloadState>,
}

impl FakeOsdWorkloads {
    pub fn seed(&self, deployment: Deployment) {
        self.state
            .lock()
            .unwrap()
            .deployments
            .insert(deployment.name_any(), deployment);
    }

    /// Creating the deployment of `node` fails.
    pub fn fail_create(&self, node: &str) {
        self.state.lock().unwrap().failing.insert(node.to_string());
    }

    /// Updating the deployment of `node` fails.
    pub fn fail_update(&self, node: &str) {
        self.state.lock().unwrap().failing_updates.insert(node.to_string());
    }

    pub fn deployment(&self, node: &str) -> Option<Deployment> {
        self.state.lock().unwrap().deployments.get(&deployment_name(node)).cloned()
    }

    pub fn nodes(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .deployments
            .values()
            .filter_map(node_of_deployment)
            .collect()
    }

    pub fn daemon_set(&self) -> Option<DaemonSet> {
        self.state.lock().unwrap().daemon_set.clone()
    }

    pub fn events(&self) -> Vec<String> {
        self.state.lock().unwrap().events.clone()
    }
}

#[async_trait]
impl OsdWorkloads for FakeOsdWorkloads {
    async fn create(&self, deployment: &Deployment) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let name = deployment.name_any();
        if node_of_deployment(deployment).is_some_and(|n| state.failing.contains(&n)) {
            return Err(Error::Transient(format!("scripted failure creating {name}")));
        }
        if state.deployments.contains_key(&name) {
            return Ok(false);
        }
        state.events.push(format!("create {name}"));
        state.deployments.insert(name, deployment.clone());
        Ok(true)
    }

    async fn update(&self, deployment: &Deployment) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let name = deployment.name_any();
        if node_of_deployment(deployment).is_some_and(|n| state.failing_updates.contains(&n)) {
            return Err(Error::Transient(format!("scripted failure updating {name}")));
        }
        state.events.push(format!("update {name}"));
        state.deployments.insert(name, deployment.clone());
        Ok(())
    }

    async fn restart(&self, node: &str) -> Result<()> {
        self.state.lock().unwrap().events.push(format!("restart {node}"));
        Ok(())
    }

    async fn delete(&self, node: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let name = deployment_name(node);
        state.events.push(format!("delete {name}"));
        state.deployments.remove(&name);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Deployment>> {
        Ok(self.state.lock().unwrap().deployments.values().cloned().collect())
    }

    async fn apply_daemon_set(&self, daemon_set: &DaemonSet) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.events.push(format!("apply {}", daemon_set.name_any()));
        state.daemon_set = Some(daemon_set.clone());
        Ok(())
    }
}

#[derive(Default)]
struct AttachmentState {
    records: BTreeMap<String, AttachmentRecord>,
    version: u64,
    conflicts: usize,
    writes: usize,
    before_delete: Option<Attachment>,
}

/// Attachment records with resource versions checked on update and delete.
#[derive(Default)]
pub struct MemoryAttachmentStore {
    state: Mutex<AttachmentState>,
}

impl MemoryAttachmentStore {
    pub fn record(&self, volume: &str) -> Option<Vec<Attachment>> {
        self.state
            .lock()
            .unwrap()
            .records
            .get(volume)
            .map(|r| r.attachments.clone())
    }

    /// The next `n` updates fail as if another writer got there first.
    pub fn conflict_next(&self, n: usize) {
        self.state.lock().unwrap().conflicts = n;
    }

    pub fn writes(&self) -> usize {
        self.state.lock().unwrap().writes
    }

    /// Another node commits `attachment` right before the next delete lands.
    pub fn attach_before_next_delete(&self, attachment: Attachment) {
        self.state.lock().unwrap().before_delete = Some(attachment);
    }
}

#[async_trait]
impl AttachmentStore for MemoryAttachmentStore {
    async fn get(&self, volume: &str) -> Result<Option<AttachmentRecord>> {
        Ok(self.state.lock().unwrap().records.get(volume).cloned())
    }

    async fn create(&self, record: &AttachmentRecord) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.records.contains_key(&record.volume) {
            return Err(Error::Contended(format!("record {} exists", record.volume)));
        }
        state.version += 1;
        state.writes += 1;
        let mut stored = record.clone();
        stored.resource_version = Some(state.version.to_string());
        state.records.insert(record.volume.clone(), stored);
        Ok(())
    }

    async fn update(&self, record: &AttachmentRecord) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.conflicts > 0 {
            state.conflicts -= 1;
            state.version += 1;
            let version = state.version.to_string();
            if let Some(stored) = state.records.get_mut(&record.volume) {
                stored.resource_version = Some(version);
            }
            return Err(Error::Conflict(format!("attachment record {}", record.volume)));
        }
        let current = state
            .records
            .get(&record.volume)
            .ok_or_else(|| Error::NotFound(format!("attachment record {}", record.volume)))?;
        if current.resource_version != record.resource_version {
            return Err(Error::Conflict(format!("attachment record {}", record.volume)));
        }
        state.version += 1;
        state.writes += 1;
        let mut stored = record.clone();
        stored.resource_version = Some(state.version.to_string());
        state.records.insert(record.volume.clone(), stored);
        Ok(())
    }

    async fn delete(&self, record: &AttachmentRecord) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(attachment) = state.before_delete.take() {
            state.version += 1;
            let version = state.version.to_string();
            if let Some(stored) = state.records.get_mut(&record.volume) {
                stored.attachments.push(attachment);
                stored.resource_version = Some(version);
            }
        }
        let Some(current) = state.records.get(&record.volume) else {
            return Ok(());
        };
        if current.resource_version != record.resource_version {
            return Err(Error::Conflict(format!("attachment record {}", record.volume)));
        }
        state.writes += 1;
        state.records.remove(&record.volume);
        Ok(())
    }
}

/// Pods that exist, with their phase.
#[derive(Default)]
pub struct FakePods {
    pods: Mutex<BTreeMap<(String, String), String>>,
}

impl FakePods {
    pub fn running(&self, namespace: &str, name: &str) {
        self.pods
            .lock()
            .unwrap()
            .insert((namespace.to_string(), name.to_string()), "Running".to_string());
    }
}

#[async_trait]
impl PodLookup for FakePods {
    async fn pod_phase(&self, namespace: &str, name: &str) -> Result<Option<String>> {
        Ok(self
            .pods
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }
}

/// Records map and unmap calls as `cluster pool/image`.
#[derive(Default)]
pub struct FakeVolumes {
    attached: Mutex<Vec<String>>,
    detached: Mutex<Vec<String>>,
    fail_detach: Mutex<bool>,
}

impl FakeVolumes {
    pub fn attached(&self) -> Vec<String> {
        self.attached.lock().unwrap().clone()
    }

    pub fn detached(&self) -> Vec<String> {
        self.detached.lock().unwrap().clone()
    }

    pub fn fail_detach(&self) {
        *self.fail_detach.lock().unwrap() = true;
    }
}

#[async_trait]
impl VolumeBackend for FakeVolumes {
    async fn attach(&self, image: &str, pool: &str, cluster_name: &str) -> Result<String> {
        let mut attached = self.attached.lock().unwrap();
        attached.push(format!("{cluster_name} {pool}/{image}"));
        Ok(format!("/dev/rbd{}", attached.len() - 1))
    }

    async fn detach(&self, image: &str, pool: &str, cluster_name: &str, force: bool) -> Result<()> {
        if *self.fail_detach.lock().unwrap() {
            return Err(Error::command("rbd", &["unmap".to_string()], "device busy"));
        }
        let suffix = if force { " force" } else { "" };
        self.detached
            .lock()
            .unwrap()
            .push(format!("{cluster_name} {pool}/{image}{suffix}"));
        Ok(())
    }
}

#[derive(Default)]
struct DisruptionState {
    pools: Vec<PoolSpec>,
    locations: Vec<BTreeMap<String, String>>,
    canaries: BTreeMap<String, Canary>,
    pdbs: BTreeMap<String, PodDisruptionBudget>,
}

/// Pools, osd locations, canaries and budgets of one cluster namespace.
/// Canaries it creates start out ready.
#[derive(Default)]
pub struct FakeDisruptionHost {
    state: Mutex<DisruptionState>,
}

impl FakeDisruptionHost {
    pub fn set_pools(&self, pools: Vec<PoolSpec>) {
        self.state.lock().unwrap().pools = pools;
    }

    pub fn add_osd_host(&self, host: &str, zone: &str) {
        self.state.lock().unwrap().locations.push(BTreeMap::from([
            ("topology-location-host".to_string(), host.to_string()),
            ("topology-location-zone".to_string(), zone.to_string()),
        ]));
    }

    pub fn set_canary_ready(&self, node: &str, ready_replicas: i32, created: DateTime<Utc>) {
        self.state.lock().unwrap().canaries.insert(
            node.to_string(),
            Canary {
                node: node.to_string(),
                ready_replicas,
                created: Some(created),
            },
        );
    }

    pub fn canary_nodes(&self) -> Vec<String> {
        self.state.lock().unwrap().canaries.keys().cloned().collect()
    }

    pub fn pdb_names(&self) -> Vec<String> {
        self.state.lock().unwrap().pdbs.keys().cloned().collect()
    }
}

#[async_trait]
impl DisruptionHost for FakeDisruptionHost {
    async fn pool_specs(&self) -> Result<Vec<PoolSpec>> {
        Ok(self.state.lock().unwrap().pools.clone())
    }

    async fn osd_locations(&self) -> Result<Vec<BTreeMap<String, String>>> {
        Ok(self.state.lock().unwrap().locations.clone())
    }

    async fn canaries(&self) -> Result<Vec<Canary>> {
        Ok(self.state.lock().unwrap().canaries.values().cloned().collect())
    }

    async fn apply_canary(&self, canary: &Deployment) -> Result<()> {
        let node = canary
            .labels()
            .get("topology-location-host")
            .cloned()
            .ok_or_else(|| Error::InvalidSpec("canary without a host label".to_string()))?;
        self.state
            .lock()
            .unwrap()
            .canaries
            .entry(node.clone())
            .or_insert(Canary {
                node,
                ready_replicas: 1,
                created: Some(Utc::now()),
            });
        Ok(())
    }

    async fn delete_canary(&self, node: &str) -> Result<()> {
        self.state.lock().unwrap().canaries.remove(node);
        Ok(())
    }

    async fn pdbs(&self) -> Result<Vec<String>> {
        Ok(self.pdb_names())
    }

    async fn apply_pdb(&self, pdb: &PodDisruptionBudget) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .pdbs
            .insert(pdb.name_any(), pdb.clone());
        Ok(())
    }

    async fn delete_pdb(&self, name: &str) -> Result<()> {
        self.state.lock().unwrap().pdbs.remove(name);
        Ok(())
    }
}

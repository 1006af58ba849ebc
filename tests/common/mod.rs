//! Simulated node agents for integration tests
//!
//! Each node keeps its volumes, replication state, promoter configs and units
//! in memory. Tests inject failures per node and capability, or take a node
//! down entirely.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use sds_controller::common::{ControllerConfig, Error, Result};
use sds_controller::controller::agent_client::{
    ActiveNode, AgentConnector, AgentReply, AgentRequest, AgentTransport, LogicalVolume,
    PluginStatus, PoolCapacity as Capacity, ProbeReport, ReplicationStatus as LinkStatus,
    ServiceStatus as UnitStatus, ZfsEntry, ZfsKind,
};
use sds_controller::controller::placement::CreateRequest;
use sds_controller::controller::pools::PoolRequest;
use sds_controller::controller::records::{NodeRecord, PoolType, ResourceRecord, Role};
use sds_controller::controller::{ClusterContext, Services, StateStore};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Capacity each device adds to a volume group or copy-on-write pool
pub const DEVICE_GIB: u64 = 100;

#[derive(Debug, Clone)]
struct SimLv {
    size_gib: u64,
    origin: Option<String>,
    thin_pool: Option<String>,
    is_thin_pool: bool,
}

#[derive(Debug, Clone, Default)]
struct SimReplica {
    metadata: bool,
    up: bool,
    role: Role,
}

#[derive(Debug, Default)]
struct SimNode {
    vgs: BTreeMap<String, u64>,
    lvs: BTreeMap<(String, String), SimLv>,
    zpools: BTreeMap<String, u64>,
    datasets: BTreeMap<String, ZfsEntry>,
    replication_configs: BTreeMap<String, String>,
    replicas: BTreeMap<String, SimReplica>,
    promoter_configs: BTreeMap<String, String>,
    units: BTreeMap<String, String>,
    running: BTreeSet<String>,
    mounts: BTreeMap<String, String>,
    filesystems: BTreeMap<String, String>,
}

#[derive(Default)]
struct SimState {
    nodes: BTreeMap<String, SimNode>,
    down: BTreeSet<String>,
    failures: BTreeMap<(String, String), String>,
    stalls: BTreeSet<(String, String)>,
    /// plugin -> node the promoter runs it on
    active: BTreeMap<String, String>,
    calls: Vec<(String, AgentRequest)>,
}

type Outcome = std::result::Result<Value, String>;

fn unit() -> Outcome {
    Ok(Value::Null)
}

fn to_value<T: serde::Serialize>(value: T) -> Outcome {
    serde_json::to_value(value).map_err(|e| e.to_string())
}

fn plugin_of_path(path: &str) -> Option<String> {
    let file = path.rsplit('/').next()?;
    file.strip_suffix(".toml").map(str::to_string)
}

fn resource_of_plugin(plugin: &str) -> &str {
    plugin.strip_prefix("sds-ha-").unwrap_or(plugin)
}

impl SimNode {
    fn vg_used(&self, vg: &str) -> u64 {
        self.lvs
            .iter()
            .filter(|((v, _), lv)| v == vg && lv.thin_pool.is_none())
            .map(|(_, lv)| lv.size_gib)
            .sum()
    }

    fn thin_used(&self, vg: &str, pool: &str) -> u64 {
        self.lvs
            .iter()
            .filter(|((v, _), lv)| v == vg && lv.thin_pool.as_deref() == Some(pool))
            .map(|(_, lv)| lv.size_gib)
            .sum()
    }

    fn zpool_used(&self, pool: &str) -> u64 {
        let prefix = format!("{}/", pool);
        self.datasets
            .values()
            .filter(|d| d.kind == ZfsKind::Volume && d.name.starts_with(&prefix))
            .filter_map(|d| d.size_gib)
            .sum()
    }

    fn zpool_of(name: &str) -> &str {
        name.split(['/', '@']).next().unwrap_or(name)
    }

    fn require_zpool(&self, name: &str) -> std::result::Result<(), String> {
        let pool = Self::zpool_of(name);
        if self.zpools.contains_key(pool) {
            Ok(())
        } else {
            Err(format!("pool {} does not exist", pool))
        }
    }
}

/// In-memory cluster of node agents
#[derive(Clone, Default)]
pub struct SimCluster {
    state: Arc<Mutex<SimState>>,
}

impl SimCluster {
    pub fn new(nodes: &[&str]) -> Self {
        let sim = Self::default();
        {
            let mut state = sim.state.lock();
            for node in nodes {
                state.nodes.insert(node.to_string(), SimNode::default());
            }
        }
        sim
    }

    /// Make every call of `op` on `node` fail with `message`.
    pub fn fail(&self, node: &str, op: &str, message: &str) {
        self.state
            .lock()
            .failures
            .insert((node.to_string(), op.to_string()), message.to_string());
    }

    pub fn heal(&self, node: &str, op: &str) {
        self.state.lock().failures.remove(&(node.to_string(), op.to_string()));
    }

    /// Make every call of `op` on `node` hang until its deadline.
    pub fn stall(&self, node: &str, op: &str) {
        self.state.lock().stalls.insert((node.to_string(), op.to_string()));
    }

    pub fn unstall(&self, node: &str, op: &str) {
        self.state.lock().stalls.remove(&(node.to_string(), op.to_string()));
    }

    pub fn set_down(&self, node: &str, down: bool) {
        let mut state = self.state.lock();
        if down {
            state.down.insert(node.to_string());
        } else {
            state.down.remove(node);
        }
    }

    /// Number of calls of `op` sent to `node`
    pub fn calls(&self, node: &str, op: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|(n, r)| n == node && r.capability() == op)
            .count()
    }

    /// Number of promote calls sent to `node` with force set
    pub fn forced_promotes(&self, node: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|(n, r)| n == node && matches!(r, AgentRequest::ReplicationPromote { force: true, .. }))
            .count()
    }

    pub fn has_lv(&self, node: &str, vg: &str, name: &str) -> bool {
        self.state
            .lock()
            .nodes
            .get(node)
            .map(|n| n.lvs.contains_key(&(vg.to_string(), name.to_string())))
            .unwrap_or(false)
    }

    pub fn has_dataset(&self, node: &str, name: &str) -> bool {
        self.state
            .lock()
            .nodes
            .get(node)
            .map(|n| n.datasets.contains_key(name))
            .unwrap_or(false)
    }

    pub fn replication_config(&self, node: &str, resource: &str) -> Option<String> {
        self.state
            .lock()
            .nodes
            .get(node)
            .and_then(|n| n.replication_configs.get(resource).cloned())
    }

    pub fn replica_up(&self, node: &str, resource: &str) -> bool {
        self.state
            .lock()
            .nodes
            .get(node)
            .and_then(|n| n.replicas.get(resource))
            .map(|r| r.up)
            .unwrap_or(false)
    }

    pub fn role(&self, node: &str, resource: &str) -> Role {
        self.state
            .lock()
            .nodes
            .get(node)
            .and_then(|n| n.replicas.get(resource))
            .map(|r| r.role)
            .unwrap_or_default()
    }

    pub fn promoter_config(&self, node: &str, path: &str) -> Option<String> {
        self.state
            .lock()
            .nodes
            .get(node)
            .and_then(|n| n.promoter_configs.get(path).cloned())
    }

    pub fn unit(&self, node: &str, unit: &str) -> Option<String> {
        self.state
            .lock()
            .nodes
            .get(node)
            .and_then(|n| n.units.get(unit).cloned())
    }

    pub fn service_running(&self, node: &str, unit: &str) -> bool {
        self.state
            .lock()
            .nodes
            .get(node)
            .map(|n| n.running.contains(unit))
            .unwrap_or(false)
    }

    pub fn active_node(&self, resource: &str) -> Option<String> {
        self.state
            .lock()
            .active
            .get(&format!("sds-ha-{}", resource))
            .cloned()
    }

    /// Drop a replica's disk state to simulate a lagging peer.
    pub fn set_replica_up(&self, node: &str, resource: &str, up: bool) {
        if let Some(n) = self.state.lock().nodes.get_mut(node) {
            n.replicas.entry(resource.to_string()).or_default().up = up;
        }
    }
}

impl AgentConnector for SimCluster {
    fn connect(&self, node: &NodeRecord) -> Arc<dyn AgentTransport> {
        Arc::new(SimAgent {
            node: node.name.clone(),
            state: Arc::clone(&self.state),
        })
    }
}

struct SimAgent {
    node: String,
    state: Arc<Mutex<SimState>>,
}

#[async_trait]
impl AgentTransport for SimAgent {
    async fn call(&self, request: &AgentRequest, deadline: Duration) -> Result<AgentReply> {
        let op = request.capability();
        let stalled = {
            let mut state = self.state.lock();
            state.calls.push((self.node.clone(), request.clone()));
            if state.down.contains(&self.node) {
                return Err(Error::Unreachable {
                    node: self.node.clone(),
                    message: "connection refused".into(),
                });
            }
            if let Some(message) = state.failures.get(&(self.node.clone(), op.clone())) {
                return Ok(AgentReply::fail(message.clone()));
            }
            state.stalls.contains(&(self.node.clone(), op))
        };
        if stalled {
            tokio::time::sleep(deadline + Duration::from_secs(1)).await;
        }

        let mut state = self.state.lock();
        match apply(&mut state, &self.node, request) {
            Ok(payload) => Ok(AgentReply::ok(payload)),
            Err(message) => Ok(AgentReply::fail(message)),
        }
    }
}

fn apply(state: &mut SimState, node: &str, request: &AgentRequest) -> Outcome {
    use AgentRequest::*;

    if let PromoterReload { .. } = request {
        reconcile_promoter(state);
        return unit();
    }
    if let PromoterActiveNode { plugin } = request {
        let hosted = state
            .nodes
            .get(node)
            .map(|n| n.promoter_configs.keys().any(|p| plugin_of_path(p).as_deref() == Some(plugin)))
            .unwrap_or(false);
        let active = if hosted { state.active.get(plugin).cloned() } else { None };
        return to_value(ActiveNode { node: active });
    }
    if let PromoterStatus { plugin } = request {
        let active = state.active.get(plugin).cloned();
        return to_value(PluginStatus {
            running: active.is_some(),
            active_node: active,
            message: None,
        });
    }
    if let PromoterEvict { plugin } = request {
        return evict(state, node, plugin);
    }
    if let ReplicationStatus { resource } = request {
        return replication_status(state, node, resource);
    }
    if let ReplicationPromote { resource, force } = request {
        let other_primary = state.nodes.iter().any(|(name, n)| {
            name != node
                && !state.down.contains(name)
                && n.replicas.get(resource).map(|r| r.up && r.role == Role::Primary).unwrap_or(false)
        });
        if other_primary && !force {
            return Err(format!("{}: peer is already Primary", resource));
        }
    }

    let sim = state
        .nodes
        .get_mut(node)
        .ok_or_else(|| format!("node {} not found", node))?;

    match request {
        Probe => to_value(ProbeReport {
            hostname: Some(node.to_string()),
            replication_version: Some("9.2.8".into()),
            replication_loaded: true,
            promoter_version: Some("3.0.0".into()),
            promoter_running: true,
            agent_pack_installed: true,
            agents: vec!["ocf:heartbeat:IPaddr2".into(), "ocf:heartbeat:Filesystem".into()],
            zfs_available: true,
        }),

        // === Volume manager ===
        LvCreate { vg, name, size_gib, thin_pool } => {
            if !sim.vgs.contains_key(vg) {
                return Err(format!("volume group {} not found", vg));
            }
            if sim.lvs.contains_key(&(vg.clone(), name.clone())) {
                return Err(format!("logical volume {}/{} already exists", vg, name));
            }
            match thin_pool {
                Some(pool) => {
                    if !sim.lvs.get(&(vg.clone(), pool.clone())).map(|lv| lv.is_thin_pool).unwrap_or(false) {
                        return Err(format!("thin pool {}/{} not found", vg, pool));
                    }
                }
                None => {
                    let free = sim.vgs[vg].saturating_sub(sim.vg_used(vg));
                    if *size_gib > free {
                        return Err(format!("insufficient free space in {}: {} GiB left", vg, free));
                    }
                }
            }
            sim.lvs.insert(
                (vg.clone(), name.clone()),
                SimLv {
                    size_gib: *size_gib,
                    origin: None,
                    thin_pool: thin_pool.clone(),
                    is_thin_pool: false,
                },
            );
            unit()
        }
        LvRemove { vg, name } | LvSnapshotRemove { vg, name } => sim
            .lvs
            .remove(&(vg.clone(), name.clone()))
            .map(|_| Value::Null)
            .ok_or_else(|| format!("logical volume {}/{} not found", vg, name)),
        LvExtend { vg, name, size_gib } => match sim.lvs.get_mut(&(vg.clone(), name.clone())) {
            Some(lv) => {
                lv.size_gib = *size_gib;
                unit()
            }
            None => Err(format!("logical volume {}/{} not found", vg, name)),
        },
        LvList { vg } => {
            if !sim.vgs.contains_key(vg) {
                return Err(format!("volume group {} not found", vg));
            }
            let volumes: Vec<LogicalVolume> = sim
                .lvs
                .iter()
                .filter(|((v, _), _)| v == vg)
                .map(|((v, n), lv)| LogicalVolume {
                    name: n.clone(),
                    vg: v.clone(),
                    size_gib: lv.size_gib,
                    origin: lv.origin.clone(),
                })
                .collect();
            to_value(volumes)
        }
        VgCreate { name, devices } => {
            if sim.vgs.contains_key(name) {
                return Err(format!("volume group {} already exists", name));
            }
            sim.vgs.insert(name.clone(), DEVICE_GIB * devices.len() as u64);
            unit()
        }
        VgRemove { name } => sim
            .vgs
            .remove(name)
            .map(|_| Value::Null)
            .ok_or_else(|| format!("volume group {} not found", name)),
        VgExtend { name, devices } => match sim.vgs.get_mut(name) {
            Some(total) => {
                *total += DEVICE_GIB * devices.len() as u64;
                unit()
            }
            None => Err(format!("volume group {} not found", name)),
        },
        ThinPoolCreate { vg, name, size_gib } => {
            if !sim.vgs.contains_key(vg) {
                return Err(format!("volume group {} not found", vg));
            }
            let free = sim.vgs[vg].saturating_sub(sim.vg_used(vg));
            if *size_gib > free {
                return Err(format!("insufficient free space in {}", vg));
            }
            sim.lvs.insert(
                (vg.clone(), name.clone()),
                SimLv {
                    size_gib: *size_gib,
                    origin: None,
                    thin_pool: None,
                    is_thin_pool: true,
                },
            );
            unit()
        }
        ThinPoolRemove { vg, name } => sim
            .lvs
            .remove(&(vg.clone(), name.clone()))
            .map(|_| Value::Null)
            .ok_or_else(|| format!("thin pool {}/{} not found", vg, name)),
        PoolCapacity { pool_type, name } => {
            let capacity = match pool_type {
                PoolType::VolumeGroup => {
                    let total = *sim.vgs.get(name).ok_or_else(|| format!("volume group {} not found", name))?;
                    Capacity {
                        total_gib: total,
                        free_gib: total.saturating_sub(sim.vg_used(name)),
                    }
                }
                PoolType::ThinPool => {
                    let (vg, pool) = name.split_once('/').ok_or_else(|| format!("thin pool {} not found", name))?;
                    let total = sim
                        .lvs
                        .get(&(vg.to_string(), pool.to_string()))
                        .filter(|lv| lv.is_thin_pool)
                        .map(|lv| lv.size_gib)
                        .ok_or_else(|| format!("thin pool {} not found", name))?;
                    Capacity {
                        total_gib: total,
                        free_gib: total.saturating_sub(sim.thin_used(vg, pool)),
                    }
                }
                PoolType::CopyOnWritePool => {
                    let total = *sim.zpools.get(name).ok_or_else(|| format!("pool {} does not exist", name))?;
                    Capacity {
                        total_gib: total,
                        free_gib: total.saturating_sub(sim.zpool_used(name)),
                    }
                }
            };
            to_value(capacity)
        }
        LvSnapshotCreate { vg, origin, name, size_gib } => {
            let thin_pool = match sim.lvs.get(&(vg.clone(), origin.clone())) {
                Some(lv) => lv.thin_pool.clone(),
                None => return Err(format!("origin {}/{} not found", vg, origin)),
            };
            if sim.lvs.contains_key(&(vg.clone(), name.clone())) {
                return Err(format!("logical volume {}/{} already exists", vg, name));
            }
            sim.lvs.insert(
                (vg.clone(), name.clone()),
                SimLv {
                    size_gib: *size_gib,
                    origin: Some(origin.clone()),
                    thin_pool,
                    is_thin_pool: false,
                },
            );
            unit()
        }
        LvSnapshotMerge { vg, name } => sim
            .lvs
            .remove(&(vg.clone(), name.clone()))
            .filter(|lv| lv.origin.is_some())
            .map(|_| Value::Null)
            .ok_or_else(|| format!("snapshot {}/{} not found", vg, name)),

        // === Replication driver ===
        ReplicationWriteConfig { resource, content } => {
            sim.replication_configs.insert(resource.clone(), content.clone());
            unit()
        }
        ReplicationDeleteConfig { resource } => {
            sim.replicas.remove(resource);
            sim.replication_configs
                .remove(resource)
                .map(|_| Value::Null)
                .ok_or_else(|| format!("resource {} not found", resource))
        }
        ReplicationCreateMd { resource, .. } => {
            if !sim.replication_configs.contains_key(resource) {
                return Err(format!("resource {} not found", resource));
            }
            sim.replicas.entry(resource.clone()).or_default().metadata = true;
            unit()
        }
        ReplicationUp { resource } => {
            if !sim.replication_configs.contains_key(resource) {
                return Err(format!("resource {} not found", resource));
            }
            let replica = sim.replicas.entry(resource.clone()).or_default();
            if !replica.metadata {
                return Err(format!("{}: no metadata on backing device", resource));
            }
            replica.up = true;
            if replica.role == Role::Unknown {
                replica.role = Role::Secondary;
            }
            unit()
        }
        ReplicationDown { resource } => {
            if let Some(replica) = sim.replicas.get_mut(resource) {
                replica.up = false;
                replica.role = Role::Unknown;
            }
            unit()
        }
        ReplicationPromote { resource, .. } => match sim.replicas.get_mut(resource) {
            Some(replica) if replica.up => {
                replica.role = Role::Primary;
                unit()
            }
            _ => Err(format!("resource {} not found", resource)),
        },
        ReplicationDemote { resource } => match sim.replicas.get_mut(resource) {
            Some(replica) if replica.up => {
                replica.role = Role::Secondary;
                unit()
            }
            _ => Err(format!("resource {} not found", resource)),
        },
        ReplicationAdjust { resource } | ReplicationResize { resource, .. } => {
            if sim.replication_configs.contains_key(resource) {
                unit()
            } else {
                Err(format!("resource {} not found", resource))
            }
        }
        ReplicationStatus { .. } => unreachable!("handled above"),

        // === Filesystem / mount ===
        FsFormat { device, fstype } => {
            sim.filesystems.insert(device.clone(), fstype.clone());
            unit()
        }
        FsGrow { device, .. } => {
            if sim.filesystems.contains_key(device) {
                unit()
            } else {
                Err(format!("no filesystem found on {}", device))
            }
        }
        Mount { device, path, .. } => {
            if sim.mounts.contains_key(path) {
                return Err(format!("{} is already mounted", path));
            }
            sim.mounts.insert(path.clone(), device.clone());
            unit()
        }
        Unmount { path } => sim
            .mounts
            .remove(path)
            .map(|_| Value::Null)
            .ok_or_else(|| format!("{} not found in mount table", path)),

        // === Promoter daemon ===
        PromoterWriteConfig { path, content, .. } => {
            sim.promoter_configs.insert(path.clone(), content.clone());
            unit()
        }
        PromoterReadConfig { path } => sim
            .promoter_configs
            .get(path)
            .map(|c| Value::String(c.clone()))
            .ok_or_else(|| format!("{} not found", path)),
        PromoterDeleteConfig { path } => sim
            .promoter_configs
            .remove(path)
            .map(|_| Value::Null)
            .ok_or_else(|| format!("{}: no such file", path)),
        PromoterReload { .. } | PromoterStatus { .. } | PromoterActiveNode { .. } | PromoterEvict { .. } => {
            unreachable!("handled above")
        }

        // === Copy-on-write backend ===
        ZfsPoolCreate { name, devices } => {
            if sim.zpools.contains_key(name) {
                return Err(format!("pool {} already exists", name));
            }
            let total = DEVICE_GIB * devices.len() as u64;
            sim.zpools.insert(name.clone(), total);
            sim.datasets.insert(
                name.clone(),
                ZfsEntry {
                    name: name.clone(),
                    kind: ZfsKind::Pool,
                    size_gib: Some(total),
                    properties: BTreeMap::new(),
                },
            );
            unit()
        }
        ZfsPoolDestroy { name } => {
            if sim.zpools.remove(name).is_none() {
                return Err(format!("pool {} does not exist", name));
            }
            sim.datasets.retain(|n, _| SimNode::zpool_of(n) != name);
            unit()
        }
        ZfsPoolAdd { name, devices } => match sim.zpools.get_mut(name) {
            Some(total) => {
                *total += DEVICE_GIB * devices.len() as u64;
                unit()
            }
            None => Err(format!("pool {} does not exist", name)),
        },
        ZfsDatasetCreate { name, properties } => {
            sim.require_zpool(name)?;
            if sim.datasets.contains_key(name) {
                return Err(format!("dataset {} already exists", name));
            }
            sim.datasets.insert(
                name.clone(),
                ZfsEntry {
                    name: name.clone(),
                    kind: ZfsKind::Filesystem,
                    size_gib: None,
                    properties: properties.clone(),
                },
            );
            unit()
        }
        ZfsDatasetDestroy { name, recursive } => {
            if !sim.datasets.contains_key(name) {
                return Err(format!("dataset {} does not exist", name));
            }
            let child = |n: &String| n.starts_with(&format!("{}/", name)) || n.starts_with(&format!("{}@", name));
            if !recursive && sim.datasets.keys().any(child) {
                return Err(format!("cannot destroy {}: filesystem has children", name));
            }
            sim.datasets.retain(|n, _| n != name && !child(n));
            unit()
        }
        ZfsVolumeCreate { name, size_gib } => {
            sim.require_zpool(name)?;
            if sim.datasets.contains_key(name) {
                return Err(format!("dataset {} already exists", name));
            }
            let pool = SimNode::zpool_of(name);
            let free = sim.zpools[pool].saturating_sub(sim.zpool_used(pool));
            if *size_gib > free {
                return Err(format!("insufficient space in {}", pool));
            }
            sim.datasets.insert(
                name.clone(),
                ZfsEntry {
                    name: name.clone(),
                    kind: ZfsKind::Volume,
                    size_gib: Some(*size_gib),
                    properties: BTreeMap::new(),
                },
            );
            unit()
        }
        ZfsVolumeDestroy { name } => {
            if sim.datasets.remove(name).is_none() {
                return Err(format!("dataset {} does not exist", name));
            }
            let snapshots = format!("{}@", name);
            sim.datasets.retain(|n, _| !n.starts_with(&snapshots));
            unit()
        }
        ZfsVolumeExtend { name, size_gib } => match sim.datasets.get_mut(name) {
            Some(entry) => {
                entry.size_gib = Some(*size_gib);
                unit()
            }
            None => Err(format!("dataset {} does not exist", name)),
        },
        ZfsList { kind, root } => {
            let entries: Vec<ZfsEntry> = sim
                .datasets
                .values()
                .filter(|d| d.kind == *kind)
                .filter(|d| match root {
                    Some(root) => {
                        d.name == *root
                            || d.name.starts_with(&format!("{}/", root))
                            || d.name.starts_with(&format!("{}@", root))
                    }
                    None => true,
                })
                .cloned()
                .collect();
            to_value(entries)
        }
        ZfsSnapshotCreate { dataset, name } => {
            if !sim.datasets.contains_key(dataset) {
                return Err(format!("dataset {} does not exist", dataset));
            }
            let full = format!("{}@{}", dataset, name);
            if sim.datasets.contains_key(&full) {
                return Err(format!("snapshot {} already exists", full));
            }
            sim.datasets.insert(
                full.clone(),
                ZfsEntry {
                    name: full,
                    kind: ZfsKind::Snapshot,
                    size_gib: None,
                    properties: BTreeMap::new(),
                },
            );
            unit()
        }
        ZfsSnapshotDestroy { dataset, name } => sim
            .datasets
            .remove(&format!("{}@{}", dataset, name))
            .map(|_| Value::Null)
            .ok_or_else(|| format!("snapshot {}@{} does not exist", dataset, name)),
        ZfsRollback { dataset, name } => {
            if sim.datasets.contains_key(&format!("{}@{}", dataset, name)) {
                unit()
            } else {
                Err(format!("snapshot {}@{} does not exist", dataset, name))
            }
        }
        ZfsClone { dataset, snapshot, target } => {
            if !sim.datasets.contains_key(&format!("{}@{}", dataset, snapshot)) {
                return Err(format!("snapshot {}@{} does not exist", dataset, snapshot));
            }
            let size_gib = sim.datasets.get(dataset).and_then(|d| d.size_gib);
            sim.datasets.insert(
                target.clone(),
                ZfsEntry {
                    name: target.clone(),
                    kind: ZfsKind::Volume,
                    size_gib,
                    properties: BTreeMap::new(),
                },
            );
            unit()
        }

        // === Service manager ===
        UnitCreate { unit: name, content } => {
            sim.units.insert(name.clone(), content.clone());
            unit()
        }
        UnitDelete { unit: name } => {
            sim.running.remove(name);
            sim.units
                .remove(name)
                .map(|_| Value::Null)
                .ok_or_else(|| format!("unit {} not found", name))
        }
        ServiceStart { unit: name } => {
            if !sim.units.contains_key(name) {
                return Err(format!("unit {} not found", name));
            }
            sim.running.insert(name.clone());
            unit()
        }
        ServiceStop { unit: name } => {
            sim.running.remove(name);
            unit()
        }
        ServiceEnable { unit: name } | ServiceDisable { unit: name } => {
            if sim.units.contains_key(name) {
                unit()
            } else {
                Err(format!("unit {} not found", name))
            }
        }
        ServiceStatus { unit: name } => {
            let active = sim.running.contains(name);
            to_value(UnitStatus {
                active,
                enabled: sim.units.contains_key(name),
                state: if active { "active".into() } else { "inactive".into() },
            })
        }
    }
}

fn replication_status(state: &SimState, node: &str, resource: &str) -> Outcome {
    let sim = state
        .nodes
        .get(node)
        .ok_or_else(|| format!("node {} not found", node))?;
    if !sim.replication_configs.contains_key(resource) {
        return Err(format!("resource {} not found", resource));
    }
    let replica = sim.replicas.get(resource).cloned().unwrap_or_default();
    let peers = state
        .nodes
        .iter()
        .filter(|(name, _)| name.as_str() != node && !state.down.contains(*name))
        .filter_map(|(name, n)| {
            n.replicas
                .get(resource)
                .filter(|r| r.up)
                .map(|r| (name.clone(), r.role))
        })
        .collect();
    to_value(LinkStatus {
        role: if replica.up { replica.role } else { Role::Unknown },
        disk_state: Some(if replica.up { "UpToDate" } else { "Diskless" }.to_string()),
        replication_state: Some(if replica.up { "Established" } else { "StandAlone" }.to_string()),
        peers,
    })
}

/// Start plugins that gained a config and stop those that lost every config.
fn reconcile_promoter(state: &mut SimState) {
    let mut hosts: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, node) in &state.nodes {
        if state.down.contains(name) {
            continue;
        }
        for path in node.promoter_configs.keys() {
            if let Some(plugin) = plugin_of_path(path) {
                hosts.entry(plugin).or_default().push(name.clone());
            }
        }
    }

    let stopped: Vec<String> = state
        .active
        .keys()
        .filter(|p| !hosts.contains_key(*p))
        .cloned()
        .collect();
    for plugin in stopped {
        if let Some(node) = state.active.remove(&plugin) {
            set_role(state, &node, resource_of_plugin(&plugin), Role::Secondary);
        }
    }

    for (plugin, nodes) in hosts {
        if state.active.contains_key(&plugin) {
            continue;
        }
        let resource = resource_of_plugin(&plugin).to_string();
        let candidate = nodes.into_iter().find(|n| {
            state.nodes[n]
                .replicas
                .get(&resource)
                .map(|r| r.up)
                .unwrap_or(false)
        });
        if let Some(node) = candidate {
            set_role(state, &node, &resource, Role::Primary);
            state.active.insert(plugin, node);
        }
    }
}

fn set_role(state: &mut SimState, node: &str, resource: &str, role: Role) {
    if let Some(replica) = state.nodes.get_mut(node).and_then(|n| n.replicas.get_mut(resource)) {
        if replica.up {
            replica.role = role;
        }
    }
}

fn evict(state: &mut SimState, node: &str, plugin: &str) -> Outcome {
    if state.active.get(plugin).map(String::as_str) != Some(node) {
        return Err(format!("{} is not active on {}", plugin, node));
    }
    let resource = resource_of_plugin(plugin).to_string();
    let target = state
        .nodes
        .iter()
        .filter(|(name, _)| name.as_str() != node && !state.down.contains(*name))
        .filter(|(_, n)| {
            n.promoter_configs.keys().any(|p| plugin_of_path(p).as_deref() == Some(plugin))
                && n.replicas.get(&resource).map(|r| r.up).unwrap_or(false)
        })
        .map(|(name, _)| name.clone())
        .next()
        .ok_or_else(|| format!("{}: no eligible peer", plugin))?;

    set_role(state, node, &resource, Role::Secondary);
    set_role(state, &target, &resource, Role::Primary);
    state.active.insert(plugin.to_string(), target);
    unit()
}

/// Controller services wired to a simulated cluster
pub struct Harness {
    pub sim: SimCluster,
    pub services: Arc<Services>,
    pub ctx: Arc<ClusterContext>,
    pub shutdown: CancellationToken,
}

pub fn test_config() -> ControllerConfig {
    let mut config = ControllerConfig::default();
    config.health.failure_threshold = 1;
    config.workflows.timeouts.poll_interval_ms = 10;
    config.workflows.timeouts.sync_wait_secs = 2;
    config.workflows.timeouts.evict_secs = 2;
    config.workflows.timeouts.rpc_secs = 1;
    config.promoter_config_dir = "/etc/sds/promoter".into();
    config
}

impl Harness {
    /// Register `nodes` and give each a 100 GiB volume group `vg0`.
    pub async fn new(nodes: &[&str]) -> Self {
        Self::with_store(nodes, Arc::new(StateStore::in_memory())).await
    }

    pub async fn with_store(nodes: &[&str], store: Arc<StateStore>) -> Self {
        let sim = SimCluster::new(nodes);
        let harness = Self::connect(sim, store, test_config());
        for (i, node) in nodes.iter().enumerate() {
            harness
                .services
                .ctx
                .registry
                .register(node, &format!("10.0.0.{}", i + 1), None)
                .await
                .unwrap();
            harness
                .services
                .pools
                .create(PoolRequest {
                    node: node.to_string(),
                    name: "vg0".into(),
                    pool_type: PoolType::VolumeGroup,
                    devices: vec!["/dev/sdb".into()],
                    volume_group: None,
                    size_gib: None,
                })
                .await
                .unwrap();
        }
        harness
    }

    /// Attach fresh services to an existing simulated cluster and store.
    pub fn connect(sim: SimCluster, store: Arc<StateStore>, config: ControllerConfig) -> Self {
        let shutdown = CancellationToken::new();
        let connector: Arc<dyn AgentConnector> = Arc::new(sim.clone());
        let ctx = ClusterContext::new(Arc::new(config), store, connector, shutdown.clone());
        let services = Services::new(Arc::clone(&ctx));
        Self {
            sim,
            services,
            ctx,
            shutdown,
        }
    }

    pub async fn create(&self, name: &str, nodes: &[&str], size_gib: u64) -> Result<ResourceRecord> {
        self.create_in(name, nodes, "vg0", size_gib).await
    }

    pub async fn create_in(&self, name: &str, nodes: &[&str], pool: &str, size_gib: u64) -> Result<ResourceRecord> {
        let nodes: Vec<String> = nodes.iter().map(|n| n.to_string()).collect();
        self.services
            .orchestrator
            .create_resource(create_request(name, &nodes, pool, size_gib))
            .await
    }

    /// Add a pool of `pool_type` named `name` to every node in `nodes`.
    pub async fn add_pool(&self, nodes: &[&str], name: &str, pool_type: PoolType) {
        for node in nodes {
            let (devices, volume_group, size_gib) = match pool_type {
                PoolType::ThinPool => (Vec::new(), Some("vg0".to_string()), Some(50)),
                _ => (vec!["/dev/sdc".to_string()], None, None),
            };
            self.services
                .pools
                .create(PoolRequest {
                    node: node.to_string(),
                    name: name.into(),
                    pool_type,
                    devices,
                    volume_group,
                    size_gib,
                })
                .await
                .unwrap();
        }
    }

    pub fn free_gib(&self, node: &str) -> u64 {
        self.services.pools.get(node, "vg0").unwrap().free_gib
    }
}

pub fn create_request(name: &str, nodes: &[String], pool: &str, size_gib: u64) -> CreateRequest {
    CreateRequest {
        name: name.into(),
        port: None,
        nodes: nodes.to_vec(),
        protocol: Default::default(),
        pool: pool.into(),
        size_gib,
        options: BTreeMap::new(),
    }
}

pub fn payload(value: &Value, key: &str) -> Value {
    value.get(key).cloned().unwrap_or_else(|| json!(null))
}

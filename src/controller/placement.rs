//! Placement and validation
//!
//! Turns a request plus a snapshot of cluster state into a concrete plan, or
//! rejects it before anything touches a node. Capacity promised to in-flight
//! workflows is held in a [`CapacityLedger`] until the workflow commits or
//! gives up.

use super::records::{
    keys, NodeLiveness, NodeRecord, PoolRecord, PoolType, Protocol, ResourceRecord, StorageKind,
    VolumeRecord,
};
use super::store::StateStore;
use crate::common::{validate_object_name, Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Map;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

pub const MIN_PORT: u32 = 1024;
pub const MAX_PORT: u32 = 65535;
pub const AUTO_PORT_BASE: u16 = 7000;
pub const MINOR_BASE: u32 = 1000;

/// Consistent read of everything placement looks at
#[derive(Debug, Clone, Default)]
pub struct ClusterView {
    pub nodes: BTreeMap<String, NodeRecord>,
    /// (node, pool name) -> pool
    pub pools: BTreeMap<(String, String), PoolRecord>,
    pub resources: BTreeMap<String, ResourceRecord>,
    /// Minors promised to volumes not yet recorded on their resource
    pub pending_minors: BTreeSet<u32>,
}

impl ClusterView {
    pub fn load(store: &StateStore) -> Result<Self> {
        let nodes = store
            .list_as::<NodeRecord>(keys::NODES)?
            .into_iter()
            .map(|(n, _)| (n.name.clone(), n))
            .collect();
        let pools = store
            .list_as::<PoolRecord>(keys::POOLS)?
            .into_iter()
            .map(|(p, _)| ((p.node.clone(), p.name.clone()), p))
            .collect();
        let resources = store
            .list_as::<ResourceRecord>(keys::RESOURCES)?
            .into_iter()
            .map(|(r, _)| (r.name.clone(), r))
            .collect();
        Ok(Self {
            nodes,
            pools,
            resources,
            pending_minors: BTreeSet::new(),
        })
    }

    pub fn pool(&self, node: &str, pool: &str) -> Option<&PoolRecord> {
        self.pools.get(&(node.to_string(), pool.to_string()))
    }

    fn used_ports(&self) -> BTreeSet<u16> {
        self.resources.values().map(|r| r.port).collect()
    }

    fn used_minors(&self) -> BTreeSet<u32> {
        self.resources
            .values()
            .flat_map(|r| r.volumes.iter().map(|v| v.minor))
            .chain(self.pending_minors.iter().copied())
            .collect()
    }
}

/// Request to create a resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRequest {
    pub name: String,
    /// Wider than u16 so out-of-range input is reported, not truncated
    #[serde(default)]
    pub port: Option<u32>,
    pub nodes: Vec<String>,
    #[serde(default)]
    pub protocol: Protocol,
    pub pool: String,
    pub size_gib: u64,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

/// Where a resource's backing volumes live, identical on every node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackingTarget {
    pub storage: StorageKind,
    pub pool_type: PoolType,
    pub pool: String,
    /// VG name or zfs pool name the tool addresses
    pub container: String,
    /// `/dev/<vg>` or `/dev/zvol/<pool>`
    pub root: String,
    /// Thin pool LV when allocating thinly
    pub thin_pool: Option<String>,
}

impl BackingTarget {
    pub fn from_pool(pool: &PoolRecord) -> Self {
        Self {
            storage: pool.pool_type.storage_kind(),
            pool_type: pool.pool_type,
            pool: pool.name.clone(),
            container: pool.container().to_string(),
            root: pool.backing_root(),
            thin_pool: match pool.pool_type {
                PoolType::ThinPool => Some(pool.name.clone()),
                _ => None,
            },
        }
    }

    pub fn device_for(&self, resource: &str, id: u32) -> String {
        format!("{}/{}", self.root, VolumeRecord::lv_name(resource, id))
    }
}

#[derive(Debug)]
pub struct CreatePlan {
    pub name: String,
    pub port: u16,
    pub nodes: Vec<String>,
    pub protocol: Protocol,
    pub options: BTreeMap<String, String>,
    pub target: BackingTarget,
    pub volume: VolumeRecord,
    pub reservation: Reservation,
}

#[derive(Debug)]
pub struct VolumePlan {
    pub target: BackingTarget,
    pub volume: VolumeRecord,
    pub reservation: Reservation,
}

#[derive(Debug)]
pub struct ResizePlan {
    pub target: BackingTarget,
    pub volume_id: u32,
    pub old_size_gib: u64,
    pub new_size_gib: u64,
    pub reservation: Reservation,
}

// === Capacity ledger ===

#[derive(Debug, Default)]
pub struct CapacityLedger {
    reserved: Mutex<HashMap<(String, String), u64>>,
}

impl CapacityLedger {
    pub fn reserved(&self, node: &str, pool: &str) -> u64 {
        self.reserved
            .lock()
            .get(&(node.to_string(), pool.to_string()))
            .copied()
            .unwrap_or(0)
    }

    fn release(&self, entries: &[(String, String, u64)]) {
        let mut reserved = self.reserved.lock();
        for (node, pool, gib) in entries {
            let key = (node.clone(), pool.clone());
            if let Some(current) = reserved.get_mut(&key) {
                *current = current.saturating_sub(*gib);
                if *current == 0 {
                    reserved.remove(&key);
                }
            }
        }
    }
}

/// Capacity held for an in-flight workflow; released on drop.
#[derive(Debug)]
pub struct Reservation {
    ledger: Arc<CapacityLedger>,
    entries: Vec<(String, String, u64)>,
}

impl Reservation {
    pub fn gib(&self) -> u64 {
        self.entries.first().map(|e| e.2).unwrap_or(0)
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.ledger.release(&self.entries);
    }
}

// === Placement ===

pub struct Placement {
    ledger: Arc<CapacityLedger>,
}

impl Default for Placement {
    fn default() -> Self {
        Self::new()
    }
}

impl Placement {
    pub fn new() -> Self {
        Self {
            ledger: Arc::new(CapacityLedger::default()),
        }
    }

    pub fn ledger(&self) -> &CapacityLedger {
        &self.ledger
    }

    /// Check free capacity on every node and hold `gib` on each.
    fn reserve(&self, view: &ClusterView, nodes: &[String], pool: &str, gib: u64) -> Result<Reservation> {
        let mut reserved = self.ledger.reserved.lock();

        for node in nodes {
            let record = view
                .pool(node, pool)
                .ok_or_else(|| Error::NotFound(format!("pool {} on node {}", pool, node)))?;
            let held = reserved
                .get(&(node.clone(), pool.to_string()))
                .copied()
                .unwrap_or(0);
            if gib.saturating_add(held) > record.free_gib {
                return Err(Error::CapacityExceeded(format!(
                    "pool {} on node {}: requested {} GiB, {} GiB free, {} GiB reserved",
                    pool, node, gib, record.free_gib, held
                )));
            }
        }

        let entries: Vec<(String, String, u64)> = nodes
            .iter()
            .map(|n| (n.clone(), pool.to_string(), gib))
            .collect();
        for (node, pool, gib) in &entries {
            *reserved.entry((node.clone(), pool.clone())).or_insert(0) += gib;
        }

        Ok(Reservation {
            ledger: Arc::clone(&self.ledger),
            entries,
        })
    }

    pub fn plan_create(&self, req: &CreateRequest, view: &ClusterView) -> Result<CreatePlan> {
        validate_object_name("resource", &req.name)?;
        validate_object_name("pool", &req.pool)?;

        if req.size_gib < 1 {
            return Err(Error::InvalidArgument("size must be at least 1 GiB".into()));
        }

        let nodes = dedup_nodes(&req.nodes);
        if nodes.is_empty() {
            return Err(Error::InvalidArgument("node list cannot be empty".into()));
        }

        if view.resources.contains_key(&req.name) {
            return Err(Error::AlreadyExists(format!("resource {}", req.name)));
        }

        for (option, value) in &req.options {
            if option.is_empty() || !option.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
                return Err(Error::InvalidArgument(format!(
                    "invalid replication option name '{}'",
                    option
                )));
            }
            if value.is_empty() || value.chars().any(|c| matches!(c, ';' | '{' | '}' | '\n' | '\r')) {
                return Err(Error::InvalidArgument(format!(
                    "invalid value for replication option '{}'",
                    option
                )));
            }
        }

        let port = allocate_port(req.port, &view.used_ports())?;
        check_nodes_healthy(view, &nodes)?;
        let target = common_target(view, &nodes, &req.pool)?;

        let id = 0;
        let volume = VolumeRecord {
            id,
            size_gib: req.size_gib,
            minor: allocate_minor(&view.used_minors())?,
            backing_device: target.device_for(&req.name, id),
            filesystem: None,
            extra: Map::new(),
        };

        let reservation = self.reserve(view, &nodes, &req.pool, req.size_gib)?;

        Ok(CreatePlan {
            name: req.name.clone(),
            port,
            nodes,
            protocol: req.protocol,
            options: req.options.clone(),
            target,
            volume,
            reservation,
        })
    }

    pub fn plan_add_volume(&self, resource: &ResourceRecord, size_gib: u64, view: &ClusterView) -> Result<VolumePlan> {
        if size_gib < 1 {
            return Err(Error::InvalidArgument("size must be at least 1 GiB".into()));
        }
        check_nodes_healthy(view, &resource.nodes)?;
        let target = common_target(view, &resource.nodes, &resource.pool)?;

        // ids are never reused, even after removal
        let id = resource.next_volume_id.max(
            resource
                .volumes
                .iter()
                .map(|v| v.id + 1)
                .max()
                .unwrap_or(0),
        );

        let volume = VolumeRecord {
            id,
            size_gib,
            minor: allocate_minor(&view.used_minors())?,
            backing_device: target.device_for(&resource.name, id),
            filesystem: None,
            extra: Map::new(),
        };
        let reservation = self.reserve(view, &resource.nodes, &resource.pool, size_gib)?;

        Ok(VolumePlan {
            target,
            volume,
            reservation,
        })
    }

    pub fn plan_resize(
        &self,
        resource: &ResourceRecord,
        volume_id: u32,
        new_size_gib: u64,
        view: &ClusterView,
    ) -> Result<ResizePlan> {
        let volume = resource.volume(volume_id).ok_or_else(|| {
            Error::NotFound(format!("volume {} of resource {}", volume_id, resource.name))
        })?;
        if new_size_gib <= volume.size_gib {
            return Err(Error::InvalidArgument(format!(
                "volumes only grow: {} GiB is not larger than {} GiB",
                new_size_gib, volume.size_gib
            )));
        }
        check_nodes_healthy(view, &resource.nodes)?;
        let target = common_target(view, &resource.nodes, &resource.pool)?;
        let reservation = self.reserve(
            view,
            &resource.nodes,
            &resource.pool,
            new_size_gib - volume.size_gib,
        )?;

        Ok(ResizePlan {
            target,
            volume_id,
            old_size_gib: volume.size_gib,
            new_size_gib,
            reservation,
        })
    }

    /// Hold the copy-on-write area of a thick snapshot on one node's pool.
    pub fn reserve_snapshot(&self, view: &ClusterView, node: &str, pool: &str, gib: u64) -> Result<Reservation> {
        self.reserve(view, &[node.to_string()], pool, gib)
    }

    /// Resolve the backing target of an existing resource without reserving.
    pub fn target_of(&self, resource: &ResourceRecord, view: &ClusterView) -> Result<BackingTarget> {
        common_target(view, &resource.nodes, &resource.pool)
    }
}

/// Drop repeated node names, keeping first occurrence order.
pub fn dedup_nodes(nodes: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    nodes
        .iter()
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty() && seen.insert(n.clone()))
        .collect()
}

pub fn allocate_port(requested: Option<u32>, used: &BTreeSet<u16>) -> Result<u16> {
    match requested {
        Some(0) => Err(Error::InvalidArgument("port 0 is not allowed".into())),
        Some(p) if p > MAX_PORT => Err(Error::InvalidArgument(format!(
            "port {} exceeds {}",
            p, MAX_PORT
        ))),
        Some(p) if p < MIN_PORT => Err(Error::InvalidArgument(format!(
            "port {} is below {}",
            p, MIN_PORT
        ))),
        Some(p) => {
            let port = p as u16;
            if used.contains(&port) {
                Err(Error::AlreadyExists(format!("port {} is in use", port)))
            } else {
                Ok(port)
            }
        }
        None => (AUTO_PORT_BASE..=u16::MAX)
            .find(|p| !used.contains(p))
            .ok_or_else(|| Error::CapacityExceeded("no free replication port".into())),
    }
}

pub fn allocate_minor(used: &BTreeSet<u32>) -> Result<u32> {
    (MINOR_BASE..=1_048_575)
        .find(|m| !used.contains(m))
        .ok_or_else(|| Error::CapacityExceeded("no free device minor".into()))
}

fn check_nodes_healthy(view: &ClusterView, nodes: &[String]) -> Result<()> {
    for name in nodes {
        let node = view
            .nodes
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("node {}", name)))?;
        if node.liveness != NodeLiveness::Healthy {
            return Err(Error::Unreachable {
                node: name.clone(),
                message: format!("node is {}", node.liveness),
            });
        }
    }
    Ok(())
}

fn common_target(view: &ClusterView, nodes: &[String], pool: &str) -> Result<BackingTarget> {
    let mut target: Option<(String, BackingTarget)> = None;
    for node in nodes {
        let record = view
            .pool(node, pool)
            .ok_or_else(|| Error::NotFound(format!("pool {} on node {}", pool, node)))?;
        let candidate = BackingTarget::from_pool(record);
        match &target {
            None => target = Some((node.clone(), candidate)),
            Some((first, existing)) if *existing != candidate => {
                return Err(Error::ConfigMismatch(format!(
                    "pool {} is {} at {} on {} but {} at {} on {}",
                    pool,
                    existing.pool_type,
                    existing.root,
                    first,
                    candidate.pool_type,
                    candidate.root,
                    node
                )));
            }
            Some(_) => {}
        }
    }
    target
        .map(|(_, t)| t)
        .ok_or_else(|| Error::InvalidArgument("node list cannot be empty".into()))
}

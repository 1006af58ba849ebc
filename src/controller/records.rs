//! Persisted cluster records
//!
//! Every record carries `schema_version` and keeps unknown fields in `extra`,
//! so a newer controller's fields survive a read-modify-write by an older one.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const SCHEMA_VERSION: u32 = 1;

fn schema_version() -> u32 {
    SCHEMA_VERSION
}

/// Key layout in the state store
pub mod keys {
    pub const NODES: &str = "nodes/";
    pub const POOLS: &str = "pools/";
    pub const RESOURCES: &str = "resources/";
    pub const HA: &str = "ha/";
    pub const SNAPSHOTS: &str = "snapshots/";
    pub const GATEWAYS: &str = "gateways/";
    pub const INTENTS: &str = "intents/";
    pub const COMPLETIONS: &str = "completions/";

    pub fn node(name: &str) -> String {
        format!("{}{}", NODES, name)
    }

    pub fn pool(node: &str, pool: &str) -> String {
        format!("{}{}/{}", POOLS, node, pool)
    }

    pub fn pools_of(node: &str) -> String {
        format!("{}{}/", POOLS, node)
    }

    pub fn resource(name: &str) -> String {
        format!("{}{}", RESOURCES, name)
    }

    pub fn ha(resource: &str) -> String {
        format!("{}{}", HA, resource)
    }

    pub fn snapshot(resource: &str, node: &str, volume: u32, name: &str) -> String {
        format!("{}{}/{}/{}/{}", SNAPSHOTS, resource, node, volume, name)
    }

    pub fn snapshots_of(resource: &str) -> String {
        format!("{}{}/", SNAPSHOTS, resource)
    }

    pub fn gateway(name: &str) -> String {
        format!("{}{}", GATEWAYS, name)
    }

    pub fn intent(id: &str) -> String {
        format!("{}{}", INTENTS, id)
    }

    pub fn completion(id: &str) -> String {
        format!("{}{}", COMPLETIONS, id)
    }
}

// === Nodes ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeLiveness {
    Unknown,
    Healthy,
    Unreachable,
    /// Agent answers but the replication driver is not loaded
    Degraded,
}

impl NodeLiveness {
    pub fn is_reachable(&self) -> bool {
        matches!(self, NodeLiveness::Healthy | NodeLiveness::Degraded)
    }
}

impl std::fmt::Display for NodeLiveness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeLiveness::Unknown => write!(f, "unknown"),
            NodeLiveness::Healthy => write!(f, "healthy"),
            NodeLiveness::Unreachable => write!(f, "unreachable"),
            NodeLiveness::Degraded => write!(f, "degraded"),
        }
    }
}

/// Installed-component inventory reported by a node probe
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub replication_version: Option<String>,
    #[serde(default)]
    pub promoter_version: Option<String>,
    #[serde(default)]
    pub promoter_running: bool,
    #[serde(default)]
    pub agent_pack_installed: bool,
    #[serde(default)]
    pub agents: Vec<String>,
    #[serde(default)]
    pub zfs_available: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    #[serde(default = "schema_version")]
    pub schema_version: u32,
    pub name: String,
    pub address: String,
    pub agent_port: u16,
    #[serde(default)]
    pub inventory: Inventory,
    pub liveness: NodeLiveness,
    #[serde(default)]
    pub last_seen: Option<u64>,
    pub registered_at: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl NodeRecord {
    pub fn new(name: &str, address: &str, agent_port: u16) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            name: name.to_string(),
            address: address.to_string(),
            agent_port,
            inventory: Inventory::default(),
            liveness: NodeLiveness::Unknown,
            last_seen: None,
            registered_at: crate::common::timestamp_now(),
            extra: Map::new(),
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.agent_port)
    }
}

// === Pools ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PoolType {
    VolumeGroup,
    ThinPool,
    CopyOnWritePool,
}

impl PoolType {
    pub fn storage_kind(&self) -> StorageKind {
        match self {
            PoolType::VolumeGroup | PoolType::ThinPool => StorageKind::VolumeManager,
            PoolType::CopyOnWritePool => StorageKind::CopyOnWrite,
        }
    }
}

impl std::fmt::Display for PoolType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolType::VolumeGroup => write!(f, "volume-group"),
            PoolType::ThinPool => write!(f, "thin-pool"),
            PoolType::CopyOnWritePool => write!(f, "copy-on-write-pool"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolRecord {
    #[serde(default = "schema_version")]
    pub schema_version: u32,
    pub name: String,
    pub pool_type: PoolType,
    pub node: String,
    pub total_gib: u64,
    pub free_gib: u64,
    #[serde(default)]
    pub devices: Vec<String>,
    /// Volume group hosting a thin pool
    #[serde(default)]
    pub volume_group: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PoolRecord {
    /// Directory the pool's block devices appear under
    pub fn backing_root(&self) -> String {
        match self.pool_type {
            PoolType::VolumeGroup => format!("/dev/{}", self.name),
            PoolType::ThinPool => {
                format!("/dev/{}", self.volume_group.as_deref().unwrap_or(&self.name))
            }
            PoolType::CopyOnWritePool => format!("/dev/zvol/{}", self.name),
        }
    }

    /// Name the volume manager or copy-on-write tool knows the container by
    pub fn container(&self) -> &str {
        match self.pool_type {
            PoolType::ThinPool => self.volume_group.as_deref().unwrap_or(&self.name),
            _ => &self.name,
        }
    }
}

// === Resources ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Protocol {
    A,
    B,
    #[default]
    C,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageKind {
    VolumeManager,
    CopyOnWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Primary,
    Secondary,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceState {
    Provisioning,
    Ready,
    Deleting,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRecord {
    pub id: u32,
    pub size_gib: u64,
    pub minor: u32,
    pub backing_device: String,
    #[serde(default)]
    pub filesystem: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl VolumeRecord {
    pub fn device(&self) -> String {
        format!("/dev/drbd{}", self.minor)
    }

    /// Logical volume / zvol name
    pub fn lv_name(resource: &str, id: u32) -> String {
        format!("{}_vol{}", resource, id)
    }
}

/// Last observed replication state of one node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerState {
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub disk_state: Option<String>,
    #[serde(default)]
    pub replication_state: Option<String>,
    #[serde(default)]
    pub updated_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountRecord {
    pub node: String,
    pub volume: u32,
    pub path: String,
    pub fstype: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRecord {
    #[serde(default = "schema_version")]
    pub schema_version: u32,
    pub name: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
    pub storage: StorageKind,
    pub pool: String,
    pub nodes: Vec<String>,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    #[serde(default)]
    pub volumes: Vec<VolumeRecord>,
    /// Next volume id to hand out; never decreases
    pub next_volume_id: u32,
    #[serde(default)]
    pub peers: BTreeMap<String, PeerState>,
    #[serde(default)]
    pub mounts: Vec<MountRecord>,
    pub state: ResourceState,
    pub created_at: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ResourceRecord {
    pub fn volume(&self, id: u32) -> Option<&VolumeRecord> {
        self.volumes.iter().find(|v| v.id == id)
    }

    pub fn volume_mut(&mut self, id: u32) -> Option<&mut VolumeRecord> {
        self.volumes.iter_mut().find(|v| v.id == id)
    }

    pub fn role(&self, node: &str) -> Role {
        self.peers.get(node).map(|p| p.role).unwrap_or_default()
    }

    pub fn primaries(&self) -> Vec<&str> {
        self.peers
            .iter()
            .filter(|(_, p)| p.role == Role::Primary)
            .map(|(n, _)| n.as_str())
            .collect()
    }

    pub fn set_role(&mut self, node: &str, role: Role) {
        let entry = self.peers.entry(node.to_string()).or_default();
        entry.role = role;
        entry.updated_at = crate::common::timestamp_now();
    }

    /// Make `node` the only Primary; stale Primary entries become Unknown.
    pub fn claim_primary(&mut self, node: &str) {
        for (peer, state) in self.peers.iter_mut() {
            if peer != node && state.role == Role::Primary {
                state.role = Role::Unknown;
            }
        }
        self.set_role(node, Role::Primary);
    }

    pub fn has_node(&self, node: &str) -> bool {
        self.nodes.iter().any(|n| n == node)
    }

    pub fn total_size_gib(&self) -> u64 {
        self.volumes.iter().map(|v| v.size_gib).sum()
    }
}

// === HA ===

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaMount {
    pub path: String,
    pub fstype: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HaConfigRecord {
    #[serde(default = "schema_version")]
    pub schema_version: u32,
    pub resource: String,
    #[serde(default)]
    pub mount: Option<HaMount>,
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub vip: Option<String>,
    pub config_path: String,
    pub nodes: Vec<String>,
    pub created_at: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// === Snapshots ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotBackend {
    Lvm,
    Zfs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRecord {
    #[serde(default = "schema_version")]
    pub schema_version: u32,
    pub name: String,
    pub resource: String,
    pub volume: u32,
    pub node: String,
    pub backend: SnapshotBackend,
    /// Backend object: `vg/lv_snap` or `pool/zvol@snap`
    pub object: String,
    #[serde(default)]
    pub size_gib: Option<u64>,
    pub created_at: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// === Gateways ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayKind {
    Nfs,
    Iscsi,
    Nvmeof,
}

impl GatewayKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayKind::Nfs => "nfs",
            GatewayKind::Iscsi => "iscsi",
            GatewayKind::Nvmeof => "nvmeof",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayState {
    Stopped,
    Running,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayRecord {
    #[serde(default = "schema_version")]
    pub schema_version: u32,
    pub name: String,
    pub kind: GatewayKind,
    pub resource: String,
    pub volume: u32,
    /// Export path, IQN or NQN depending on the kind
    pub target: String,
    #[serde(default)]
    pub service_ip: Option<String>,
    pub unit: String,
    pub state: GatewayState,
    #[serde(default)]
    pub active_node: Option<String>,
    pub created_at: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// === Workflows ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    CreateResource,
    DeleteResource,
    AddVolume,
    RemoveVolume,
    ResizeVolume,
    MakeHa,
    DeleteHa,
}

impl WorkflowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowKind::CreateResource => "create_resource",
            WorkflowKind::DeleteResource => "delete_resource",
            WorkflowKind::AddVolume => "add_volume",
            WorkflowKind::RemoveVolume => "remove_volume",
            WorkflowKind::ResizeVolume => "resize_volume",
            WorkflowKind::MakeHa => "make_ha",
            WorkflowKind::DeleteHa => "delete_ha",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentState {
    Running,
    Interrupted,
    Completed,
    RolledBack,
    Failed,
}

impl IntentState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IntentState::Completed | IntentState::RolledBack | IntentState::Failed
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentRecord {
    #[serde(default = "schema_version")]
    pub schema_version: u32,
    pub id: String,
    pub kind: WorkflowKind,
    pub resource: String,
    pub nodes: Vec<String>,
    /// Last step reached
    pub checkpoint: u8,
    pub state: IntentState,
    /// Workflow parameters needed to resume or roll back
    #[serde(default)]
    pub detail: Value,
    pub started_at: u64,
    pub updated_at: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRecord {
    #[serde(default = "schema_version")]
    pub schema_version: u32,
    pub id: String,
    pub kind: WorkflowKind,
    pub resource: String,
    pub outcome: IntentState,
    #[serde(default)]
    pub message: Option<String>,
    pub finished_at: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_fields_survive_round_trip() {
        let raw = serde_json::json!({
            "schema_version": 2,
            "name": "A",
            "address": "10.0.0.1",
            "agent_port": 3375,
            "liveness": "healthy",
            "registered_at": 1,
            "rack": "r12"
        });
        let mut node: NodeRecord = serde_json::from_value(raw).unwrap();
        assert_eq!(node.extra.get("rack"), Some(&Value::from("r12")));

        node.liveness = NodeLiveness::Unreachable;
        let back = serde_json::to_value(&node).unwrap();
        assert_eq!(back["rack"], "r12");
        assert_eq!(back["schema_version"], 2);
        assert_eq!(back["liveness"], "unreachable");
    }

    #[test]
    fn test_backing_roots() {
        let mut pool = PoolRecord {
            schema_version: SCHEMA_VERSION,
            name: "p1".into(),
            pool_type: PoolType::VolumeGroup,
            node: "A".into(),
            total_gib: 100,
            free_gib: 100,
            devices: vec!["/dev/sdb".into()],
            volume_group: None,
            extra: Map::new(),
        };
        assert_eq!(pool.backing_root(), "/dev/p1");

        pool.pool_type = PoolType::ThinPool;
        pool.volume_group = Some("vg0".into());
        assert_eq!(pool.backing_root(), "/dev/vg0");

        pool.pool_type = PoolType::CopyOnWritePool;
        assert_eq!(pool.backing_root(), "/dev/zvol/p1");
    }

    #[test]
    fn test_pool_type_wire_names() {
        assert_eq!(
            serde_json::to_value(PoolType::CopyOnWritePool).unwrap(),
            "copy-on-write-pool"
        );
        assert_eq!(
            serde_json::from_value::<PoolType>("thin-pool".into()).unwrap(),
            PoolType::ThinPool
        );
    }

    #[test]
    fn test_primaries() {
        let mut res = ResourceRecord {
            schema_version: SCHEMA_VERSION,
            name: "r0".into(),
            port: 7000,
            protocol: Protocol::C,
            storage: StorageKind::VolumeManager,
            pool: "p1".into(),
            nodes: vec!["A".into(), "B".into()],
            options: BTreeMap::new(),
            volumes: vec![],
            next_volume_id: 0,
            peers: BTreeMap::new(),
            mounts: vec![],
            state: ResourceState::Ready,
            created_at: 0,
            extra: Map::new(),
        };
        assert!(res.primaries().is_empty());
        res.set_role("A", Role::Primary);
        res.set_role("B", Role::Secondary);
        assert_eq!(res.primaries(), vec!["A"]);
        res.claim_primary("B");
        assert_eq!(res.primaries(), vec!["B"]);
        assert_eq!(res.role("A"), Role::Unknown);
        assert_eq!(res.role("C"), Role::Unknown);
    }
}

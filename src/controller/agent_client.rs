//! Typed client for the per-node agent
//!
//! Every host side effect goes through [`NodeAgentClient`]. The wire format is
//! a JSON request tagged by `op`, answered with `{ok, message, payload}`.
//! Transports are pluggable so tests can drive a simulated cluster.

use super::records::{NodeRecord, PoolType, Role};
use crate::common::metrics::METRICS;
use crate::common::{Error, ErrorKind, Result, TimeoutConfig};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Request sent to a node agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum AgentRequest {
    Probe,

    // === Volume manager ===
    LvCreate {
        vg: String,
        name: String,
        size_gib: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thin_pool: Option<String>,
    },
    LvRemove {
        vg: String,
        name: String,
    },
    LvExtend {
        vg: String,
        name: String,
        size_gib: u64,
    },
    LvList {
        vg: String,
    },
    VgCreate {
        name: String,
        devices: Vec<String>,
    },
    VgRemove {
        name: String,
    },
    VgExtend {
        name: String,
        devices: Vec<String>,
    },
    ThinPoolCreate {
        vg: String,
        name: String,
        size_gib: u64,
    },
    ThinPoolRemove {
        vg: String,
        name: String,
    },
    PoolCapacity {
        pool_type: PoolType,
        name: String,
    },
    LvSnapshotCreate {
        vg: String,
        origin: String,
        name: String,
        size_gib: u64,
    },
    LvSnapshotRemove {
        vg: String,
        name: String,
    },
    LvSnapshotMerge {
        vg: String,
        name: String,
    },

    // === Replication driver ===
    ReplicationWriteConfig {
        resource: String,
        content: String,
    },
    ReplicationDeleteConfig {
        resource: String,
    },
    ReplicationCreateMd {
        resource: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        volume: Option<u32>,
    },
    ReplicationUp {
        resource: String,
    },
    ReplicationDown {
        resource: String,
    },
    ReplicationPromote {
        resource: String,
        force: bool,
    },
    ReplicationDemote {
        resource: String,
    },
    ReplicationAdjust {
        resource: String,
    },
    ReplicationResize {
        resource: String,
        volume: u32,
    },
    ReplicationStatus {
        resource: String,
    },

    // === Filesystem / mount ===
    FsFormat {
        device: String,
        fstype: String,
    },
    FsGrow {
        device: String,
        fstype: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mount_path: Option<String>,
    },
    Mount {
        device: String,
        path: String,
        fstype: String,
    },
    Unmount {
        path: String,
    },

    // === Promoter daemon ===
    PromoterWriteConfig {
        path: String,
        content: String,
        validate: bool,
        backup: bool,
    },
    PromoterReadConfig {
        path: String,
    },
    PromoterDeleteConfig {
        path: String,
    },
    PromoterReload {
        wait: bool,
    },
    PromoterStatus {
        plugin: String,
    },
    PromoterActiveNode {
        plugin: String,
    },
    PromoterEvict {
        plugin: String,
    },

    // === Copy-on-write backend ===
    ZfsPoolCreate {
        name: String,
        devices: Vec<String>,
    },
    ZfsPoolDestroy {
        name: String,
    },
    ZfsPoolAdd {
        name: String,
        devices: Vec<String>,
    },
    ZfsDatasetCreate {
        name: String,
        #[serde(default)]
        properties: BTreeMap<String, String>,
    },
    ZfsDatasetDestroy {
        name: String,
        recursive: bool,
    },
    ZfsVolumeCreate {
        name: String,
        size_gib: u64,
    },
    ZfsVolumeDestroy {
        name: String,
    },
    ZfsVolumeExtend {
        name: String,
        size_gib: u64,
    },
    ZfsList {
        kind: ZfsKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        root: Option<String>,
    },
    ZfsSnapshotCreate {
        dataset: String,
        name: String,
    },
    ZfsSnapshotDestroy {
        dataset: String,
        name: String,
    },
    ZfsRollback {
        dataset: String,
        name: String,
    },
    ZfsClone {
        dataset: String,
        snapshot: String,
        target: String,
    },

    // === Service manager ===
    ServiceStart {
        unit: String,
    },
    ServiceStop {
        unit: String,
    },
    ServiceEnable {
        unit: String,
    },
    ServiceDisable {
        unit: String,
    },
    ServiceStatus {
        unit: String,
    },
    UnitCreate {
        unit: String,
        content: String,
    },
    UnitDelete {
        unit: String,
    },
}

impl AgentRequest {
    /// Capability name (the `op` tag), used for metrics and logs.
    pub fn capability(&self) -> String {
        serde_json::to_value(self)
            .ok()
            .and_then(|v| v.get("op").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Default deadline for this call.
    pub fn deadline(&self, timeouts: &TimeoutConfig) -> Duration {
        use AgentRequest::*;
        match self {
            LvCreate { .. } | LvRemove { .. } | LvExtend { .. } | VgCreate { .. }
            | VgRemove { .. } | VgExtend { .. } | ThinPoolCreate { .. } | ThinPoolRemove { .. }
            | LvSnapshotCreate { .. } | LvSnapshotRemove { .. } | LvSnapshotMerge { .. }
            | ZfsPoolCreate { .. } | ZfsPoolDestroy { .. } | ZfsPoolAdd { .. }
            | ZfsVolumeCreate { .. } | ZfsVolumeDestroy { .. } | ZfsVolumeExtend { .. }
            | ZfsRollback { .. } | ZfsClone { .. } => timeouts.volume_manager(),
            ReplicationCreateMd { .. } | FsFormat { .. } => timeouts.metadata(),
            ReplicationUp { .. } | ReplicationDown { .. } | PromoterReload { .. } => {
                timeouts.bring_up()
            }
            PromoterEvict { .. } => timeouts.evict(),
            _ => timeouts.rpc(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZfsKind {
    Pool,
    Filesystem,
    Volume,
    Snapshot,
}

/// Reply envelope from a node agent
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentReply {
    pub ok: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub payload: Value,
}

impl AgentReply {
    pub fn ok(payload: Value) -> Self {
        Self {
            ok: true,
            message: String::new(),
            payload,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
            payload: Value::Null,
        }
    }
}

// === Payloads ===

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeReport {
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub replication_version: Option<String>,
    #[serde(default)]
    pub replication_loaded: bool,
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

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalVolume {
    pub name: String,
    pub vg: String,
    pub size_gib: u64,
    #[serde(default)]
    pub origin: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolCapacity {
    pub total_gib: u64,
    pub free_gib: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationStatus {
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub disk_state: Option<String>,
    #[serde(default)]
    pub replication_state: Option<String>,
    /// Peer name -> role as seen from this node
    #[serde(default)]
    pub peers: BTreeMap<String, Role>,
}

impl ReplicationStatus {
    pub fn is_consistent(&self) -> bool {
        matches!(self.disk_state.as_deref(), Some("UpToDate") | Some("Consistent"))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveNode {
    #[serde(default)]
    pub node: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginStatus {
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub active_node: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZfsEntry {
    pub name: String,
    pub kind: ZfsKind,
    #[serde(default)]
    pub size_gib: Option<u64>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub state: String,
}

// === Transport ===

/// Carries one request to one agent.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn call(&self, request: &AgentRequest, deadline: Duration) -> Result<AgentReply>;
}

/// Builds a transport for a registered node.
pub trait AgentConnector: Send + Sync {
    fn connect(&self, node: &NodeRecord) -> Arc<dyn AgentTransport>;
}

/// HTTP transport: `POST http://<address>:<port>/v1/call`
pub struct HttpTransport {
    node: String,
    url: String,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(node: &str, endpoint: &str, client: reqwest::Client) -> Self {
        Self {
            node: node.to_string(),
            url: format!("http://{}/v1/call", endpoint),
            client,
        }
    }
}

#[async_trait]
impl AgentTransport for HttpTransport {
    async fn call(&self, request: &AgentRequest, deadline: Duration) -> Result<AgentReply> {
        let unreachable = |e: reqwest::Error| Error::Unreachable {
            node: self.node.clone(),
            message: e.to_string(),
        };

        let response = self
            .client
            .post(&self.url)
            .timeout(deadline)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(format!("{} on {}", request.capability(), self.node))
                } else {
                    unreachable(e)
                }
            })?;

        if !response.status().is_success() {
            return Err(Error::Agent {
                node: self.node.clone(),
                kind: ErrorKind::Internal,
                message: format!("agent returned HTTP {}", response.status()),
            });
        }

        response.json::<AgentReply>().await.map_err(unreachable)
    }
}

pub struct HttpConnector {
    client: reqwest::Client,
}

impl HttpConnector {
    pub fn new(connect_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self { client })
    }
}

impl AgentConnector for HttpConnector {
    fn connect(&self, node: &NodeRecord) -> Arc<dyn AgentTransport> {
        Arc::new(HttpTransport::new(
            &node.name,
            &node.endpoint(),
            self.client.clone(),
        ))
    }
}

// === Client ===

/// Typed capability client for one node.
#[derive(Clone)]
pub struct NodeAgentClient {
    node: String,
    transport: Arc<dyn AgentTransport>,
    timeouts: TimeoutConfig,
}

impl NodeAgentClient {
    pub fn new(node: &str, transport: Arc<dyn AgentTransport>, timeouts: TimeoutConfig) -> Self {
        Self {
            node: node.to_string(),
            transport,
            timeouts,
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// Issue a request with its default deadline.
    pub async fn call(&self, request: AgentRequest) -> Result<Value> {
        let deadline = request.deadline(&self.timeouts);
        self.call_with_deadline(request, deadline).await
    }

    /// Issue a request; `ok=false` becomes a typed error carrying the agent's text.
    pub async fn call_with_deadline(&self, request: AgentRequest, deadline: Duration) -> Result<Value> {
        let capability = request.capability();
        let start = Instant::now();

        let result = match tokio::time::timeout(deadline, self.transport.call(&request, deadline)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "{} on {} exceeded {:?}",
                capability, self.node, deadline
            ))),
        };

        let result = result.and_then(|reply| {
            if reply.ok {
                Ok(reply.payload)
            } else {
                Err(Error::Agent {
                    node: self.node.clone(),
                    kind: ErrorKind::from_agent_message(&reply.message),
                    message: reply.message,
                })
            }
        });

        let elapsed = start.elapsed();
        METRICS.record_agent_call(&capability, elapsed, result.is_ok());

        match &result {
            Ok(_) => tracing::debug!(
                node = %self.node,
                capability = %capability,
                elapsed_ms = elapsed.as_millis() as u64,
                "agent call ok"
            ),
            Err(e) => tracing::debug!(
                node = %self.node,
                capability = %capability,
                error = %e,
                "agent call failed"
            ),
        }

        result
    }

    async fn call_as<T: DeserializeOwned>(&self, request: AgentRequest) -> Result<T> {
        let payload = self.call(request).await?;
        serde_json::from_value(payload).map_err(|e| Error::Agent {
            node: self.node.clone(),
            kind: ErrorKind::Internal,
            message: format!("malformed agent payload: {}", e),
        })
    }

    async fn call_unit(&self, request: AgentRequest) -> Result<()> {
        self.call(request).await.map(|_| ())
    }

    // === Probe ===

    pub async fn probe(&self, deadline: Duration) -> Result<ProbeReport> {
        let payload = self.call_with_deadline(AgentRequest::Probe, deadline).await?;
        serde_json::from_value(payload).map_err(|e| Error::Agent {
            node: self.node.clone(),
            kind: ErrorKind::Internal,
            message: format!("malformed probe report: {}", e),
        })
    }

    // === Volume manager ===

    pub async fn lv_create(&self, vg: &str, name: &str, size_gib: u64, thin_pool: Option<&str>) -> Result<()> {
        self.call_unit(AgentRequest::LvCreate {
            vg: vg.into(),
            name: name.into(),
            size_gib,
            thin_pool: thin_pool.map(str::to_string),
        })
        .await
    }

    pub async fn lv_remove(&self, vg: &str, name: &str) -> Result<()> {
        self.call_unit(AgentRequest::LvRemove {
            vg: vg.into(),
            name: name.into(),
        })
        .await
    }

    pub async fn lv_extend(&self, vg: &str, name: &str, size_gib: u64) -> Result<()> {
        self.call_unit(AgentRequest::LvExtend {
            vg: vg.into(),
            name: name.into(),
            size_gib,
        })
        .await
    }

    pub async fn lv_list(&self, vg: &str) -> Result<Vec<LogicalVolume>> {
        self.call_as(AgentRequest::LvList { vg: vg.into() }).await
    }

    pub async fn vg_create(&self, name: &str, devices: &[String]) -> Result<()> {
        self.call_unit(AgentRequest::VgCreate {
            name: name.into(),
            devices: devices.to_vec(),
        })
        .await
    }

    pub async fn vg_remove(&self, name: &str) -> Result<()> {
        self.call_unit(AgentRequest::VgRemove { name: name.into() }).await
    }

    pub async fn vg_extend(&self, name: &str, devices: &[String]) -> Result<()> {
        self.call_unit(AgentRequest::VgExtend {
            name: name.into(),
            devices: devices.to_vec(),
        })
        .await
    }

    pub async fn thin_pool_create(&self, vg: &str, name: &str, size_gib: u64) -> Result<()> {
        self.call_unit(AgentRequest::ThinPoolCreate {
            vg: vg.into(),
            name: name.into(),
            size_gib,
        })
        .await
    }

    pub async fn thin_pool_remove(&self, vg: &str, name: &str) -> Result<()> {
        self.call_unit(AgentRequest::ThinPoolRemove {
            vg: vg.into(),
            name: name.into(),
        })
        .await
    }

    pub async fn pool_capacity(&self, pool_type: PoolType, name: &str) -> Result<PoolCapacity> {
        self.call_as(AgentRequest::PoolCapacity {
            pool_type,
            name: name.into(),
        })
        .await
    }

    pub async fn lv_snapshot_create(&self, vg: &str, origin: &str, name: &str, size_gib: u64) -> Result<()> {
        self.call_unit(AgentRequest::LvSnapshotCreate {
            vg: vg.into(),
            origin: origin.into(),
            name: name.into(),
            size_gib,
        })
        .await
    }

    pub async fn lv_snapshot_remove(&self, vg: &str, name: &str) -> Result<()> {
        self.call_unit(AgentRequest::LvSnapshotRemove {
            vg: vg.into(),
            name: name.into(),
        })
        .await
    }

    pub async fn lv_snapshot_merge(&self, vg: &str, name: &str) -> Result<()> {
        self.call_unit(AgentRequest::LvSnapshotMerge {
            vg: vg.into(),
            name: name.into(),
        })
        .await
    }

    // === Replication driver ===

    pub async fn replication_write_config(&self, resource: &str, content: &str) -> Result<()> {
        self.call_unit(AgentRequest::ReplicationWriteConfig {
            resource: resource.into(),
            content: content.into(),
        })
        .await
    }

    pub async fn replication_delete_config(&self, resource: &str) -> Result<()> {
        self.call_unit(AgentRequest::ReplicationDeleteConfig {
            resource: resource.into(),
        })
        .await
    }

    pub async fn replication_create_md(&self, resource: &str, volume: Option<u32>) -> Result<()> {
        self.call_unit(AgentRequest::ReplicationCreateMd {
            resource: resource.into(),
            volume,
        })
        .await
    }

    pub async fn replication_up(&self, resource: &str) -> Result<()> {
        self.call_unit(AgentRequest::ReplicationUp {
            resource: resource.into(),
        })
        .await
    }

    pub async fn replication_down(&self, resource: &str) -> Result<()> {
        self.call_unit(AgentRequest::ReplicationDown {
            resource: resource.into(),
        })
        .await
    }

    pub async fn replication_promote(&self, resource: &str, force: bool) -> Result<()> {
        self.call_unit(AgentRequest::ReplicationPromote {
            resource: resource.into(),
            force,
        })
        .await
    }

    pub async fn replication_demote(&self, resource: &str) -> Result<()> {
        self.call_unit(AgentRequest::ReplicationDemote {
            resource: resource.into(),
        })
        .await
    }

    pub async fn replication_adjust(&self, resource: &str) -> Result<()> {
        self.call_unit(AgentRequest::ReplicationAdjust {
            resource: resource.into(),
        })
        .await
    }

    pub async fn replication_resize(&self, resource: &str, volume: u32) -> Result<()> {
        self.call_unit(AgentRequest::ReplicationResize {
            resource: resource.into(),
            volume,
        })
        .await
    }

    pub async fn replication_status(&self, resource: &str) -> Result<ReplicationStatus> {
        self.call_as(AgentRequest::ReplicationStatus {
            resource: resource.into(),
        })
        .await
    }

    // === Filesystem / mount ===

    pub async fn fs_format(&self, device: &str, fstype: &str) -> Result<()> {
        self.call_unit(AgentRequest::FsFormat {
            device: device.into(),
            fstype: fstype.into(),
        })
        .await
    }

    pub async fn fs_grow(&self, device: &str, fstype: &str, mount_path: Option<&str>) -> Result<()> {
        self.call_unit(AgentRequest::FsGrow {
            device: device.into(),
            fstype: fstype.into(),
            mount_path: mount_path.map(str::to_string),
        })
        .await
    }

    pub async fn mount(&self, device: &str, path: &str, fstype: &str) -> Result<()> {
        self.call_unit(AgentRequest::Mount {
            device: device.into(),
            path: path.into(),
            fstype: fstype.into(),
        })
        .await
    }

    pub async fn unmount(&self, path: &str) -> Result<()> {
        self.call_unit(AgentRequest::Unmount { path: path.into() }).await
    }

    // === Promoter daemon ===

    pub async fn promoter_write_config(&self, path: &str, content: &str) -> Result<()> {
        self.call_unit(AgentRequest::PromoterWriteConfig {
            path: path.into(),
            content: content.into(),
            validate: true,
            backup: true,
        })
        .await
    }

    pub async fn promoter_read_config(&self, path: &str) -> Result<String> {
        self.call_as(AgentRequest::PromoterReadConfig { path: path.into() })
            .await
    }

    pub async fn promoter_delete_config(&self, path: &str) -> Result<()> {
        self.call_unit(AgentRequest::PromoterDeleteConfig { path: path.into() })
            .await
    }

    pub async fn promoter_reload(&self) -> Result<()> {
        self.call_unit(AgentRequest::PromoterReload { wait: true }).await
    }

    pub async fn promoter_status(&self, plugin: &str) -> Result<PluginStatus> {
        self.call_as(AgentRequest::PromoterStatus {
            plugin: plugin.into(),
        })
        .await
    }

    pub async fn promoter_active_node(&self, plugin: &str) -> Result<Option<String>> {
        let active: ActiveNode = self
            .call_as(AgentRequest::PromoterActiveNode {
                plugin: plugin.into(),
            })
            .await?;
        Ok(active.node)
    }

    pub async fn promoter_evict(&self, plugin: &str) -> Result<()> {
        self.call_unit(AgentRequest::PromoterEvict {
            plugin: plugin.into(),
        })
        .await
    }

    // === Copy-on-write backend ===

    pub async fn zfs_pool_create(&self, name: &str, devices: &[String]) -> Result<()> {
        self.call_unit(AgentRequest::ZfsPoolCreate {
            name: name.into(),
            devices: devices.to_vec(),
        })
        .await
    }

    pub async fn zfs_pool_destroy(&self, name: &str) -> Result<()> {
        self.call_unit(AgentRequest::ZfsPoolDestroy { name: name.into() })
            .await
    }

    pub async fn zfs_pool_add(&self, name: &str, devices: &[String]) -> Result<()> {
        self.call_unit(AgentRequest::ZfsPoolAdd {
            name: name.into(),
            devices: devices.to_vec(),
        })
        .await
    }

    pub async fn zfs_dataset_create(&self, name: &str, properties: BTreeMap<String, String>) -> Result<()> {
        self.call_unit(AgentRequest::ZfsDatasetCreate {
            name: name.into(),
            properties,
        })
        .await
    }

    pub async fn zfs_dataset_destroy(&self, name: &str, recursive: bool) -> Result<()> {
        self.call_unit(AgentRequest::ZfsDatasetDestroy {
            name: name.into(),
            recursive,
        })
        .await
    }

    pub async fn zfs_volume_create(&self, name: &str, size_gib: u64) -> Result<()> {
        self.call_unit(AgentRequest::ZfsVolumeCreate {
            name: name.into(),
            size_gib,
        })
        .await
    }

    pub async fn zfs_volume_destroy(&self, name: &str) -> Result<()> {
        self.call_unit(AgentRequest::ZfsVolumeDestroy { name: name.into() })
            .await
    }

    pub async fn zfs_volume_extend(&self, name: &str, size_gib: u64) -> Result<()> {
        self.call_unit(AgentRequest::ZfsVolumeExtend {
            name: name.into(),
            size_gib,
        })
        .await
    }

    pub async fn zfs_list(&self, kind: ZfsKind, root: Option<&str>) -> Result<Vec<ZfsEntry>> {
        self.call_as(AgentRequest::ZfsList {
            kind,
            root: root.map(str::to_string),
        })
        .await
    }

    pub async fn zfs_snapshot_create(&self, dataset: &str, name: &str) -> Result<()> {
        self.call_unit(AgentRequest::ZfsSnapshotCreate {
            dataset: dataset.into(),
            name: name.into(),
        })
        .await
    }

    pub async fn zfs_snapshot_destroy(&self, dataset: &str, name: &str) -> Result<()> {
        self.call_unit(AgentRequest::ZfsSnapshotDestroy {
            dataset: dataset.into(),
            name: name.into(),
        })
        .await
    }

    pub async fn zfs_rollback(&self, dataset: &str, name: &str) -> Result<()> {
        self.call_unit(AgentRequest::ZfsRollback {
            dataset: dataset.into(),
            name: name.into(),
        })
        .await
    }

    pub async fn zfs_clone(&self, dataset: &str, snapshot: &str, target: &str) -> Result<()> {
        self.call_unit(AgentRequest::ZfsClone {
            dataset: dataset.into(),
            snapshot: snapshot.into(),
            target: target.into(),
        })
        .await
    }

    // === Service manager ===

    pub async fn service_start(&self, unit: &str) -> Result<()> {
        self.call_unit(AgentRequest::ServiceStart { unit: unit.into() }).await
    }

    pub async fn service_stop(&self, unit: &str) -> Result<()> {
        self.call_unit(AgentRequest::ServiceStop { unit: unit.into() }).await
    }

    pub async fn service_enable(&self, unit: &str) -> Result<()> {
        self.call_unit(AgentRequest::ServiceEnable { unit: unit.into() }).await
    }

    pub async fn service_disable(&self, unit: &str) -> Result<()> {
        self.call_unit(AgentRequest::ServiceDisable { unit: unit.into() }).await
    }

    pub async fn service_status(&self, unit: &str) -> Result<ServiceStatus> {
        self.call_as(AgentRequest::ServiceStatus { unit: unit.into() }).await
    }

    pub async fn unit_create(&self, unit: &str, content: &str) -> Result<()> {
        self.call_unit(AgentRequest::UnitCreate {
            unit: unit.into(),
            content: content.into(),
        })
        .await
    }

    pub async fn unit_delete(&self, unit: &str) -> Result<()> {
        self.call_unit(AgentRequest::UnitDelete { unit: unit.into() }).await
    }
}

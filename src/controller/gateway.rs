//! Gateway life-cycle hooks
//!
//! A gateway exports one resource volume over NFS, iSCSI or NVMe-oF. The
//! controller only owns the record and a service unit per resource node; the
//! export itself is configured by the unit's helper on whichever node runs it.

use super::context::ClusterContext;
use super::fanout::fan_out;
use super::orchestrator::{ignore_missing, live_primaries};
use super::records::{keys, GatewayKind, GatewayRecord, GatewayState, ResourceState, SCHEMA_VERSION};
use super::store::Expect;
use crate::common::{parse_cidr, timestamp_now, validate_object_name, Error, NodeFailure, Result};
use serde::{Deserialize, Serialize};
use serde_json::Map;
use std::sync::Arc;

const HELPER_DIR: &str = "/usr/libexec/sds";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayRequest {
    pub name: String,
    pub kind: GatewayKind,
    pub resource: String,
    #[serde(default)]
    pub volume: u32,
    /// Export path, IQN or NQN; derived from the name when absent
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub service_ip: Option<String>,
}

pub fn unit_name(gateway: &str) -> String {
    format!("sds-gw-{}.service", gateway)
}

pub fn default_target(kind: GatewayKind, gateway: &str, resource: &str, volume: u32) -> String {
    match kind {
        GatewayKind::Nfs => format!("/srv/sds/{}/vol{}", resource, volume),
        GatewayKind::Iscsi => format!("iqn.2024-01.io.sds:{}", gateway),
        GatewayKind::Nvmeof => format!("nqn.2024-01.io.sds:{}", gateway),
    }
}

/// Service unit running the export helper for one gateway.
pub fn render_unit(gateway: &GatewayRecord, device: &str) -> String {
    let kind = gateway.kind.as_str();
    let mut out = String::new();
    out.push_str("[Unit]\n");
    out.push_str(&format!("Description=sds {} gateway {}\n", kind, gateway.name));
    out.push_str("After=network-online.target\n");
    out.push_str("Wants=network-online.target\n\n");
    out.push_str("[Service]\n");
    out.push_str("Type=oneshot\n");
    out.push_str("RemainAfterExit=yes\n");
    out.push_str(&format!("Environment=SDS_GATEWAY={}\n", gateway.name));
    out.push_str(&format!("Environment=SDS_DEVICE={}\n", device));
    out.push_str(&format!("Environment=SDS_TARGET={}\n", gateway.target));
    if let Some(ip) = &gateway.service_ip {
        out.push_str(&format!("Environment=SDS_SERVICE_IP={}\n", ip));
    }
    out.push_str(&format!("ExecStart={}/gateway-{} start\n", HELPER_DIR, kind));
    out.push_str(&format!("ExecStop={}/gateway-{} stop\n", HELPER_DIR, kind));
    out
}

fn partial(what: &str, failures: Vec<NodeFailure>) -> Error {
    Error::PartialFailure {
        message: format!(
            "{} failed on {}",
            what,
            failures
                .iter()
                .map(|f| f.node.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ),
        failures,
    }
}

#[derive(Clone)]
pub struct GatewayManager {
    ctx: Arc<ClusterContext>,
}

impl GatewayManager {
    pub fn new(ctx: Arc<ClusterContext>) -> Self {
        Self { ctx }
    }

    fn get_versioned(&self, name: &str) -> Result<(GatewayRecord, u64)> {
        self.ctx
            .store
            .get_as::<GatewayRecord>(&keys::gateway(name))?
            .ok_or_else(|| Error::NotFound(format!("gateway {}", name)))
    }

    pub fn get(&self, name: &str) -> Result<GatewayRecord> {
        self.get_versioned(name).map(|(g, _)| g)
    }

    pub fn list(&self, resource: Option<&str>) -> Result<Vec<GatewayRecord>> {
        Ok(self
            .ctx
            .store
            .list_as::<GatewayRecord>(keys::GATEWAYS)?
            .into_iter()
            .map(|(g, _)| g)
            .filter(|g| resource.map_or(true, |r| g.resource == r))
            .collect())
    }

    /// Record the gateway and install its unit on every resource node.
    pub async fn create(&self, req: GatewayRequest) -> Result<GatewayRecord> {
        validate_object_name("gateway", &req.name)?;
        if let Some(ip) = &req.service_ip {
            parse_cidr(ip)?;
        }
        let _guard = self.ctx.locks.acquire(&req.resource).await;
        if self.ctx.store.get(&keys::gateway(&req.name)).is_some() {
            return Err(Error::AlreadyExists(format!("gateway {}", req.name)));
        }
        let (record, _) = self.ctx.resource(&req.resource)?;
        if record.state != ResourceState::Ready {
            return Err(Error::PreconditionFailed(format!(
                "resource {} is not ready",
                req.resource
            )));
        }
        let volume = record
            .volume(req.volume)
            .ok_or_else(|| Error::NotFound(format!("volume {} of resource {}", req.volume, req.resource)))?;

        let gateway = GatewayRecord {
            schema_version: SCHEMA_VERSION,
            target: req
                .target
                .clone()
                .unwrap_or_else(|| default_target(req.kind, &req.name, &req.resource, req.volume)),
            name: req.name.clone(),
            kind: req.kind,
            resource: req.resource.clone(),
            volume: req.volume,
            service_ip: req.service_ip.clone(),
            unit: unit_name(&req.name),
            state: GatewayState::Stopped,
            active_node: None,
            created_at: timestamp_now(),
            extra: Map::new(),
        };
        let content = render_unit(&gateway, &volume.device());
        let clients = self.ctx.clients(&record.nodes)?;
        let report = fan_out(
            &record.nodes,
            self.ctx.config.workflows.parallelism,
            &self.ctx.shutdown,
            |node| {
                let client = clients.get(&node).cloned();
                let unit = gateway.unit.clone();
                let content = content.clone();
                async move {
                    let client = client.ok_or_else(|| Error::NotFound(format!("node {}", node)))?;
                    client.unit_create(&unit, &content).await
                }
            },
        )
        .await;

        if !report.is_complete() {
            let failures = report.failures();
            for node in report.succeeded_nodes() {
                if let Some(client) = clients.get(&node) {
                    if let Err(e) = ignore_missing(client.unit_delete(&gateway.unit).await) {
                        tracing::warn!(node = %node, unit = %gateway.unit, error = %e, "gateway unit left behind");
                    }
                }
            }
            return Err(partial("gateway unit install", failures));
        }

        self.ctx
            .store
            .put_if(&keys::gateway(&gateway.name), Expect::Absent, &gateway)?;
        tracing::info!(
            gateway = %gateway.name,
            kind = gateway.kind.as_str(),
            resource = %gateway.resource,
            volume = gateway.volume,
            "gateway created"
        );
        Ok(gateway)
    }

    /// Start the gateway on the resource's current Primary.
    pub async fn start(&self, name: &str) -> Result<GatewayRecord> {
        let (mut gateway, revision) = self.get_versioned(name)?;
        let _guard = self.ctx.locks.acquire(&gateway.resource).await;
        let (record, _) = self.ctx.resource(&gateway.resource)?;
        let primary = live_primaries(&self.ctx.observe(&record).await)
            .into_iter()
            .next()
            .ok_or_else(|| {
                Error::PreconditionFailed(format!("resource {} has no primary", gateway.resource))
            })?;
        if gateway.state == GatewayState::Running && gateway.active_node.as_deref() == Some(primary.as_str()) {
            return Ok(gateway);
        }

        self.ctx.client(&primary)?.service_start(&gateway.unit).await?;
        gateway.state = GatewayState::Running;
        gateway.active_node = Some(primary.clone());
        self.ctx
            .store
            .put_if(&keys::gateway(name), Expect::Revision(revision), &gateway)?;
        tracing::info!(gateway = %name, node = %primary, "gateway started");
        Ok(gateway)
    }

    pub async fn stop(&self, name: &str) -> Result<GatewayRecord> {
        let (mut gateway, revision) = self.get_versioned(name)?;
        let _guard = self.ctx.locks.acquire(&gateway.resource).await;
        if gateway.state == GatewayState::Stopped {
            return Ok(gateway);
        }
        if let Some(node) = &gateway.active_node {
            self.ctx.client(node)?.service_stop(&gateway.unit).await?;
        }
        gateway.state = GatewayState::Stopped;
        gateway.active_node = None;
        self.ctx
            .store
            .put_if(&keys::gateway(name), Expect::Revision(revision), &gateway)?;
        tracing::info!(gateway = %name, "gateway stopped");
        Ok(gateway)
    }

    /// Remove a stopped gateway's units and record.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let (gateway, revision) = self.get_versioned(name)?;
        let _guard = self.ctx.locks.acquire(&gateway.resource).await;
        if gateway.state != GatewayState::Stopped {
            return Err(Error::PreconditionFailed(format!(
                "gateway {} is running; stop it first",
                name
            )));
        }
        // Units live on the resource's nodes; a resource gone missing leaves nothing to clean
        let nodes = match self.ctx.resource(&gateway.resource) {
            Ok((record, _)) => record.nodes,
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => return Err(e),
        };
        let report = fan_out(
            &nodes,
            self.ctx.config.workflows.parallelism,
            &self.ctx.shutdown,
            |node| {
                let client = self.ctx.client(&node);
                let unit = gateway.unit.clone();
                async move { ignore_missing(client?.unit_delete(&unit).await) }
            },
        )
        .await;
        if !report.is_complete() {
            return Err(partial("gateway unit removal", report.failures()));
        }

        self.ctx
            .store
            .delete_if(&keys::gateway(name), Expect::Revision(revision))?;
        tracing::info!(gateway = %name, "gateway deleted");
        Ok(())
    }
}

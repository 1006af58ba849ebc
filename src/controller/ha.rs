//! HA Config Builder
//!
//! Renders the promoter configuration for a resource, distributes it to every
//! node and keeps the HA record in step with what the nodes hold.

use super::context::{ClusterContext, WorkflowScope};
use super::fanout::fan_out;
use super::intent::IntentLog;
use super::orchestrator::{client_of, ignore_missing, live_primaries, Progress, UndoTally};
use super::records::{
    keys, HaConfigRecord, HaMount, IntentRecord, IntentState, NodeLiveness, ResourceRecord,
    ResourceState, WorkflowKind, SCHEMA_VERSION,
};
use super::store::{Expect, TxnOp};
use crate::common::metrics::METRICS;
use crate::common::{
    mount_unit_name, parse_cidr, timestamp_now, validate_mount_path, validate_object_name, Error,
    NodeFailure, Result, RollbackStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const STEP_DISTRIBUTE: u8 = 2;
const STEP_RELOAD: u8 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MakeHaRequest {
    pub resource: String,
    #[serde(default)]
    pub mount: Option<HaMount>,
    #[serde(default)]
    pub services: Vec<String>,
    /// `address/prefix`
    #[serde(default)]
    pub vip: Option<String>,
}

pub fn plugin_id(resource: &str) -> String {
    format!("sds-ha-{}", resource)
}

pub fn config_path(dir: &Path, resource: &str) -> PathBuf {
    dir.join(format!("{}.toml", plugin_id(resource)))
}

/// Resource agent line that brings the service address up.
pub fn vip_agent(resource: &str, vip: &str) -> Result<String> {
    let (ip, prefix) = parse_cidr(vip)?;
    Ok(format!(
        "ocf:heartbeat:IPaddr2 sds_vip_{} ip={} cidr_netmask={}",
        resource, ip, prefix
    ))
}

fn service_unit(service: &str) -> String {
    if service.contains('.') {
        service.to_string()
    } else {
        format!("{}.service", service)
    }
}

fn quote(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}

/// Promoter configuration for one resource.
///
/// Start order is fixed: service address, mount, then services.
pub fn render_promoter_config(ha: &HaConfigRecord) -> Result<String> {
    let mut start = Vec::new();
    if let Some(vip) = &ha.vip {
        start.push(vip_agent(&ha.resource, vip)?);
    }
    if let Some(mount) = &ha.mount {
        start.push(mount_unit_name(&mount.path));
    }
    start.extend(ha.services.iter().map(|s| service_unit(s)));

    let list = |items: &[String]| {
        items
            .iter()
            .map(|s| quote(s))
            .collect::<Vec<_>>()
            .join(", ")
    };

    let lines = [
        "# managed by sds-controller, do not edit".to_string(),
        "[[promoter]]".to_string(),
        format!("id = {}", quote(&plugin_id(&ha.resource))),
        format!("[promoter.resources.{}]", quote(&ha.resource)),
        format!("start = [{}]", list(&start)),
        format!("preferred-nodes = [{}]", list(&ha.nodes)),
        "on-drbd-demote-failure = \"reboot-immediate\"".to_string(),
        "stop-services-on-exit = true".to_string(),
        "target-as = \"Requires\"".to_string(),
    ];
    let mut out = lines.join("\n");
    out.push('\n');
    Ok(out)
}

/// Service-manager unit mounting the resource's first volume.
pub fn render_mount_unit(resource: &ResourceRecord, mount: &HaMount) -> Result<String> {
    let volume = resource
        .volumes
        .first()
        .ok_or_else(|| Error::PreconditionFailed(format!("resource {} has no volumes", resource.name)))?;
    Ok(format!(
        "[Unit]\nDescription=sds-controller mount of {} at {}\n\n[Mount]\nWhat={}\nWhere={}\nType={}\nOptions=defaults\n",
        resource.name,
        mount.path,
        volume.device(),
        mount.path,
        mount.fstype
    ))
}

#[derive(Clone)]
pub struct HaManager {
    ctx: Arc<ClusterContext>,
}

impl HaManager {
    pub fn new(ctx: Arc<ClusterContext>) -> Self {
        Self { ctx }
    }

    pub fn get(&self, resource: &str) -> Result<HaConfigRecord> {
        self.ctx
            .ha_config(resource)?
            .ok_or_else(|| Error::NotFound(format!("HA configuration of {}", resource)))
    }

    pub fn list(&self) -> Result<Vec<HaConfigRecord>> {
        Ok(self
            .ctx
            .store
            .list_as::<HaConfigRecord>(keys::HA)?
            .into_iter()
            .map(|(h, _)| h)
            .collect())
    }

    fn validate(&self, req: &MakeHaRequest) -> Result<()> {
        validate_object_name("resource", &req.resource)?;
        if let Some(mount) = &req.mount {
            validate_mount_path(&mount.path)?;
            validate_object_name("filesystem type", &mount.fstype)?;
        }
        for service in &req.services {
            validate_object_name("service", service)?;
        }
        if let Some(vip) = &req.vip {
            parse_cidr(vip)?;
        }
        Ok(())
    }

    async fn check_ready_for_ha(&self, record: &ResourceRecord) -> Result<()> {
        if record.state != ResourceState::Ready {
            return Err(Error::PreconditionFailed(format!(
                "resource {} is not ready",
                record.name
            )));
        }
        for name in &record.nodes {
            let node = self.ctx.registry.get(name)?;
            if node.liveness != NodeLiveness::Healthy {
                return Err(Error::Unreachable {
                    node: name.clone(),
                    message: format!("node is {}", node.liveness),
                });
            }
            if !node.inventory.promoter_running {
                return Err(Error::PreconditionFailed(format!(
                    "promoter is not running on {}",
                    name
                )));
            }
        }
        if let Some(mount) = record.mounts.first() {
            return Err(Error::PreconditionFailed(format!(
                "{} is mounted at {} on {}; unmount it first",
                record.name, mount.path, mount.node
            )));
        }
        let observed = self.ctx.observe(record).await;
        let primaries = live_primaries(&observed);
        if !primaries.is_empty() {
            return Err(Error::PreconditionFailed(format!(
                "{} is Primary on {}; every node must be Secondary",
                record.name,
                primaries.join(", ")
            )));
        }
        Ok(())
    }

    pub async fn make_ha(&self, req: MakeHaRequest) -> Result<HaConfigRecord> {
        self.validate(&req)?;
        let ctx = self.ctx.clone();
        let guard = ctx.locks.acquire(&req.resource).await;
        let (record, _) = ctx.resource(&req.resource)?;
        if ctx.ha_config(&req.resource)?.is_some() {
            return Err(Error::AlreadyExists(format!(
                "HA configuration of {}",
                req.resource
            )));
        }
        if let Some(mount) = &req.mount {
            // the first volume's filesystem must match what the unit mounts
            if let Some(fs) = record.volumes.first().and_then(|v| v.filesystem.as_deref()) {
                if fs != mount.fstype {
                    return Err(Error::ConfigMismatch(format!(
                        "volume carries {} but the mount asks for {}",
                        fs, mount.fstype
                    )));
                }
            }
        }
        self.check_ready_for_ha(&record).await?;

        let ha = HaConfigRecord {
            schema_version: SCHEMA_VERSION,
            resource: req.resource.clone(),
            mount: req.mount.clone(),
            services: req.services.clone(),
            vip: req.vip.clone(),
            config_path: config_path(&ctx.config.promoter_config_dir, &req.resource)
                .to_string_lossy()
                .into_owned(),
            nodes: record.nodes.clone(),
            created_at: timestamp_now(),
            extra: Map::new(),
        };
        let config = render_promoter_config(&ha)?;
        let unit = match &ha.mount {
            Some(mount) => Some((mount_unit_name(&mount.path), render_mount_unit(&record, mount)?)),
            None => None,
        };

        let this = self.clone();
        let nodes = record.nodes.clone();
        ctx.run_workflow(WorkflowKind::MakeHa, &nodes, guard, move |scope| async move {
            let mut intent = this.ctx.intents.begin(
                WorkflowKind::MakeHa,
                &ha.resource,
                &ha.nodes,
                json!({ "config_path": ha.config_path, "unit": unit.as_ref().map(|(n, _)| n) }),
            )?;
            this.distribute(&scope, &mut intent, ha, config, unit).await
        })
        .await
    }

    async fn distribute(
        &self,
        scope: &WorkflowScope,
        intent: &mut IntentRecord,
        ha: HaConfigRecord,
        config: String,
        unit: Option<(String, String)>,
    ) -> Result<HaConfigRecord> {
        let nodes = ha.nodes.clone();
        let clients = self.ctx.clients(&nodes)?;
        let clients = &clients;
        let path = ha.config_path.as_str();
        let config = config.as_str();
        let unit = unit.as_ref();
        let mut progress = Progress::all(&nodes, 1);

        let result: Result<()> = async {
            self.ctx.intents.checkpoint(intent, STEP_DISTRIBUTE)?;
            scope.ensure_active()?;
            let report = fan_out(&nodes, scope.parallelism, &scope.cancel, |node| async move {
                let client = client_of(clients, &node)?;
                if let Some((name, content)) = unit {
                    client.unit_create(name, content).await?;
                }
                client.promoter_write_config(path, config).await
            })
            .await;
            progress.record(STEP_DISTRIBUTE, &report);
            fail_on_partial("promoter config distribution", report.failures())?;

            self.ctx.intents.checkpoint(intent, STEP_RELOAD)?;
            scope.ensure_active()?;
            let report = fan_out(&nodes, scope.parallelism, &scope.cancel, |node| async move {
                client_of(clients, &node)?.promoter_reload().await
            })
            .await;
            progress.record(STEP_RELOAD, &report);
            fail_on_partial("promoter reload", report.failures())
        }
        .await;

        match result {
            Ok(()) => {
                let mut ops = IntentLog::finish_ops(intent, IntentState::Completed, None)?;
                ops.push(TxnOp::put_if(keys::ha(&ha.resource), Expect::Absent, &ha)?);
                self.ctx.store.atomic(ops)?;
                tracing::info!(resource = %ha.resource, nodes = ?ha.nodes, "HA configuration active");
                Ok(ha)
            }
            Err(error) => {
                let error = scope.explain(error);
                if scope.shutting_down() {
                    self.ctx.interrupt_or_fail(intent, scope, &error);
                    return Err(error);
                }
                let written = progress.nodes_at(STEP_DISTRIBUTE);
                let tally = self
                    .withdraw(&written, path, unit.map(|(n, _)| n.as_str()), &CancellationToken::new())
                    .await;
                Err(self.close_rolled_back(intent, error, tally.status()))
            }
        }
    }

    /// Remove config and mount unit from `nodes`, then reload their promoter.
    async fn withdraw(
        &self,
        nodes: &[String],
        path: &str,
        unit: Option<&str>,
        cancel: &CancellationToken,
    ) -> UndoTally {
        let mut tally = UndoTally::default();
        let clients: BTreeMap<_, _> = nodes
            .iter()
            .filter_map(|n| self.ctx.client(n).ok().map(|c| (n.clone(), c)))
            .collect();
        let clients = &clients;
        let parallelism = self.ctx.parallelism(WorkflowKind::DeleteHa);

        let report = fan_out(nodes, parallelism, cancel, |node| async move {
            let client = client_of(clients, &node)?;
            ignore_missing(client.promoter_delete_config(path).await)?;
            if let Some(unit) = unit {
                ignore_missing(client.unit_delete(unit).await)?;
            }
            client.promoter_reload().await
        })
        .await;
        tally.absorb("promoter withdraw", report);
        tally
    }

    fn close_rolled_back(&self, intent: &mut IntentRecord, error: Error, mut status: RollbackStatus) -> Error {
        if let Err(e) = self
            .ctx
            .intents
            .finish(intent, IntentState::RolledBack, Some(error.to_string()))
        {
            tracing::error!(intent = %intent.id, error = %e, "cannot record rollback");
            status = RollbackStatus::Failed;
        }
        METRICS.record_rollback(status.as_str());
        tracing::warn!(resource = %intent.resource, rollback = status.as_str(), error = %error, "HA configuration rolled back");
        Error::RolledBack {
            error: Box::new(error),
            rollback: status,
        }
    }

    /// Withdraw the HA configuration. A majority of nodes must confirm.
    pub async fn delete_ha(&self, resource: &str) -> Result<()> {
        let ctx = self.ctx.clone();
        let guard = ctx.locks.acquire(resource).await;
        let ha = self.get(resource)?;

        let this = self.clone();
        let nodes = ha.nodes.clone();
        ctx.run_workflow(WorkflowKind::DeleteHa, &nodes, guard, move |scope| async move {
            let mut intent = this.ctx.intents.begin(
                WorkflowKind::DeleteHa,
                &ha.resource,
                &ha.nodes,
                json!({ "config_path": ha.config_path }),
            )?;
            this.drive_delete_ha(&scope, &mut intent, &ha).await
        })
        .await
    }

    async fn drive_delete_ha(&self, scope: &WorkflowScope, intent: &mut IntentRecord, ha: &HaConfigRecord) -> Result<()> {
        let unit = ha.mount.as_ref().map(|m| mount_unit_name(&m.path));
        let tally = self
            .withdraw(&ha.nodes, &ha.config_path, unit.as_deref(), &scope.cancel)
            .await;

        let majority = ha.nodes.len() / 2 + 1;
        if tally.ok < majority {
            let error = if scope.cancel.is_cancelled() {
                scope.explain(Error::Cancelled("HA delete cancelled".into()))
            } else {
                Error::PartialFailure {
                    message: format!(
                        "HA configuration of {} withdrawn from {} of {} nodes, {} needed",
                        ha.resource,
                        tally.ok,
                        ha.nodes.len(),
                        majority
                    ),
                    failures: tally.failures,
                }
            };
            self.ctx.interrupt_or_fail(intent, scope, &error);
            return Err(error);
        }
        if !tally.failures.is_empty() {
            tracing::warn!(resource = %ha.resource, failures = ?tally.failures, "HA configuration left on some nodes");
        }

        let mut ops = IntentLog::finish_ops(intent, IntentState::Completed, None)?;
        ops.push(TxnOp::delete(keys::ha(&ha.resource)));
        self.ctx.store.atomic(ops)?;
        tracing::info!(resource = %ha.resource, "HA configuration deleted");
        Ok(())
    }

    /// Undo interrupted make-HA runs and finish interrupted deletes.
    pub async fn recover(&self) -> Result<super::orchestrator::RecoveryReport> {
        let mut report = super::orchestrator::RecoveryReport::default();
        for mut intent in self.ctx.intents.incomplete()? {
            if !matches!(intent.kind, WorkflowKind::MakeHa | WorkflowKind::DeleteHa) {
                continue;
            }
            let id = intent.id.clone();
            let scope = WorkflowScope::detached(self.ctx.shutdown.clone(), self.ctx.parallelism(intent.kind));
            let _guard = self.ctx.locks.acquire(&intent.resource).await;
            let result = match intent.kind {
                WorkflowKind::MakeHa => self.recover_make(&mut intent).await.map(|rolled| {
                    if rolled {
                        report.rolled_back.push(id.clone())
                    } else {
                        report.resumed.push(id.clone())
                    }
                }),
                WorkflowKind::DeleteHa => match self.ctx.ha_config(&intent.resource) {
                    Ok(Some(ha)) => self
                        .drive_delete_ha(&scope, &mut intent, &ha)
                        .await
                        .map(|_| report.resumed.push(id.clone())),
                    Ok(None) => self
                        .ctx
                        .intents
                        .finish(&mut intent, IntentState::Completed, None)
                        .map(|_| report.resumed.push(id.clone())),
                    Err(e) => Err(e),
                },
                _ => Ok(()),
            };
            if let Err(e) = result {
                tracing::error!(intent = %id, error = %e, "HA recovery failed");
                report.failed.push(id);
            }
        }
        Ok(report)
    }

    async fn recover_make(&self, intent: &mut IntentRecord) -> Result<bool> {
        if self.ctx.ha_config(&intent.resource)?.is_some() {
            self.ctx.intents.finish(intent, IntentState::Completed, None)?;
            return Ok(false);
        }
        let path = intent.detail["config_path"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| {
                config_path(&self.ctx.config.promoter_config_dir, &intent.resource)
                    .to_string_lossy()
                    .into_owned()
            });
        let unit = intent.detail["unit"].as_str().map(str::to_string);
        let nodes = intent.nodes.clone();
        let tally = self
            .withdraw(&nodes, &path, unit.as_deref(), &CancellationToken::new())
            .await;
        let error = Error::Cancelled("controller restarted during make-HA".into());
        self.close_rolled_back(intent, error, tally.status());
        Ok(true)
    }
}

fn fail_on_partial(what: &str, failures: Vec<NodeFailure>) -> Result<()> {
    if failures.is_empty() {
        return Ok(());
    }
    // a lone cancellation keeps its own kind so shutdown and aborts are told apart
    if failures.iter().all(|f| f.kind == crate::ErrorKind::Cancelled) {
        return Err(Error::Cancelled(format!("{} cancelled", what)));
    }
    Err(Error::PartialFailure {
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
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ha() -> HaConfigRecord {
        HaConfigRecord {
            schema_version: SCHEMA_VERSION,
            resource: "r0".into(),
            mount: Some(HaMount {
                path: "/srv/data".into(),
                fstype: "ext4".into(),
            }),
            services: vec!["nfs-server".into(), "exporter.service".into()],
            vip: Some("10.0.0.50/24".into()),
            config_path: "/etc/drbd-reactor.d/sds-ha-r0.toml".into(),
            nodes: vec!["A".into(), "B".into()],
            created_at: 0,
            extra: Map::new(),
        }
    }

    #[test]
    fn test_start_list_order() {
        let text = render_promoter_config(&ha()).unwrap();
        assert!(text.contains(
            "start = [\"ocf:heartbeat:IPaddr2 sds_vip_r0 ip=10.0.0.50 cidr_netmask=24\", \"srv-data.mount\", \"nfs-server.service\", \"exporter.service\"]"
        ));
        assert!(text.contains("preferred-nodes = [\"A\", \"B\"]"));
        assert!(text.contains("id = \"sds-ha-r0\""));
    }

    #[test]
    fn test_config_is_valid_toml() {
        let text = render_promoter_config(&ha()).unwrap();
        let parsed = config::Config::builder()
            .add_source(config::File::from_str(&text, config::FileFormat::Toml))
            .build()
            .unwrap();
        let promoters: Vec<serde_json::Value> = parsed.get("promoter").unwrap();
        assert_eq!(promoters.len(), 1);
        assert_eq!(promoters[0]["id"], "sds-ha-r0");
        assert_eq!(
            promoters[0]["resources"]["r0"]["on-drbd-demote-failure"],
            "reboot-immediate"
        );
        assert_eq!(promoters[0]["resources"]["r0"]["stop-services-on-exit"], true);
    }

    #[test]
    fn test_without_vip_or_mount() {
        let mut ha = ha();
        ha.vip = None;
        ha.mount = None;
        ha.services = vec!["db".into()];
        let text = render_promoter_config(&ha).unwrap();
        assert!(text.contains("start = [\"db.service\"]"));
    }

    #[test]
    fn test_bad_vip_rejected() {
        assert!(vip_agent("r0", "10.0.0.50").is_err());
        assert!(vip_agent("r0", "10.0.0.50/40").is_err());
    }

    #[test]
    fn test_config_path() {
        let path = config_path(Path::new("/etc/drbd-reactor.d"), "r0");
        assert_eq!(path, PathBuf::from("/etc/drbd-reactor.d/sds-ha-r0.toml"));
    }

    #[test]
    fn test_partial_failure_detail() {
        let failures = vec![NodeFailure {
            node: "B".into(),
            kind: crate::ErrorKind::Internal,
            message: "reload failed".into(),
        }];
        let err = fail_on_partial("reload", failures).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::PartialFailure);
        assert_eq!(err.node_failures()[0].node, "B");
    }
}

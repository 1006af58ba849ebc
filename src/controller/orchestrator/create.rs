//! Create-resource workflow

use super::{client_of, ignore_existing, Orchestrator, Progress};
use crate::controller::backing;
use crate::controller::context::WorkflowScope;
use crate::controller::intent::IntentLog;
use crate::controller::placement::{BackingTarget, CreateRequest};
use crate::controller::records::{
    keys, IntentRecord, IntentState, ResourceRecord, ResourceState, Role, VolumeRecord, WorkflowKind,
    SCHEMA_VERSION,
};
use crate::controller::replication_config;
use crate::controller::store::{Expect, TxnOp};
use crate::common::{timestamp_now, Result};
use serde::{Deserialize, Serialize};
use serde_json::Map;
use std::collections::BTreeMap;

pub(crate) const STEP_PERSIST: u8 = 1;
pub(crate) const STEP_BACKING: u8 = 2;
pub(crate) const STEP_CONFIG: u8 = 3;
pub(crate) const STEP_METADATA: u8 = 4;
pub(crate) const STEP_BRING_UP: u8 = 5;
pub(crate) const STEP_INITIAL_SYNC: u8 = 6;
pub(crate) const STEP_FINISH: u8 = 7;

/// Parameters kept in the intent so recovery can resume or undo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct CreateDetail {
    pub target: BackingTarget,
}

impl Orchestrator {
    pub async fn create_resource(&self, req: CreateRequest) -> Result<ResourceRecord> {
        let ctx = self.ctx.clone();
        let guard = ctx.locks.acquire(&req.name).await;

        let (plan, intent, record) = {
            let _allocation = ctx.allocation.lock().await;
            let view = ctx.view()?;
            let plan = ctx.placement.plan_create(&req, &view)?;

            let record = ResourceRecord {
                schema_version: SCHEMA_VERSION,
                name: plan.name.clone(),
                port: plan.port,
                protocol: plan.protocol,
                storage: plan.target.storage,
                pool: plan.target.pool.clone(),
                nodes: plan.nodes.clone(),
                options: plan.options.clone(),
                volumes: vec![plan.volume.clone()],
                next_volume_id: plan.volume.id + 1,
                peers: BTreeMap::new(),
                mounts: Vec::new(),
                state: ResourceState::Provisioning,
                created_at: timestamp_now(),
                extra: Map::new(),
            };
            let detail = serde_json::to_value(CreateDetail {
                target: plan.target.clone(),
            })?;
            let mut intent =
                IntentLog::new_intent(WorkflowKind::CreateResource, &plan.name, &plan.nodes, detail);
            intent.checkpoint = STEP_PERSIST;

            ctx.store.atomic(vec![
                TxnOp::put_if(keys::resource(&record.name), Expect::Absent, &record)?,
                IntentLog::put_op(&intent)?,
            ])?;
            (plan, intent, record)
        };

        tracing::info!(
            resource = %record.name,
            port = record.port,
            nodes = ?record.nodes,
            size_gib = plan.volume.size_gib,
            intent = %intent.id,
            "creating resource"
        );

        let this = self.clone();
        let nodes = record.nodes.clone();
        ctx.run_workflow(WorkflowKind::CreateResource, &nodes, guard, move |scope| async move {
            // capacity stays promised until the pools are charged
            let _reservation = plan.reservation;
            let progress = Progress::all(&record.nodes, STEP_PERSIST);
            this.drive_create(&scope, intent, record, plan.target, progress)
                .await
        })
        .await
    }

    /// Run steps 2 to 7, or undo what was done when one fails.
    pub(crate) async fn drive_create(
        &self,
        scope: &WorkflowScope,
        mut intent: IntentRecord,
        mut record: ResourceRecord,
        target: BackingTarget,
        mut progress: Progress,
    ) -> Result<ResourceRecord> {
        match self
            .create_steps(scope, &mut intent, &mut record, &target, &mut progress)
            .await
        {
            Ok(()) => Ok(record),
            Err(error) => {
                let error = scope.explain(error);
                if scope.shutting_down() {
                    self.ctx.interrupt_or_fail(&mut intent, scope, &error);
                    return Err(error);
                }
                Err(self.undo_create(&mut intent, &record, &target, &progress, error).await)
            }
        }
    }

    async fn create_steps(
        &self,
        scope: &WorkflowScope,
        intent: &mut IntentRecord,
        record: &mut ResourceRecord,
        target: &BackingTarget,
        progress: &mut Progress,
    ) -> Result<()> {
        let name = record.name.clone();
        let name = name.as_str();
        let nodes = record.nodes.clone();
        let clients = self.ctx.clients(&nodes)?;
        let clients = &clients;
        let ops = backing::ops_for(target.storage);

        self.checkpoint(intent, STEP_BACKING)?;
        let volumes = &record.volumes;
        self.step(scope, progress, STEP_BACKING, &nodes, |node| async move {
            let client = client_of(clients, &node)?;
            for volume in volumes {
                ops.create(client, target, &VolumeRecord::lv_name(name, volume.id), volume.size_gib)
                    .await?;
            }
            Ok(())
        })
        .await?;

        self.checkpoint(intent, STEP_CONFIG)?;
        let config = replication_config::render(record, &self.ctx.node_records(&nodes)?)?;
        let config = config.as_str();
        self.step(scope, progress, STEP_CONFIG, &nodes, |node| async move {
            client_of(clients, &node)?
                .replication_write_config(name, config)
                .await
        })
        .await?;

        self.checkpoint(intent, STEP_METADATA)?;
        self.step(scope, progress, STEP_METADATA, &nodes, |node| async move {
            ignore_existing(client_of(clients, &node)?.replication_create_md(name, None).await)
        })
        .await?;

        self.checkpoint(intent, STEP_BRING_UP)?;
        self.step(scope, progress, STEP_BRING_UP, &nodes, |node| async move {
            ignore_existing(client_of(clients, &node)?.replication_up(name).await)
        })
        .await?;

        // the first node seeds the initial sync
        self.checkpoint(intent, STEP_INITIAL_SYNC)?;
        let syncer = nodes[0].clone();
        let syncer_client = client_of(clients, &syncer)?;
        scope.ensure_active()?;
        syncer_client.replication_promote(name, true).await?;
        progress.advance(std::slice::from_ref(&syncer), STEP_INITIAL_SYNC);
        let statuses = self.wait_consistent(scope, clients, name).await?;

        self.checkpoint(intent, STEP_FINISH)?;
        scope.ensure_active()?;
        syncer_client.replication_demote(name).await?;

        record.state = ResourceState::Ready;
        for node in &nodes {
            record.set_role(node, Role::Secondary);
            if let (Some(peer), Some(status)) = (record.peers.get_mut(node), statuses.get(node)) {
                peer.disk_state = status.disk_state.clone();
                peer.replication_state = status.replication_state.clone();
            }
        }

        let consumed = record.total_size_gib() as i64;
        let key = keys::resource(name);
        let committed: &ResourceRecord = record;
        self.commit_with_pools(&nodes, &committed.pool, consumed, || {
            let mut ops = IntentLog::finish_ops(intent, IntentState::Completed, None)?;
            ops.push(TxnOp::put(key.clone(), committed)?);
            Ok(ops)
        })?;
        if let Err(e) = self.ctx.intents.prune() {
            tracing::warn!(error = %e, "intent pruning failed");
        }
        tracing::info!(resource = %name, "resource ready");
        Ok(())
    }

    /// Remove what the failed create left behind and close its intent.
    ///
    /// The provisioning record goes away only when every undo call worked;
    /// otherwise it stays so a later delete can finish the cleanup.
    pub(crate) async fn undo_create(
        &self,
        intent: &mut IntentRecord,
        record: &ResourceRecord,
        target: &BackingTarget,
        progress: &Progress,
        error: crate::common::Error,
    ) -> crate::common::Error {
        let never = tokio_util::sync::CancellationToken::new();
        let tally = self
            .teardown(record, &record.volumes, target, progress, &never)
            .await;
        let status = tally.status();

        let mut extra = Vec::new();
        if status == crate::common::RollbackStatus::Complete {
            extra.push(TxnOp::delete(keys::resource(&record.name)));
        }
        self.rolled_back(intent, error, status, extra)
    }
}

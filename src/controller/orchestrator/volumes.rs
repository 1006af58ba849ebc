//! Add, remove and resize volumes of an existing resource

use super::{client_of, ignore_existing, ignore_missing, live_primaries, Orchestrator, Progress, UndoTally};
use crate::controller::backing;
use crate::controller::context::WorkflowScope;
use crate::controller::intent::IntentLog;
use crate::controller::placement::BackingTarget;
use crate::controller::records::{
    keys, GatewayRecord, IntentRecord, IntentState, ResourceRecord, ResourceState, SnapshotRecord,
    VolumeRecord, WorkflowKind,
};
use crate::controller::replication_config;
use crate::controller::store::{Expect, TxnOp};
use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

const STEP_BACKING: u8 = 2;
const STEP_CONFIG: u8 = 3;
const STEP_METADATA: u8 = 4;
pub(crate) const STEP_ADJUST: u8 = 5;
const STEP_SYNC: u8 = 6;

const STEP_SHRINK_CONFIG: u8 = 2;
const STEP_DETACH: u8 = 3;
const STEP_DROP_BACKING: u8 = 4;

const STEP_EXTEND: u8 = 2;
const STEP_GROW_DEVICE: u8 = 3;
const STEP_GROW_FS: u8 = 4;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct AddVolumeDetail {
    pub volume: VolumeRecord,
    pub target: BackingTarget,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RemoveVolumeDetail {
    pub volume_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ResizeDetail {
    pub volume_id: u32,
    pub new_size_gib: u64,
    pub target: BackingTarget,
}

fn require_ready(record: &ResourceRecord) -> Result<()> {
    if record.state != ResourceState::Ready {
        return Err(Error::PreconditionFailed(format!(
            "resource {} is {:?}, not ready",
            record.name, record.state
        )));
    }
    Ok(())
}

impl Orchestrator {
    // === Add ===

    pub async fn add_volume(&self, resource: &str, size_gib: u64) -> Result<VolumeRecord> {
        let ctx = self.ctx.clone();
        let guard = ctx.locks.acquire(resource).await;
        self.check_seedable(resource).await?;

        let (plan, intent, record) = {
            let _allocation = ctx.allocation.lock().await;
            let (mut record, revision) = ctx.resource(resource)?;
            require_ready(&record)?;
            let view = ctx.view()?;
            let plan = ctx.placement.plan_add_volume(&record, size_gib, &view)?;

            // the id is spent even if the workflow rolls back
            record.next_volume_id = plan.volume.id + 1;
            let detail = serde_json::to_value(AddVolumeDetail {
                volume: plan.volume.clone(),
                target: plan.target.clone(),
            })?;
            let mut intent =
                IntentLog::new_intent(WorkflowKind::AddVolume, resource, &record.nodes, detail);
            intent.checkpoint = 1;
            ctx.store.atomic(vec![
                TxnOp::put_if(keys::resource(resource), Expect::Revision(revision), &record)?,
                IntentLog::put_op(&intent)?,
            ])?;
            (plan, intent, record)
        };

        tracing::info!(
            resource = %resource,
            volume = plan.volume.id,
            size_gib,
            intent = %intent.id,
            "adding volume"
        );

        let this = self.clone();
        let nodes = record.nodes.clone();
        ctx.run_workflow(WorkflowKind::AddVolume, &nodes, guard, move |scope| async move {
            let _reservation = plan.reservation;
            let progress = Progress::all(&record.nodes, 1);
            this.drive_add_volume(&scope, intent, record, plan.volume, plan.target, progress)
                .await
        })
        .await
    }

    pub(crate) async fn drive_add_volume(
        &self,
        scope: &WorkflowScope,
        mut intent: IntentRecord,
        record: ResourceRecord,
        volume: VolumeRecord,
        target: BackingTarget,
        mut progress: Progress,
    ) -> Result<VolumeRecord> {
        let mut seeded_by = None;
        let result = self
            .add_volume_steps(scope, &mut intent, &record, &volume, &target, &mut progress, &mut seeded_by)
            .await;
        match result {
            Ok(()) => Ok(volume),
            Err(error) => {
                let error = scope.explain(error);
                if scope.shutting_down() {
                    self.ctx.interrupt_or_fail(&mut intent, scope, &error);
                    return Err(error);
                }
                let tally = self
                    .undo_add_volume(&record, &volume, &target, &progress, seeded_by.as_deref())
                    .await;
                Err(self.rolled_back(&mut intent, error, tally.status(), Vec::new()))
            }
        }
    }

    /// The promoter owns the roles of an HA resource, so a new volume can
    /// only be seeded through the Primary it already runs.
    async fn check_seedable(&self, resource: &str) -> Result<()> {
        if self.ctx.ha_config(resource)?.is_none() {
            return Ok(());
        }
        let (record, _) = self.ctx.resource(resource)?;
        let observed = self.ctx.observe(&record).await;
        match live_primaries(&observed).len() {
            1 => Ok(()),
            n => Err(Error::PreconditionFailed(format!(
                "HA resource {} has {} active primaries; a new volume needs exactly one",
                resource, n
            ))),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn add_volume_steps(
        &self,
        scope: &WorkflowScope,
        intent: &mut IntentRecord,
        record: &ResourceRecord,
        volume: &VolumeRecord,
        target: &BackingTarget,
        progress: &mut Progress,
        seeded_by: &mut Option<String>,
    ) -> Result<()> {
        let name = record.name.as_str();
        let nodes = record.nodes.clone();
        let clients = self.ctx.clients(&nodes)?;
        let clients = &clients;
        let ops = backing::ops_for(target.storage);
        let lv = VolumeRecord::lv_name(name, volume.id);
        let lv = lv.as_str();

        let mut grown = record.clone();
        grown.volumes.push(volume.clone());

        self.checkpoint(intent, STEP_BACKING)?;
        self.step(scope, progress, STEP_BACKING, &nodes, |node| async move {
            ops.create(client_of(clients, &node)?, target, lv, volume.size_gib)
                .await
        })
        .await?;

        self.checkpoint(intent, STEP_CONFIG)?;
        let config = replication_config::render(&grown, &self.ctx.node_records(&nodes)?)?;
        let config = config.as_str();
        self.step(scope, progress, STEP_CONFIG, &nodes, |node| async move {
            client_of(clients, &node)?
                .replication_write_config(name, config)
                .await
        })
        .await?;

        self.checkpoint(intent, STEP_METADATA)?;
        let id = volume.id;
        self.step(scope, progress, STEP_METADATA, &nodes, |node| async move {
            ignore_existing(client_of(clients, &node)?.replication_create_md(name, Some(id)).await)
        })
        .await?;

        self.checkpoint(intent, STEP_ADJUST)?;
        self.step(scope, progress, STEP_ADJUST, &nodes, |node| async move {
            client_of(clients, &node)?.replication_adjust(name).await
        })
        .await?;

        // a current primary seeds the new volume; otherwise the first node does
        // briefly. HA resources never see a forced promote.
        self.checkpoint(intent, STEP_SYNC)?;
        let governed = self.ctx.ha_config(name)?.is_some();
        let observed = self.ctx.observe(record).await;
        let primary = live_primaries(&observed).into_iter().next();
        let syncer = match (&primary, governed) {
            (Some(p), _) => p.clone(),
            (None, false) => nodes[0].clone(),
            (None, true) => {
                return Err(Error::PreconditionFailed(format!(
                    "HA resource {} lost its active node before volume {} was seeded",
                    name, volume.id
                )))
            }
        };
        let syncer_client = client_of(clients, &syncer)?;
        scope.ensure_active()?;
        syncer_client.replication_promote(name, !governed).await?;
        if primary.is_none() {
            *seeded_by = Some(syncer.clone());
        }
        progress.advance(std::slice::from_ref(&syncer), STEP_SYNC);
        self.wait_consistent(scope, clients, name).await?;
        if primary.is_none() {
            scope.ensure_active()?;
            syncer_client.replication_demote(name).await?;
            *seeded_by = None;
        }

        let consumed = volume.size_gib as i64;
        let key = keys::resource(name);
        self.commit_with_pools(&nodes, &record.pool, consumed, || {
            // re-read so the commit keeps changes made under the same lock
            let (mut current, revision) = self.ctx.resource(name)?;
            if current.volume(volume.id).is_none() {
                current.volumes.push(volume.clone());
            }
            current.next_volume_id = current.next_volume_id.max(volume.id + 1);
            let mut ops = IntentLog::finish_ops(intent, IntentState::Completed, None)?;
            ops.push(TxnOp::put_if(key.clone(), Expect::Revision(revision), &current)?);
            Ok(ops)
        })?;
        if let Err(e) = self.ctx.intents.prune() {
            tracing::warn!(error = %e, "intent pruning failed");
        }
        tracing::info!(resource = %name, volume = volume.id, "volume added");
        Ok(())
    }

    pub(crate) async fn undo_add_volume(
        &self,
        record: &ResourceRecord,
        volume: &VolumeRecord,
        target: &BackingTarget,
        progress: &Progress,
        seeded_by: Option<&str>,
    ) -> UndoTally {
        let mut tally = UndoTally::default();
        let never = CancellationToken::new();
        let name = record.name.as_str();
        let parallelism = self.ctx.parallelism(WorkflowKind::AddVolume);
        let clients = self.clients_lenient(&record.nodes);
        let clients = &clients;

        if let Some(node) = seeded_by {
            let result = match client_of(clients, node) {
                Ok(client) => client.replication_demote(name).await,
                Err(e) => Err(e),
            };
            tally.note("demote", node, result);
        }

        // restore the config without the new volume, then detach it
        let configured = progress.nodes_at(STEP_CONFIG);
        if !configured.is_empty() {
            match self
                .ctx
                .node_records(&record.nodes)
                .and_then(|nodes| replication_config::render(record, &nodes))
            {
                Ok(config) => {
                    let config = config.as_str();
                    let report = crate::controller::fanout::fan_out(&configured, parallelism, &never, |node| async move {
                        let client = client_of(clients, &node)?;
                        client.replication_write_config(name, config).await?;
                        client.replication_adjust(name).await
                    })
                    .await;
                    tally.absorb("config restore", report);
                }
                Err(e) => {
                    for node in &configured {
                        tally.failures.push(e.node_failure(node));
                    }
                }
            }
        }

        let backed = progress.nodes_at(STEP_BACKING);
        let ops = backing::ops_for(target.storage);
        let lv = VolumeRecord::lv_name(name, volume.id);
        let lv = lv.as_str();
        let report = crate::controller::fanout::fan_out(&backed, parallelism, &never, |node| async move {
            ops.remove(client_of(clients, &node)?, target, lv).await
        })
        .await;
        tally.absorb("backing removal", report);
        tally
    }

    // === Remove ===

    pub async fn remove_volume(&self, resource: &str, volume_id: u32) -> Result<()> {
        let ctx = self.ctx.clone();
        let guard = ctx.locks.acquire(resource).await;
        let (record, _) = ctx.resource(resource)?;
        require_ready(&record)?;
        self.check_removable(&record, volume_id)?;

        let detail = serde_json::to_value(RemoveVolumeDetail { volume_id })?;
        let this = self.clone();
        let nodes = record.nodes.clone();
        ctx.run_workflow(WorkflowKind::RemoveVolume, &nodes, guard, move |scope| async move {
            let mut intent =
                this.ctx
                    .intents
                    .begin(WorkflowKind::RemoveVolume, &record.name, &record.nodes, detail)?;
            this.drive_remove_volume(&scope, &mut intent, record, volume_id)
                .await
        })
        .await
    }

    fn check_removable(&self, record: &ResourceRecord, volume_id: u32) -> Result<()> {
        if record.volume(volume_id).is_none() {
            return Err(Error::NotFound(format!(
                "volume {} of resource {}",
                volume_id, record.name
            )));
        }
        if record.volumes.len() == 1 {
            return Err(Error::PreconditionFailed(format!(
                "volume {} is the last volume of {}; delete the resource instead",
                volume_id, record.name
            )));
        }
        if let Some(mount) = record.mounts.iter().find(|m| m.volume == volume_id) {
            return Err(Error::PreconditionFailed(format!(
                "volume {} is mounted at {} on {}",
                volume_id, mount.path, mount.node
            )));
        }
        let snapshots = self
            .ctx
            .store
            .list_as::<SnapshotRecord>(&keys::snapshots_of(&record.name))?;
        if let Some((snap, _)) = snapshots.iter().find(|(s, _)| s.volume == volume_id) {
            return Err(Error::PreconditionFailed(format!(
                "volume {} has snapshot {} on {}",
                volume_id, snap.name, snap.node
            )));
        }
        let gateways = self.ctx.store.list_as::<GatewayRecord>(keys::GATEWAYS)?;
        if let Some((gw, _)) = gateways
            .iter()
            .find(|(g, _)| g.resource == record.name && g.volume == volume_id)
        {
            return Err(Error::PreconditionFailed(format!(
                "gateway {} exports volume {}",
                gw.name, volume_id
            )));
        }
        Ok(())
    }

    /// Detach the volume from replication, then drop its backing volume.
    /// Every step tolerates having run before.
    pub(crate) async fn drive_remove_volume(
        &self,
        scope: &WorkflowScope,
        intent: &mut IntentRecord,
        record: ResourceRecord,
        volume_id: u32,
    ) -> Result<()> {
        let mut progress = Progress::all(&record.nodes, 1);
        let result = self
            .remove_volume_steps(scope, intent, &record, volume_id, &mut progress)
            .await;
        let Err(error) = result else {
            return Ok(());
        };
        let error = scope.explain(error);
        if scope.shutting_down() {
            self.ctx.interrupt_or_fail(intent, scope, &error);
            return Err(error);
        }
        let dropped = progress.nodes_at(STEP_DROP_BACKING);
        if !dropped.is_empty() {
            // the volume is gone from replication everywhere and its data from
            // some nodes; nothing left to restore it from
            let tally = self.settle_dropped_volume(intent, &record, volume_id, &dropped);
            return Err(self.rolled_back(intent, error, tally.status(), Vec::new()));
        }
        let tally = self.undo_remove_volume(&record, &progress).await;
        Err(self.rolled_back(intent, error, tally.status(), Vec::new()))
    }

    async fn remove_volume_steps(
        &self,
        scope: &WorkflowScope,
        intent: &mut IntentRecord,
        record: &ResourceRecord,
        volume_id: u32,
        progress: &mut Progress,
    ) -> Result<()> {
        let name = record.name.as_str();
        let nodes = record.nodes.clone();
        let clients = self.ctx.clients(&nodes)?;
        let clients = &clients;
        let view = self.ctx.view()?;
        let target = self.ctx.placement.target_of(record, &view)?;
        let target = &target;
        let ops = backing::ops_for(target.storage);

        let Some(removed) = record.volume(volume_id).cloned() else {
            return Err(Error::NotFound(format!("volume {} of resource {}", volume_id, name)));
        };
        let mut shrunk = record.clone();
        shrunk.volumes.retain(|v| v.id != volume_id);

        self.checkpoint(intent, STEP_SHRINK_CONFIG)?;
        let config = replication_config::render(&shrunk, &self.ctx.node_records(&nodes)?)?;
        let config = config.as_str();
        self.step(scope, progress, STEP_SHRINK_CONFIG, &nodes, |node| async move {
            client_of(clients, &node)?
                .replication_write_config(name, config)
                .await
        })
        .await?;

        self.checkpoint(intent, STEP_DETACH)?;
        self.step(scope, progress, STEP_DETACH, &nodes, |node| async move {
            client_of(clients, &node)?.replication_adjust(name).await
        })
        .await?;

        self.checkpoint(intent, STEP_DROP_BACKING)?;
        let lv = VolumeRecord::lv_name(name, volume_id);
        let lv = lv.as_str();
        self.step(scope, progress, STEP_DROP_BACKING, &nodes, |node| async move {
            ignore_missing(ops.remove(client_of(clients, &node)?, target, lv).await)
        })
        .await?;

        let key = keys::resource(name);
        self.commit_with_pools(&nodes, &record.pool, -(removed.size_gib as i64), || {
            let (mut current, revision) = self.ctx.resource(name)?;
            current.volumes.retain(|v| v.id != volume_id);
            let mut ops = IntentLog::finish_ops(intent, IntentState::Completed, None)?;
            ops.push(TxnOp::put_if(key.clone(), Expect::Revision(revision), &current)?);
            Ok(ops)
        })?;
        if let Err(e) = self.ctx.intents.prune() {
            tracing::warn!(error = %e, "intent pruning failed");
        }
        tracing::info!(resource = %name, volume = volume_id, returned_gib = removed.size_gib, "volume removed");
        Ok(())
    }

    /// Put the full config back on every node that got the shrunk one and
    /// reattach the volume there.
    async fn undo_remove_volume(&self, record: &ResourceRecord, progress: &Progress) -> UndoTally {
        let mut tally = UndoTally::default();
        let configured = progress.nodes_at(STEP_SHRINK_CONFIG);
        if configured.is_empty() {
            return tally;
        }
        let never = CancellationToken::new();
        let name = record.name.as_str();
        let parallelism = self.ctx.parallelism(WorkflowKind::RemoveVolume);
        let clients = self.clients_lenient(&record.nodes);
        let clients = &clients;
        match self
            .ctx
            .node_records(&record.nodes)
            .and_then(|nodes| replication_config::render(record, &nodes))
        {
            Ok(config) => {
                let config = config.as_str();
                let report = crate::controller::fanout::fan_out(&configured, parallelism, &never, |node| async move {
                    let client = client_of(clients, &node)?;
                    client.replication_write_config(name, config).await?;
                    client.replication_adjust(name).await
                })
                .await;
                tally.absorb("config restore", report);
            }
            Err(e) => {
                for node in &configured {
                    tally.failures.push(e.node_failure(node));
                }
            }
        }
        tally
    }

    /// Record a volume whose backing removal failed part way. The volume
    /// leaves the record; capacity comes back only where the backing volume
    /// is confirmed gone, and every other node is reported as a failure.
    fn settle_dropped_volume(
        &self,
        intent: &IntentRecord,
        record: &ResourceRecord,
        volume_id: u32,
        dropped: &[String],
    ) -> UndoTally {
        let mut tally = UndoTally::default();
        let size = record.volume(volume_id).map(|v| v.size_gib).unwrap_or(0) as i64;
        let key = keys::resource(&record.name);
        let committed = self.commit_with_pools(dropped, &record.pool, -size, || {
            let (mut current, revision) = self.ctx.resource(&record.name)?;
            current.volumes.retain(|v| v.id != volume_id);
            Ok(vec![TxnOp::put_if(key.clone(), Expect::Revision(revision), &current)?])
        });
        let lv = VolumeRecord::lv_name(&record.name, volume_id);
        for node in &record.nodes {
            let result = match &committed {
                Err(e) => Err(Error::Internal(format!("cannot record removal: {}", e))),
                Ok(_) if dropped.contains(node) => Ok(()),
                Ok(_) => Err(Error::Internal(format!("backing volume {} left behind", lv))),
            };
            tally.note("volume removal", node, result);
        }
        tracing::warn!(
            intent = %intent.id,
            resource = %record.name,
            volume = volume_id,
            "volume detached with backing left on some nodes"
        );
        tally
    }

    // === Resize ===

    pub async fn resize_volume(&self, resource: &str, volume_id: u32, new_size_gib: u64) -> Result<VolumeRecord> {
        let ctx = self.ctx.clone();
        let guard = ctx.locks.acquire(resource).await;
        let (record, _) = ctx.resource(resource)?;
        require_ready(&record)?;
        let view = ctx.view()?;
        let plan = ctx.placement.plan_resize(&record, volume_id, new_size_gib, &view)?;

        tracing::info!(
            resource = %resource,
            volume = volume_id,
            from_gib = plan.old_size_gib,
            to_gib = plan.new_size_gib,
            "resizing volume"
        );

        let detail = serde_json::to_value(ResizeDetail {
            volume_id,
            new_size_gib,
            target: plan.target.clone(),
        })?;
        let this = self.clone();
        let nodes = record.nodes.clone();
        ctx.run_workflow(WorkflowKind::ResizeVolume, &nodes, guard, move |scope| async move {
            let _reservation = plan.reservation;
            let mut intent =
                this.ctx
                    .intents
                    .begin(WorkflowKind::ResizeVolume, &record.name, &record.nodes, detail)?;
            this.drive_resize(&scope, &mut intent, record, volume_id, new_size_gib, plan.target)
                .await
        })
        .await
    }

    /// Grow backing volumes, then the replicated device, then an online
    /// filesystem when exactly one node has it in use.
    pub(crate) async fn drive_resize(
        &self,
        scope: &WorkflowScope,
        intent: &mut IntentRecord,
        record: ResourceRecord,
        volume_id: u32,
        new_size_gib: u64,
        target: BackingTarget,
    ) -> Result<VolumeRecord> {
        let mut progress = Progress::all(&record.nodes, 1);
        let result = self
            .resize_steps(scope, intent, &record, volume_id, new_size_gib, &target, &mut progress)
            .await;
        result.map_err(|error| {
            let error = scope.explain(error);
            if scope.shutting_down() {
                self.ctx.interrupt_or_fail(intent, scope, &error);
                return error;
            }
            // backing volumes do not shrink; nodes that grew keep the larger size
            let mut tally = UndoTally::default();
            for node in &record.nodes {
                let result = if progress.nodes_at(STEP_EXTEND).contains(node) {
                    Err(Error::Internal(format!(
                        "backing of volume {} stays at {} GiB",
                        volume_id, new_size_gib
                    )))
                } else {
                    Ok(())
                };
                tally.note("resize", node, result);
            }
            self.rolled_back(intent, error, tally.status(), Vec::new())
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn resize_steps(
        &self,
        scope: &WorkflowScope,
        intent: &mut IntentRecord,
        record: &ResourceRecord,
        volume_id: u32,
        new_size_gib: u64,
        target: &BackingTarget,
        progress: &mut Progress,
    ) -> Result<VolumeRecord> {
        let name = record.name.as_str();
        let nodes = record.nodes.clone();
        let clients = self.ctx.clients(&nodes)?;
        let clients = &clients;
        let ops = backing::ops_for(target.storage);
        let volume = record
            .volume(volume_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("volume {} of resource {}", volume_id, name)))?;
        let lv = VolumeRecord::lv_name(name, volume_id);
        let lv = lv.as_str();

        self.checkpoint(intent, STEP_EXTEND)?;
        self.step(scope, progress, STEP_EXTEND, &nodes, |node| async move {
            ops.extend(client_of(clients, &node)?, target, lv, new_size_gib)
                .await
        })
        .await?;

        self.checkpoint(intent, STEP_GROW_DEVICE)?;
        let observed = self.ctx.observe(record).await;
        let primaries = live_primaries(&observed);
        let resizer = primaries.first().cloned().unwrap_or_else(|| nodes[0].clone());
        scope.ensure_active()?;
        client_of(clients, &resizer)?
            .replication_resize(name, volume_id)
            .await?;

        self.checkpoint(intent, STEP_GROW_FS)?;
        if let Some(fstype) = &volume.filesystem {
            match primaries.as_slice() {
                [primary] => {
                    let mount = record
                        .mounts
                        .iter()
                        .find(|m| m.node == *primary && m.volume == volume_id)
                        .map(|m| m.path.as_str());
                    scope.ensure_active()?;
                    client_of(clients, primary)?
                        .fs_grow(&volume.device(), fstype, mount)
                        .await?;
                }
                _ => tracing::warn!(
                    resource = %name,
                    volume = volume_id,
                    primaries = primaries.len(),
                    "filesystem not grown: needs exactly one primary"
                ),
            }
        }

        let delta = new_size_gib.saturating_sub(volume.size_gib) as i64;
        let key = keys::resource(name);
        let mut grown = volume.clone();
        grown.size_gib = new_size_gib;
        self.commit_with_pools(&nodes, &record.pool, delta, || {
            let (mut current, revision) = self.ctx.resource(name)?;
            if let Some(v) = current.volume_mut(volume_id) {
                v.size_gib = new_size_gib;
            }
            let mut ops = IntentLog::finish_ops(intent, IntentState::Completed, None)?;
            ops.push(TxnOp::put_if(key.clone(), Expect::Revision(revision), &current)?);
            Ok(ops)
        })?;
        if let Err(e) = self.ctx.intents.prune() {
            tracing::warn!(error = %e, "intent pruning failed");
        }
        tracing::info!(resource = %name, volume = volume_id, size_gib = new_size_gib, "volume resized");
        Ok(grown)
    }
}

//! Delete-resource workflow

use super::{live_primaries, Orchestrator, Progress};
use crate::controller::context::WorkflowScope;
use crate::controller::intent::IntentLog;
use crate::controller::records::{
    keys, GatewayRecord, IntentRecord, IntentState, ResourceRecord, ResourceState, WorkflowKind,
};
use crate::controller::store::TxnOp;
use crate::common::{Error, Result};
use serde_json::json;

impl Orchestrator {
    pub async fn delete_resource(&self, name: &str) -> Result<()> {
        let ctx = self.ctx.clone();
        let guard = ctx.locks.acquire(name).await;
        let (record, _) = ctx.resource(name)?;
        self.check_deletable(&record).await?;

        let this = self.clone();
        let nodes = record.nodes.clone();
        ctx.run_workflow(WorkflowKind::DeleteResource, &nodes, guard, move |scope| async move {
            let mut intent = this.begin_delete(&record)?;
            this.drive_delete(&scope, &mut intent, record).await
        })
        .await
    }

    async fn check_deletable(&self, record: &ResourceRecord) -> Result<()> {
        let name = &record.name;
        if self.ctx.ha_config(name)?.is_some() {
            return Err(Error::PreconditionFailed(format!(
                "resource {} has an HA configuration; delete it first",
                name
            )));
        }
        if !self.ctx.store.list_prefix(&keys::snapshots_of(name)).is_empty() {
            return Err(Error::PreconditionFailed(format!(
                "resource {} still has snapshots",
                name
            )));
        }
        let gateways = self.ctx.store.list_as::<GatewayRecord>(keys::GATEWAYS)?;
        if let Some((gw, _)) = gateways.iter().find(|(g, _)| g.resource == *name) {
            return Err(Error::PreconditionFailed(format!(
                "gateway {} exports resource {}",
                gw.name, name
            )));
        }
        if let Some(mount) = record.mounts.first() {
            return Err(Error::PreconditionFailed(format!(
                "volume {} is mounted at {} on {}",
                mount.volume, mount.path, mount.node
            )));
        }
        let observed = self.ctx.observe(record).await;
        let primaries = live_primaries(&observed);
        if !primaries.is_empty() {
            return Err(Error::PreconditionFailed(format!(
                "resource {} is Primary on {}; demote it first",
                name,
                primaries.join(", ")
            )));
        }
        Ok(())
    }

    /// Record the intent and mark a ready resource as deleting.
    fn begin_delete(&self, record: &ResourceRecord) -> Result<IntentRecord> {
        let mut intent = IntentLog::new_intent(
            WorkflowKind::DeleteResource,
            &record.name,
            &record.nodes,
            json!({ "state": record.state }),
        );
        intent.checkpoint = 1;
        let mut ops = vec![IntentLog::put_op(&intent)?];
        if record.state == ResourceState::Ready {
            let mut deleting = record.clone();
            deleting.state = ResourceState::Deleting;
            ops.push(TxnOp::put(keys::resource(&record.name), &deleting)?);
        }
        self.ctx.store.atomic(ops)?;
        Ok(intent)
    }

    /// Tear the resource down everywhere, then drop its record and give the
    /// pools their capacity back. Safe to repeat.
    pub(crate) async fn drive_delete(
        &self,
        scope: &WorkflowScope,
        intent: &mut IntentRecord,
        record: ResourceRecord,
    ) -> Result<()> {
        let view = self.ctx.view()?;
        let target = match self.ctx.placement.target_of(&record, &view) {
            Ok(t) => t,
            Err(e) => {
                self.ctx.interrupt_or_fail(intent, scope, &e);
                return Err(e);
            }
        };

        let progress = Progress::all(&record.nodes, super::create::STEP_FINISH);
        let tally = self
            .teardown(&record, &record.volumes, &target, &progress, &scope.cancel)
            .await;

        if !tally.failures.is_empty() {
            let error = if scope.cancel.is_cancelled() {
                scope.explain(Error::Cancelled("delete cancelled".into()))
            } else {
                Error::PartialFailure {
                    message: format!(
                        "delete of {} failed on {} node call(s); retry to finish",
                        record.name,
                        tally.failures.len()
                    ),
                    failures: tally.failures,
                }
            };
            self.ctx.interrupt_or_fail(intent, scope, &error);
            return Err(error);
        }

        // capacity was only charged once the resource became ready
        let returned = match record.state {
            ResourceState::Provisioning => 0,
            ResourceState::Ready | ResourceState::Deleting => record.total_size_gib() as i64,
        };
        let key = keys::resource(&record.name);
        self.commit_with_pools(&record.nodes, &record.pool, -returned, || {
            let mut ops = IntentLog::finish_ops(intent, IntentState::Completed, None)?;
            ops.push(TxnOp::delete(key.clone()));
            Ok(ops)
        })?;
        if let Err(e) = self.ctx.intents.prune() {
            tracing::warn!(error = %e, "intent pruning failed");
        }
        tracing::info!(resource = %record.name, returned_gib = returned, "resource deleted");
        Ok(())
    }
}

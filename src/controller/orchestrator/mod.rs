//! Resource Orchestrator
//!
//! Every mutating workflow holds the resource's lock for its whole run,
//! records an intent before the first node call and advances its checkpoint
//! before each step. Node-facing steps fan out with bounded parallelism and
//! act as barriers: the next step starts only when every node finished.

mod create;
mod delete;
mod recovery;
mod roles;
mod volumes;

pub use recovery::RecoveryReport;
pub use roles::{NodeStatus, ResourceStatus};

use super::agent_client::{NodeAgentClient, ReplicationStatus};
use super::backing;
use super::context::{ClusterContext, WorkflowScope};
use super::fanout::{fan_out, StepReport};
use super::intent::IntentLog;
use super::placement::BackingTarget;
use super::records::{keys, IntentRecord, ResourceRecord, Role, VolumeRecord};
use super::store::TxnOp;
use crate::common::metrics::METRICS;
use crate::common::{timestamp_now, Error, NodeFailure, Result, RollbackStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct Orchestrator {
    ctx: Arc<ClusterContext>,
}

impl Orchestrator {
    pub fn new(ctx: Arc<ClusterContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<ClusterContext> {
        &self.ctx
    }

    pub fn get(&self, name: &str) -> Result<ResourceRecord> {
        self.ctx.resource(name).map(|(r, _)| r)
    }

    pub fn list(&self) -> Result<Vec<ResourceRecord>> {
        Ok(self
            .ctx
            .store
            .list_as::<ResourceRecord>(keys::RESOURCES)?
            .into_iter()
            .map(|(r, _)| r)
            .collect())
    }

    /// One barriered step across `nodes`; the first failure ends the step.
    async fn step<T, F, Fut>(
        &self,
        scope: &WorkflowScope,
        progress: &mut Progress,
        step: u8,
        nodes: &[String],
        f: F,
    ) -> Result<Vec<(String, T)>>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        scope.ensure_active()?;
        let report = fan_out(nodes, scope.parallelism, &scope.cancel, f).await;
        progress.record(step, &report);
        if !report.is_complete() {
            tracing::warn!(step, failures = ?report.failures(), "workflow step failed");
        }
        report.into_result().map_err(|e| scope.explain(e))
    }

    fn checkpoint(&self, intent: &mut IntentRecord, step: u8) -> Result<()> {
        tracing::debug!(intent = %intent.id, resource = %intent.resource, step, "checkpoint");
        self.ctx.intents.checkpoint(intent, step)
    }

    /// Poll until every node reports a consistent disk, within `sync_wait`.
    async fn wait_consistent(
        &self,
        scope: &WorkflowScope,
        clients: &BTreeMap<String, NodeAgentClient>,
        resource: &str,
    ) -> Result<BTreeMap<String, ReplicationStatus>> {
        let timeouts = self.ctx.timeouts();
        let deadline = tokio::time::Instant::now() + timeouts.sync_wait();
        let nodes: Vec<String> = clients.keys().cloned().collect();

        loop {
            let report = fan_out(&nodes, scope.parallelism, &scope.cancel, |node| async move {
                client_of(clients, &node)?.replication_status(resource).await
            })
            .await;
            let statuses = report.into_result().map_err(|e| scope.explain(e))?;
            if statuses.iter().all(|(_, s)| s.is_consistent()) {
                return Ok(statuses.into_iter().collect());
            }
            if tokio::time::Instant::now() >= deadline {
                let lagging: Vec<&str> = statuses
                    .iter()
                    .filter(|(_, s)| !s.is_consistent())
                    .map(|(n, _)| n.as_str())
                    .collect();
                return Err(Error::Timeout(format!(
                    "initial sync of {} did not finish within {}s on {}",
                    resource,
                    timeouts.sync_wait().as_secs(),
                    lagging.join(", ")
                )));
            }
            scope.sleep(timeouts.poll_interval()).await?;
        }
    }

    /// Best-effort removal of everything a resource put on its nodes.
    ///
    /// Phases follow `progress`: teardown where bring-up was reached, config
    /// removal where the config was written, backing removal where backing
    /// creation started. Missing objects count as removed.
    async fn teardown(
        &self,
        resource: &ResourceRecord,
        volumes: &[VolumeRecord],
        target: &BackingTarget,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> UndoTally {
        let mut tally = UndoTally::default();
        let name = resource.name.as_str();
        let parallelism = self.ctx.parallelism(super::records::WorkflowKind::DeleteResource);
        let clients = self.clients_lenient(&resource.nodes);
        let clients = &clients;

        let down = progress.nodes_at(create::STEP_BRING_UP);
        let report = fan_out(&down, parallelism, cancel, |node| async move {
            ignore_missing(client_of(clients, &node)?.replication_down(name).await)
        })
        .await;
        tally.absorb("replication down", report);

        let configured = progress.nodes_at(create::STEP_CONFIG);
        let report = fan_out(&configured, parallelism, cancel, |node| async move {
            ignore_missing(client_of(clients, &node)?.replication_delete_config(name).await)
        })
        .await;
        tally.absorb("config removal", report);

        let backed = progress.nodes_at(create::STEP_BACKING);
        let ops = backing::ops_for(target.storage);
        let report = fan_out(&backed, parallelism, cancel, |node| async move {
            let client = client_of(clients, &node)?;
            for volume in volumes {
                ops.remove(client, target, &VolumeRecord::lv_name(name, volume.id))
                    .await?;
            }
            Ok(())
        })
        .await;
        tally.absorb("backing removal", report);

        tally
    }

    /// Clients for the nodes that are still registered.
    fn clients_lenient(&self, nodes: &[String]) -> BTreeMap<String, NodeAgentClient> {
        nodes
            .iter()
            .filter_map(|n| match self.ctx.client(n) {
                Ok(c) => Some((n.clone(), c)),
                Err(e) => {
                    tracing::warn!(node = %n, error = %e, "no client for node");
                    None
                }
            })
            .collect()
    }

    fn commit_with_pools(
        &self,
        nodes: &[String],
        pool: &str,
        consumed: i64,
        ops: impl FnMut() -> Result<Vec<TxnOp>>,
    ) -> Result<u64> {
        self.ctx.commit_with_pools(nodes, pool, consumed, ops)
    }

    /// Close a failed workflow as rolled back and wrap the original error.
    fn rolled_back(
        &self,
        intent: &mut IntentRecord,
        error: Error,
        mut status: RollbackStatus,
        extra_ops: Vec<TxnOp>,
    ) -> Error {
        let message = error.to_string();
        let committed = IntentLog::finish_ops(intent, super::records::IntentState::RolledBack, Some(message))
            .and_then(|mut ops| {
                ops.extend(extra_ops);
                self.ctx.store.atomic(ops)
            });
        if let Err(e) = committed {
            tracing::error!(intent = %intent.id, error = %e, "cannot record rollback");
            status = RollbackStatus::Failed;
        } else if let Err(e) = self.ctx.intents.prune() {
            tracing::warn!(error = %e, "intent pruning failed");
        }
        METRICS.record_rollback(status.as_str());
        tracing::warn!(
            intent = %intent.id,
            resource = %intent.resource,
            rollback = status.as_str(),
            error = %error,
            "workflow rolled back"
        );
        Error::RolledBack {
            error: Box::new(error),
            rollback: status,
        }
    }
}

pub(crate) fn client_of<'a>(
    clients: &'a BTreeMap<String, NodeAgentClient>,
    node: &str,
) -> Result<&'a NodeAgentClient> {
    clients
        .get(node)
        .ok_or_else(|| Error::NotFound(format!("node {}", node)))
}

pub(crate) fn ignore_missing(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

pub(crate) fn ignore_existing(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_already_exists() => Ok(()),
        other => other,
    }
}

/// Fold observed replication status into the resource's peer table.
pub(crate) fn apply_observed(
    record: &mut ResourceRecord,
    observed: &BTreeMap<String, Result<ReplicationStatus>>,
) {
    let now = timestamp_now();
    for (node, status) in observed {
        let entry = record.peers.entry(node.clone()).or_default();
        match status {
            Ok(s) => {
                entry.role = s.role;
                entry.disk_state = s.disk_state.clone();
                entry.replication_state = s.replication_state.clone();
            }
            Err(_) => {
                // a silent Primary stays Primary until observed otherwise
                if entry.role != Role::Primary {
                    entry.role = Role::Unknown;
                }
                entry.replication_state = None;
            }
        }
        entry.updated_at = now;
    }
}

/// Live primaries among the nodes that answered
pub(crate) fn live_primaries(observed: &BTreeMap<String, Result<ReplicationStatus>>) -> Vec<String> {
    observed
        .iter()
        .filter(|(_, s)| matches!(s, Ok(s) if s.role == Role::Primary))
        .map(|(n, _)| n.clone())
        .collect()
}

/// Highest step each node reached in the running workflow
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct Progress {
    reached: BTreeMap<String, u8>,
}

impl Progress {
    pub fn all(nodes: &[String], step: u8) -> Self {
        Self {
            reached: nodes.iter().map(|n| (n.clone(), step)).collect(),
        }
    }

    pub fn advance(&mut self, nodes: &[String], step: u8) {
        for node in nodes {
            let entry = self.reached.entry(node.clone()).or_insert(0);
            *entry = (*entry).max(step);
        }
    }

    /// Fold in a step's outcome. A call that timed out or was cancelled may
    /// still have taken effect, so its node counts as having reached the step.
    pub fn record<T>(&mut self, step: u8, report: &StepReport<T>) {
        let mut nodes = report.succeeded_nodes();
        nodes.extend(
            report
                .failed
                .iter()
                .filter(|(_, e)| {
                    matches!(
                        e.kind(),
                        crate::ErrorKind::Timeout | crate::ErrorKind::Cancelled | crate::ErrorKind::Unreachable
                    )
                })
                .map(|(n, _)| n.clone()),
        );
        self.advance(&nodes, step);
    }

    pub fn nodes_at(&self, step: u8) -> Vec<String> {
        self.reached
            .iter()
            .filter(|(_, s)| **s >= step)
            .map(|(n, _)| n.clone())
            .collect()
    }
}

/// Outcome of best-effort undo calls
#[derive(Debug, Default)]
pub(crate) struct UndoTally {
    pub ok: usize,
    pub failures: Vec<NodeFailure>,
}

impl UndoTally {
    pub fn absorb<T>(&mut self, what: &str, report: StepReport<T>) {
        self.ok += report.succeeded.len();
        for (node, error) in report.failed {
            tracing::warn!(node = %node, phase = what, error = %error, "undo call failed");
            self.failures.push(error.node_failure(&node));
        }
    }

    pub fn note(&mut self, what: &str, node: &str, result: Result<()>) {
        match result {
            Ok(()) => self.ok += 1,
            Err(error) => {
                tracing::warn!(node = %node, phase = what, error = %error, "undo call failed");
                self.failures.push(error.node_failure(node));
            }
        }
    }

    pub fn status(&self) -> RollbackStatus {
        if self.failures.is_empty() {
            RollbackStatus::Complete
        } else if self.ok == 0 {
            RollbackStatus::Failed
        } else {
            RollbackStatus::Partial
        }
    }
}

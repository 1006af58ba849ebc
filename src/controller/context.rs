//! Shared state for all controller services and the workflow runner

use super::agent_client::{AgentConnector, NodeAgentClient, ReplicationStatus};
use super::intent::IntentLog;
use super::locks::{ResourceGuard, ResourceLocks};
use super::placement::{ClusterView, Placement};
use super::records::{
    keys, HaConfigRecord, IntentRecord, NodeLiveness, NodeRecord, PoolRecord, ResourceRecord,
    WorkflowKind,
};
use super::registry::NodeRegistry;
use super::store::{Expect, StateStore, TxnOp};
use crate::common::metrics::METRICS;
use crate::common::{ControllerConfig, Error, Result, TimeoutConfig};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

/// Attempts at a commit that races with another pool writer
const COMMIT_ATTEMPTS: usize = 3;

pub struct ClusterContext {
    pub config: Arc<ControllerConfig>,
    pub store: Arc<StateStore>,
    pub registry: Arc<NodeRegistry>,
    pub placement: Placement,
    pub locks: Arc<ResourceLocks>,
    pub intents: IntentLog,
    /// Held while allocating ports and minors up to the first persist
    pub allocation: tokio::sync::Mutex<()>,
    pub shutdown: CancellationToken,
}

impl ClusterContext {
    pub fn new(
        config: Arc<ControllerConfig>,
        store: Arc<StateStore>,
        connector: Arc<dyn AgentConnector>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let registry = Arc::new(NodeRegistry::new(
            Arc::clone(&store),
            connector,
            config.health.clone(),
            config.workflows.timeouts.clone(),
            config.agent_port,
        ));
        let intents = IntentLog::new(Arc::clone(&store), config.intent_retention);
        Arc::new(Self {
            config,
            store,
            registry,
            placement: Placement::new(),
            locks: ResourceLocks::new(),
            intents,
            allocation: tokio::sync::Mutex::new(()),
            shutdown,
        })
    }

    pub fn timeouts(&self) -> &TimeoutConfig {
        &self.config.workflows.timeouts
    }

    pub fn parallelism(&self, kind: WorkflowKind) -> usize {
        self.config.workflows.parallelism_for(kind.as_str())
    }

    pub fn client(&self, node: &str) -> Result<NodeAgentClient> {
        self.registry.client(node)
    }

    pub fn clients(&self, nodes: &[String]) -> Result<BTreeMap<String, NodeAgentClient>> {
        nodes
            .iter()
            .map(|n| Ok((n.clone(), self.registry.client(n)?)))
            .collect()
    }

    pub fn view(&self) -> Result<ClusterView> {
        let mut view = ClusterView::load(&self.store)?;
        // minors promised to volumes still being added
        for intent in self.intents.incomplete()? {
            if intent.kind == WorkflowKind::AddVolume {
                if let Some(minor) = intent.detail["volume"]["minor"].as_u64() {
                    view.pending_minors.insert(minor as u32);
                }
            }
        }
        Ok(view)
    }

    /// Commit `ops` together with a free-capacity change on `pool` of every
    /// node. Positive `consumed` takes capacity, negative returns it.
    pub(crate) fn commit_with_pools(
        &self,
        nodes: &[String],
        pool: &str,
        consumed: i64,
        mut ops: impl FnMut() -> Result<Vec<TxnOp>>,
    ) -> Result<u64> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut txn = ops()?;
            for node in nodes {
                let key = keys::pool(node, pool);
                let Some((mut record, revision)) = self.store.get_as::<PoolRecord>(&key)? else {
                    tracing::warn!(node = %node, pool = %pool, "pool record missing, capacity not adjusted");
                    continue;
                };
                record.free_gib = if consumed >= 0 {
                    record.free_gib.saturating_sub(consumed as u64)
                } else {
                    record.free_gib.saturating_add(consumed.unsigned_abs())
                };
                txn.push(TxnOp::put_if(key, Expect::Revision(revision), &record)?);
            }
            match self.store.atomic(txn) {
                Err(e @ Error::ConflictStale { .. }) if attempt < COMMIT_ATTEMPTS => {
                    tracing::debug!(error = %e, attempt, "retrying commit");
                }
                other => return other,
            }
        }
    }

    pub fn resource(&self, name: &str) -> Result<(ResourceRecord, u64)> {
        self.store
            .get_as::<ResourceRecord>(&keys::resource(name))?
            .ok_or_else(|| Error::NotFound(format!("resource {}", name)))
    }

    pub fn ha_config(&self, resource: &str) -> Result<Option<HaConfigRecord>> {
        Ok(self
            .store
            .get_as::<HaConfigRecord>(&keys::ha(resource))?
            .map(|(h, _)| h))
    }

    pub fn node_records(&self, names: &[String]) -> Result<BTreeMap<String, NodeRecord>> {
        names
            .iter()
            .map(|n| Ok((n.clone(), self.registry.get(n)?)))
            .collect()
    }

    /// Live replication status of every node; unreachable nodes are not called.
    pub async fn observe(&self, res: &ResourceRecord) -> BTreeMap<String, Result<ReplicationStatus>> {
        let calls = res.nodes.iter().map(|node| async move {
            let result = match self.registry.get(node) {
                Ok(record) if record.liveness == NodeLiveness::Unreachable => Err(Error::Unreachable {
                    node: node.clone(),
                    message: "node is unreachable".into(),
                }),
                Ok(_) => match self.registry.client(node) {
                    Ok(client) => client.replication_status(&res.name).await,
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            };
            (node.clone(), result)
        });
        futures_util::future::join_all(calls).await.into_iter().collect()
    }

    /// Run a workflow body in its own task, holding `guard` until it ends.
    ///
    /// Dropping the returned future (caller gone) cancels the workflow, which
    /// then rolls back. Process shutdown cancels it too; bodies check
    /// [`WorkflowScope::shutting_down`] to leave the intent interrupted instead.
    pub async fn run_workflow<T, F, Fut>(
        self: &Arc<Self>,
        kind: WorkflowKind,
        nodes: &[String],
        guard: ResourceGuard,
        body: F,
    ) -> Result<T>
    where
        F: FnOnce(WorkflowScope) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let cancel = self.shutdown.child_token();
        let scope = WorkflowScope {
            cancel: cancel.clone(),
            shutdown: self.shutdown.clone(),
            abort: Arc::new(Mutex::new(None)),
            parallelism: self.parallelism(kind),
        };

        let deadline = match kind {
            WorkflowKind::CreateResource => Some(self.timeouts().create_total()),
            _ => None,
        };
        self.spawn_watcher(&scope, nodes, deadline);

        let resource = guard.name().to_string();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            METRICS.workflows_in_flight.inc();
            let start = Instant::now();

            let result = body(scope).await;

            METRICS.workflows_in_flight.dec();
            METRICS.record_workflow(kind.as_str(), start.elapsed(), result.is_ok());
            match &result {
                Ok(_) => tracing::info!(
                    workflow = kind.as_str(),
                    resource = %resource,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "workflow completed"
                ),
                Err(e) => tracing::warn!(
                    workflow = kind.as_str(),
                    resource = %resource,
                    kind = %e.kind(),
                    error = %e,
                    "workflow failed"
                ),
            }
            result
        });

        let _cancel_on_drop = cancel.drop_guard();
        match handle.await {
            Ok(result) => result,
            Err(e) => Err(Error::Internal(format!("workflow task failed: {}", e))),
        }
    }

    fn spawn_watcher(&self, scope: &WorkflowScope, nodes: &[String], deadline: Option<Duration>) {
        let mut events = self.registry.subscribe();
        let nodes = nodes.to_vec();
        let cancel = scope.cancel.clone();
        let abort = Arc::clone(&scope.abort);

        tokio::spawn(async move {
            let timer = async {
                match deadline {
                    Some(d) => tokio::time::sleep(d).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::pin!(timer);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = &mut timer => {
                        if let Some(d) = deadline {
                            abort.lock().get_or_insert(AbortReason::Deadline(d));
                        }
                        cancel.cancel();
                        break;
                    }
                    event = events.recv() => match event {
                        Ok(event) if event.to == NodeLiveness::Unreachable && nodes.contains(&event.node) => {
                            abort.lock().get_or_insert(AbortReason::NodeLost(event.node.clone()));
                            cancel.cancel();
                            break;
                        }
                        Ok(_) | Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        });
    }

    /// Put an intent aside for the next start, or close it as failed.
    pub fn interrupt_or_fail(&self, intent: &mut IntentRecord, scope: &WorkflowScope, error: &Error) {
        let result = if scope.shutting_down() {
            self.intents.mark_interrupted(intent)
        } else {
            self.intents.finish(
                intent,
                super::records::IntentState::Failed,
                Some(error.to_string()),
            )
        };
        if let Err(e) = result {
            tracing::error!(intent = %intent.id, error = %e, "cannot record workflow outcome");
        }
    }
}

#[derive(Debug, Clone)]
enum AbortReason {
    NodeLost(String),
    Deadline(Duration),
}

/// Cancellation view handed to a running workflow
#[derive(Clone)]
pub struct WorkflowScope {
    pub cancel: CancellationToken,
    shutdown: CancellationToken,
    abort: Arc<Mutex<Option<AbortReason>>>,
    pub parallelism: usize,
}

impl WorkflowScope {
    /// Detached scope for work outside a runner (recovery, tests)
    pub fn detached(shutdown: CancellationToken, parallelism: usize) -> Self {
        Self {
            cancel: shutdown.child_token(),
            shutdown,
            abort: Arc::new(Mutex::new(None)),
            parallelism,
        }
    }

    pub fn shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn ensure_active(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(self.explain(Error::Cancelled("workflow cancelled".into())))
        } else {
            Ok(())
        }
    }

    /// Replace a bare cancellation with the reason the workflow was stopped.
    pub fn explain(&self, error: Error) -> Error {
        if error.kind() != crate::ErrorKind::Cancelled {
            return error;
        }
        if self.shutting_down() {
            return Error::Cancelled("controller shutting down".into());
        }
        match self.abort.lock().clone() {
            Some(AbortReason::NodeLost(node)) => Error::Unreachable {
                node,
                message: "node became unreachable during the workflow".into(),
            },
            Some(AbortReason::Deadline(d)) => {
                Error::Timeout(format!("workflow exceeded {}s", d.as_secs()))
            }
            None => error,
        }
    }

    /// Sleep that ends early on cancellation.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(self.explain(Error::Cancelled("workflow cancelled".into()))),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

//! Workflow intent log
//!
//! A workflow writes its intent before the first node call, advances the
//! checkpoint as steps complete, and ends with a completion record written in
//! the same transaction as the intent's final state. Intent ids sort
//! chronologically.

use super::records::{keys, CompletionRecord, IntentRecord, IntentState, WorkflowKind, SCHEMA_VERSION};
use super::store::{StateStore, TxnOp};
use crate::common::{generate_workflow_id, timestamp_now, timestamp_now_millis, Result};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

pub struct IntentLog {
    store: Arc<StateStore>,
    retention: usize,
}

impl IntentLog {
    pub fn new(store: Arc<StateStore>, retention: usize) -> Self {
        Self { store, retention }
    }

    pub fn new_intent(kind: WorkflowKind, resource: &str, nodes: &[String], detail: Value) -> IntentRecord {
        let now = timestamp_now();
        IntentRecord {
            schema_version: SCHEMA_VERSION,
            id: format!(
                "{:016}-{:08}-{}",
                timestamp_now_millis(),
                SEQUENCE.fetch_add(1, Ordering::Relaxed) % 100_000_000,
                generate_workflow_id()
            ),
            kind,
            resource: resource.to_string(),
            nodes: nodes.to_vec(),
            checkpoint: 0,
            state: IntentState::Running,
            detail,
            started_at: now,
            updated_at: now,
            extra: Map::new(),
        }
    }

    /// Operation that persists the intent as it stands.
    pub fn put_op(intent: &IntentRecord) -> Result<TxnOp> {
        TxnOp::put(keys::intent(&intent.id), intent)
    }

    pub fn begin(&self, kind: WorkflowKind, resource: &str, nodes: &[String], detail: Value) -> Result<IntentRecord> {
        let intent = Self::new_intent(kind, resource, nodes, detail);
        self.store.atomic(vec![Self::put_op(&intent)?])?;
        tracing::debug!(intent = %intent.id, kind = kind.as_str(), resource = %resource, "intent recorded");
        Ok(intent)
    }

    /// Record that `step` has been reached.
    pub fn checkpoint(&self, intent: &mut IntentRecord, step: u8) -> Result<()> {
        intent.checkpoint = step;
        intent.updated_at = timestamp_now();
        self.store.atomic(vec![Self::put_op(intent)?])?;
        Ok(())
    }

    /// Operations closing the intent; commit them with the workflow's final state change.
    pub fn finish_ops(intent: &mut IntentRecord, outcome: IntentState, message: Option<String>) -> Result<Vec<TxnOp>> {
        intent.state = outcome;
        intent.updated_at = timestamp_now();
        let completion = CompletionRecord {
            schema_version: SCHEMA_VERSION,
            id: intent.id.clone(),
            kind: intent.kind,
            resource: intent.resource.clone(),
            outcome,
            message,
            finished_at: intent.updated_at,
            extra: Map::new(),
        };
        Ok(vec![
            Self::put_op(intent)?,
            TxnOp::put(keys::completion(&intent.id), &completion)?,
        ])
    }

    pub fn finish(&self, intent: &mut IntentRecord, outcome: IntentState, message: Option<String>) -> Result<()> {
        let ops = Self::finish_ops(intent, outcome, message)?;
        self.store.atomic(ops)?;
        if let Err(e) = self.prune() {
            tracing::warn!(error = %e, "intent pruning failed");
        }
        Ok(())
    }

    pub fn mark_interrupted(&self, intent: &mut IntentRecord) -> Result<()> {
        intent.state = IntentState::Interrupted;
        intent.updated_at = timestamp_now();
        self.store.atomic(vec![Self::put_op(intent)?])?;
        tracing::warn!(intent = %intent.id, checkpoint = intent.checkpoint, "workflow interrupted");
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<IntentRecord>> {
        Ok(self.store.get_as(&keys::intent(id))?.map(|(i, _)| i))
    }

    pub fn list(&self) -> Result<Vec<IntentRecord>> {
        Ok(self
            .store
            .list_as::<IntentRecord>(keys::INTENTS)?
            .into_iter()
            .map(|(i, _)| i)
            .collect())
    }

    /// Intents without a completion, oldest first.
    pub fn incomplete(&self) -> Result<Vec<IntentRecord>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|i| !i.state.is_terminal())
            .collect())
    }

    pub fn completion(&self, id: &str) -> Result<Option<CompletionRecord>> {
        Ok(self.store.get_as(&keys::completion(id))?.map(|(c, _)| c))
    }

    /// Drop the oldest finished intents beyond the retention count.
    ///
    /// An intent and its completion are always removed together.
    pub fn prune(&self) -> Result<usize> {
        let finished: Vec<IntentRecord> = self
            .list()?
            .into_iter()
            .filter(|i| i.state.is_terminal())
            .collect();
        if finished.len() <= self.retention {
            return Ok(0);
        }

        let excess = finished.len() - self.retention;
        let mut ops = Vec::with_capacity(excess * 2);
        for intent in finished.iter().take(excess) {
            ops.push(TxnOp::delete(keys::intent(&intent.id)));
            ops.push(TxnOp::delete(keys::completion(&intent.id)));
        }
        self.store.atomic(ops)?;
        tracing::debug!(pruned = excess, "pruned finished intents");
        Ok(excess)
    }
}

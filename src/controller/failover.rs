//! Failover Coordinator
//!
//! Moves an HA resource off its active node through the promoter. Roles of an
//! HA resource are never changed directly.

use super::context::ClusterContext;
use super::ha::plugin_id;
use super::orchestrator::{apply_observed, live_primaries};
use super::records::{keys, NodeLiveness, Role};
use super::store::Expect;
use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvictOutcome {
    pub resource: String,
    pub from: String,
    pub to: String,
    pub elapsed_ms: u64,
}

/// Strict majority of `total`
pub fn has_quorum(reachable: usize, total: usize) -> bool {
    reachable > total / 2
}

pub struct FailoverCoordinator {
    ctx: Arc<ClusterContext>,
}

impl FailoverCoordinator {
    pub fn new(ctx: Arc<ClusterContext>) -> Self {
        Self { ctx }
    }

    fn reachable(&self, nodes: &[String]) -> Vec<String> {
        nodes
            .iter()
            .filter(|n| {
                self.ctx
                    .registry
                    .liveness(n)
                    .map(|l| l != NodeLiveness::Unreachable)
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    /// Ask reachable nodes which one the promoter runs the resource on.
    async fn active_node(&self, plugin: &str, nodes: &[String]) -> Option<String> {
        for node in nodes {
            let Ok(client) = self.ctx.client(node) else {
                continue;
            };
            match client.promoter_active_node(plugin).await {
                Ok(Some(active)) => return Some(active),
                Ok(None) => {}
                Err(e) => tracing::debug!(node = %node, error = %e, "active node query failed"),
            }
        }
        None
    }

    pub async fn evict(&self, resource: &str) -> Result<EvictOutcome> {
        let _guard = self.ctx.locks.acquire(resource).await;
        let (record, revision) = self.ctx.resource(resource)?;
        let ha = self.ctx.ha_config(resource)?.ok_or_else(|| {
            Error::PreconditionFailed(format!("{} is not highly available", resource))
        })?;
        let plugin = plugin_id(resource);

        let reachable = self.reachable(&ha.nodes);
        let active = match self.active_node(&plugin, &reachable).await {
            Some(active) => active,
            None => live_primaries(&self.ctx.observe(&record).await)
                .into_iter()
                .next()
                .ok_or_else(|| {
                    Error::PreconditionFailed(format!("{} is not active on any node", resource))
                })?,
        };
        let peers: Vec<String> = reachable.iter().filter(|n| **n != active).cloned().collect();
        if peers.is_empty() {
            return Err(Error::NoPeer(format!(
                "no reachable node can take over {} from {}",
                resource, active
            )));
        }

        if !has_quorum(reachable.len(), ha.nodes.len()) {
            return Err(Error::NoQuorum(format!(
                "only {} of {} nodes of {} are reachable",
                reachable.len(),
                ha.nodes.len(),
                resource
            )));
        }

        tracing::info!(resource = %resource, from = %active, peers = ?peers, "evicting");
        let start = Instant::now();
        self.ctx.client(&active)?.promoter_evict(&plugin).await?;

        let timeouts = self.ctx.timeouts();
        let deadline = start + timeouts.evict();
        let to = loop {
            if let Some(now_active) = self.active_node(&plugin, &reachable).await {
                if now_active != active && peers.contains(&now_active) {
                    break now_active;
                }
            }

            let observed = self.ctx.observe(&record).await;
            let original_demoted = matches!(observed.get(&active), Some(Ok(s)) if s.role != Role::Primary);
            if original_demoted {
                if let Some(peer) = live_primaries(&observed).into_iter().find(|n| peers.contains(n)) {
                    break peer;
                }
            }

            if Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "{} did not move off {} within {}s",
                    resource,
                    active,
                    timeouts.evict().as_secs()
                )));
            }
            tokio::select! {
                _ = self.ctx.shutdown.cancelled() => {
                    return Err(Error::Cancelled("controller shutting down".into()));
                }
                _ = tokio::time::sleep(timeouts.poll_interval()) => {}
            }
        };

        let mut record = record;
        let observed = self.ctx.observe(&record).await;
        apply_observed(&mut record, &observed);
        record.claim_primary(&to);
        if let Err(e) = self
            .ctx
            .store
            .put_if(&keys::resource(resource), Expect::Revision(revision), &record)
        {
            tracing::warn!(resource = %resource, error = %e, "roles not refreshed after evict");
        }

        let elapsed_ms = start.elapsed().as_millis() as u64;
        tracing::info!(resource = %resource, from = %active, to = %to, elapsed_ms, "evicted");
        Ok(EvictOutcome {
            resource: resource.to_string(),
            from: active,
            to,
            elapsed_ms,
        })
    }
}

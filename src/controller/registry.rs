//! Node registry and health monitor
//!
//! Nodes are admitted only after a synchronous probe. A background task probes
//! every node each interval; liveness follows [`next_liveness`] and every
//! transition is broadcast as a [`NodeEvent`].

use super::agent_client::{AgentConnector, NodeAgentClient, ProbeReport};
use super::records::{keys, Inventory, NodeLiveness, NodeRecord, PoolRecord, ResourceRecord};
use super::store::{Expect, StateStore};
use crate::common::metrics::METRICS;
use crate::common::{timestamp_now, validate_object_name, Error, HealthConfig, Result, TimeoutConfig};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Liveness transition of one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEvent {
    pub node: String,
    pub from: NodeLiveness,
    pub to: NodeLiveness,
}

/// Result of one probe, as returned by the health-check RPC
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeHealth {
    pub node: String,
    pub liveness: NodeLiveness,
    pub inventory: Inventory,
    #[serde(default)]
    pub error: Option<String>,
}

/// Liveness after a probe.
///
/// `probe` is `Some(driver_loaded)` on success and `None` on failure;
/// `failures` is the consecutive failure count including this probe.
pub fn next_liveness(
    current: NodeLiveness,
    failures: u32,
    threshold: u32,
    probe: Option<bool>,
) -> NodeLiveness {
    match probe {
        Some(true) => NodeLiveness::Healthy,
        Some(false) => NodeLiveness::Degraded,
        None if failures >= threshold => NodeLiveness::Unreachable,
        None => current,
    }
}

fn inventory_from(report: &ProbeReport) -> Inventory {
    Inventory {
        replication_version: report.replication_version.clone(),
        promoter_version: report.promoter_version.clone(),
        promoter_running: report.promoter_running,
        agent_pack_installed: report.agent_pack_installed,
        agents: report.agents.clone(),
        zfs_available: report.zfs_available,
    }
}

pub struct NodeRegistry {
    store: Arc<StateStore>,
    connector: Arc<dyn AgentConnector>,
    health: HealthConfig,
    timeouts: TimeoutConfig,
    default_agent_port: u16,
    failures: Mutex<HashMap<String, u32>>,
    events: broadcast::Sender<NodeEvent>,
}

impl NodeRegistry {
    pub fn new(
        store: Arc<StateStore>,
        connector: Arc<dyn AgentConnector>,
        health: HealthConfig,
        timeouts: TimeoutConfig,
        default_agent_port: u16,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            store,
            connector,
            health,
            timeouts,
            default_agent_port,
            failures: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Register a node after a successful probe.
    pub async fn register(
        &self,
        name: &str,
        address: &str,
        agent_port: Option<u16>,
    ) -> Result<NodeRecord> {
        validate_object_name("node", name)?;
        if address.trim().is_empty() || address.contains('/') || address.contains(' ') {
            return Err(Error::InvalidArgument(format!(
                "invalid node address '{}'",
                address
            )));
        }
        let agent_port = agent_port.unwrap_or(self.default_agent_port);
        if agent_port == 0 {
            return Err(Error::InvalidArgument("agent port cannot be 0".into()));
        }

        if self.store.get(&keys::node(name)).is_some() {
            return Err(Error::AlreadyExists(format!("node {}", name)));
        }

        let mut record = NodeRecord::new(name, address, agent_port);
        let report = self
            .client_for(&record)
            .probe(self.health.probe_timeout())
            .await?;

        record.inventory = inventory_from(&report);
        record.liveness = next_liveness(NodeLiveness::Unknown, 0, 1, Some(report.replication_loaded));
        record.last_seen = Some(timestamp_now());

        self.store.put_if(&keys::node(name), Expect::Absent, &record)?;
        self.failures.lock().insert(name.to_string(), 0);
        self.emit(name, NodeLiveness::Unknown, record.liveness);

        tracing::info!(
            node = %name,
            address = %record.endpoint(),
            liveness = %record.liveness,
            "node registered"
        );
        Ok(record)
    }

    /// Remove a node that no pool or resource references.
    pub fn unregister(&self, name: &str) -> Result<()> {
        let (_, revision) = self.get_versioned(name)?;

        let pools: Vec<(PoolRecord, u64)> = self.store.list_as(&keys::pools_of(name))?;
        if !pools.is_empty() {
            return Err(Error::PreconditionFailed(format!(
                "node {} still hosts {} pool(s)",
                name,
                pools.len()
            )));
        }

        let resources: Vec<(ResourceRecord, u64)> = self.store.list_as(keys::RESOURCES)?;
        if let Some((res, _)) = resources.iter().find(|(r, _)| r.has_node(name)) {
            return Err(Error::PreconditionFailed(format!(
                "node {} is part of resource {}",
                name, res.name
            )));
        }

        self.store
            .delete_if(&keys::node(name), Expect::Revision(revision))?;
        self.failures.lock().remove(name);
        tracing::info!(node = %name, "node unregistered");
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<NodeRecord> {
        self.get_versioned(name).map(|(node, _)| node)
    }

    fn get_versioned(&self, name: &str) -> Result<(NodeRecord, u64)> {
        self.store
            .get_as::<NodeRecord>(&keys::node(name))?
            .ok_or_else(|| Error::NotFound(format!("node {}", name)))
    }

    pub fn list(&self) -> Result<Vec<NodeRecord>> {
        Ok(self
            .store
            .list_as::<NodeRecord>(keys::NODES)?
            .into_iter()
            .map(|(n, _)| n)
            .collect())
    }

    pub fn liveness(&self, name: &str) -> Result<NodeLiveness> {
        self.get(name).map(|n| n.liveness)
    }

    fn client_for(&self, node: &NodeRecord) -> NodeAgentClient {
        NodeAgentClient::new(
            &node.name,
            self.connector.connect(node),
            self.timeouts.clone(),
        )
    }

    /// Agent client for a registered node.
    pub fn client(&self, name: &str) -> Result<NodeAgentClient> {
        let node = self.get(name)?;
        Ok(self.client_for(&node))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    fn emit(&self, node: &str, from: NodeLiveness, to: NodeLiveness) {
        if from == to {
            return;
        }
        if to == NodeLiveness::Unreachable {
            tracing::warn!(node = %node, from = %from, to = %to, "node liveness changed");
        } else {
            tracing::info!(node = %node, from = %from, to = %to, "node liveness changed");
        }
        let _ = self.events.send(NodeEvent {
            node: node.to_string(),
            from,
            to,
        });
    }

    /// Probe one node and fold the result into its record.
    pub async fn probe_node(&self, name: &str) -> Result<NodeHealth> {
        let node = self.get(name)?;
        let outcome = self
            .client_for(&node)
            .probe(self.health.probe_timeout())
            .await;

        let failures = {
            let mut failures = self.failures.lock();
            let count = failures.entry(name.to_string()).or_insert(0);
            match &outcome {
                Ok(_) => *count = 0,
                Err(_) => *count += 1,
            }
            *count
        };

        // re-read so a concurrent write is never lost
        for _ in 0..3 {
            let (mut record, revision) = self.get_versioned(name)?;
            let before = record.liveness;
            let previous_inventory = record.inventory.clone();

            record.liveness = next_liveness(
                before,
                failures,
                self.health.failure_threshold,
                outcome.as_ref().ok().map(|r| r.replication_loaded),
            );
            if let Ok(report) = &outcome {
                record.inventory = inventory_from(report);
            }

            let now = timestamp_now();
            let stale_last_seen = record
                .last_seen
                .map(|t| now.saturating_sub(t) >= self.health.interval_secs * 6)
                .unwrap_or(true);
            if outcome.is_ok() {
                record.last_seen = Some(now);
            }

            let changed = before != record.liveness || previous_inventory != record.inventory;
            if changed || (outcome.is_ok() && stale_last_seen) {
                match self
                    .store
                    .put_if(&keys::node(name), Expect::Revision(revision), &record)
                {
                    Ok(_) => {}
                    Err(e) if e.kind() == crate::ErrorKind::ConflictStale => continue,
                    Err(e) => return Err(e),
                }
            }

            self.emit(name, before, record.liveness);
            return Ok(NodeHealth {
                node: name.to_string(),
                liveness: record.liveness,
                inventory: record.inventory,
                error: outcome.err().map(|e| e.to_string()),
            });
        }

        Err(Error::ConflictStale {
            key: keys::node(name),
            expected: 0,
            current: 0,
        })
    }

    /// Probe every registered node concurrently.
    pub async fn probe_all(&self) -> Vec<NodeHealth> {
        let names: Vec<String> = match self.list() {
            Ok(nodes) => nodes.into_iter().map(|n| n.name).collect(),
            Err(e) => {
                tracing::error!(error = %e, "cannot list nodes for health check");
                return Vec::new();
            }
        };

        let probes = names.iter().map(|name| async move {
            match self.probe_node(name).await {
                Ok(health) => health,
                Err(e) => NodeHealth {
                    node: name.clone(),
                    liveness: NodeLiveness::Unknown,
                    inventory: Inventory::default(),
                    error: Some(e.to_string()),
                },
            }
        });
        let results = futures_util::future::join_all(probes).await;

        let count = |l: NodeLiveness| results.iter().filter(|h| h.liveness == l).count() as u64;
        METRICS.nodes_healthy.set(count(NodeLiveness::Healthy));
        METRICS.nodes_unreachable.set(count(NodeLiveness::Unreachable));
        METRICS.nodes_degraded.set(count(NodeLiveness::Degraded));

        results
    }

    /// Periodic health monitor; stops when `shutdown` is cancelled.
    pub fn spawn_monitor(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let interval = registry.health.interval();
            tracing::info!(interval_secs = interval.as_secs(), "health monitor started");
            loop {
                // jitter spreads probes of many controllers restarting together
                let jitter = rand::thread_rng().gen_range(0..=interval.as_millis() as u64 / 10);
                let delay = interval + Duration::from_millis(jitter);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {
                        registry.probe_all().await;
                    }
                }
            }
            tracing::info!("health monitor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_to_healthy_on_first_success() {
        assert_eq!(
            next_liveness(NodeLiveness::Unknown, 0, 3, Some(true)),
            NodeLiveness::Healthy
        );
    }

    #[test]
    fn test_healthy_needs_k_failures() {
        let mut state = NodeLiveness::Healthy;
        for failures in 1..=2 {
            state = next_liveness(state, failures, 3, None);
            assert_eq!(state, NodeLiveness::Healthy);
        }
        state = next_liveness(state, 3, 3, None);
        assert_eq!(state, NodeLiveness::Unreachable);
    }

    #[test]
    fn test_unreachable_recovers_on_any_success() {
        assert_eq!(
            next_liveness(NodeLiveness::Unreachable, 0, 3, Some(true)),
            NodeLiveness::Healthy
        );
    }

    #[test]
    fn test_degraded_without_driver() {
        assert_eq!(
            next_liveness(NodeLiveness::Healthy, 0, 3, Some(false)),
            NodeLiveness::Degraded
        );
    }
}

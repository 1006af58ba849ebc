//! Controller server
//!
//! Opens the state store, recovers interrupted workflows, starts the health
//! monitor and serves the cluster API until the shutdown token fires.

use super::agent_client::{AgentConnector, HttpConnector};
use super::context::ClusterContext;
use super::failover::FailoverCoordinator;
use super::gateway::GatewayManager;
use super::ha::HaManager;
use super::http::{create_router, metrics_router};
use super::orchestrator::{Orchestrator, RecoveryReport};
use super::pools::PoolManager;
use super::snapshot::SnapshotCoordinator;
use super::store::StateStore;
use super::zfs::ZfsDirect;
use crate::common::{ControllerConfig, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Every service the cluster API dispatches to, over one shared context
pub struct Services {
    pub ctx: Arc<ClusterContext>,
    pub orchestrator: Orchestrator,
    pub ha: HaManager,
    pub failover: FailoverCoordinator,
    pub snapshots: SnapshotCoordinator,
    pub gateways: GatewayManager,
    pub pools: PoolManager,
    pub zfs: ZfsDirect,
}

impl Services {
    pub fn new(ctx: Arc<ClusterContext>) -> Arc<Self> {
        Arc::new(Self {
            orchestrator: Orchestrator::new(Arc::clone(&ctx)),
            ha: HaManager::new(Arc::clone(&ctx)),
            failover: FailoverCoordinator::new(Arc::clone(&ctx)),
            snapshots: SnapshotCoordinator::new(Arc::clone(&ctx)),
            gateways: GatewayManager::new(Arc::clone(&ctx)),
            pools: PoolManager::new(Arc::clone(&ctx)),
            zfs: ZfsDirect::new(Arc::clone(&ctx)),
            ctx,
        })
    }

    /// Resume or undo everything a previous run left in flight.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = self.orchestrator.recover().await?;
        report.merge(self.ha.recover().await?);
        if !report.is_empty() {
            tracing::info!(
                resumed = report.resumed.len(),
                rolled_back = report.rolled_back.len(),
                failed = report.failed.len(),
                "workflow recovery finished"
            );
        }
        Ok(report)
    }
}

pub struct Controller {
    config: ControllerConfig,
}

impl Controller {
    pub fn new(config: ControllerConfig) -> Self {
        Self { config }
    }

    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        let config = Arc::new(self.config);
        tracing::info!("Starting sds-controller {}", crate::VERSION);
        tracing::info!("  API: {}", config.listen_addr);
        tracing::info!("  State dir: {}", config.state_dir.display());
        tracing::info!("  Promoter config dir: {}", config.promoter_config_dir.display());
        if let Some(addr) = config.metrics_addr {
            tracing::info!("  Metrics: {}", addr);
        }

        let store = Arc::new(StateStore::open(&config.state_dir, config.snapshot_every)?);
        let connector: Arc<dyn AgentConnector> =
            Arc::new(HttpConnector::new(config.workflows.timeouts.rpc())?);
        let ctx = ClusterContext::new(Arc::clone(&config), Arc::clone(&store), connector, shutdown.clone());
        let services = Services::new(Arc::clone(&ctx));

        // Fresh liveness before recovery decides which nodes to talk to
        ctx.registry.probe_all().await;
        services.recover().await?;
        let monitor = ctx.registry.spawn_monitor(shutdown.clone());

        let metrics_server = match config.metrics_addr {
            Some(addr) => {
                let listener = tokio::net::TcpListener::bind(addr).await?;
                let token = shutdown.clone();
                Some(tokio::spawn(async move {
                    let served = axum::serve(listener, metrics_router())
                        .with_graceful_shutdown(async move { token.cancelled().await })
                        .await;
                    if let Err(e) = served {
                        tracing::error!(error = %e, "metrics listener failed");
                    }
                }))
            }
            None => None,
        };

        let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
        tracing::info!("✓ Controller ready");
        let token = shutdown.clone();
        let served = axum::serve(
            listener,
            create_router(Arc::clone(&services)).into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await;

        // A listener failure still takes the rest of the controller down
        shutdown.cancel();
        if let Err(e) = monitor.await {
            tracing::warn!(error = %e, "health monitor ended abnormally");
        }
        if let Some(handle) = metrics_server {
            let _ = handle.await;
        }
        if let Err(e) = ctx.intents.prune() {
            tracing::warn!(error = %e, "intent pruning failed");
        }
        store.flush()?;
        tracing::info!("controller stopped");
        served.map_err(Into::into)
    }
}

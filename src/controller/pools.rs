//! Storage pool management
//!
//! Pools are created through the node agent and recorded with the capacity
//! the agent reports. Free space is then tracked by the controller as
//! resources consume and return it.

use super::context::ClusterContext;
use super::orchestrator::ignore_missing;
use super::records::{keys, PoolRecord, PoolType, ResourceRecord, SCHEMA_VERSION};
use super::store::Expect;
use crate::common::{validate_object_name, Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Map;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolRequest {
    pub node: String,
    pub name: String,
    pub pool_type: PoolType,
    #[serde(default)]
    pub devices: Vec<String>,
    /// Volume group a thin pool is carved from
    #[serde(default)]
    pub volume_group: Option<String>,
    /// Thin pool size
    #[serde(default)]
    pub size_gib: Option<u64>,
}

/// Name the agent reports capacity under
fn capacity_name(pool: &PoolRecord) -> String {
    match (pool.pool_type, &pool.volume_group) {
        (PoolType::ThinPool, Some(vg)) => format!("{}/{}", vg, pool.name),
        _ => pool.name.clone(),
    }
}

fn check_request(req: &PoolRequest) -> Result<()> {
    validate_object_name("pool", &req.name)?;
    validate_object_name("node", &req.node)?;
    match req.pool_type {
        PoolType::VolumeGroup | PoolType::CopyOnWritePool if req.devices.is_empty() => Err(
            Error::InvalidArgument(format!("{} {} needs at least one device", req.pool_type, req.name)),
        ),
        PoolType::ThinPool if req.volume_group.is_none() => Err(Error::InvalidArgument(format!(
            "thin pool {} needs a volume group",
            req.name
        ))),
        PoolType::ThinPool if req.size_gib.unwrap_or(0) < 1 => Err(Error::InvalidArgument(format!(
            "thin pool {} needs a size of at least 1 GiB",
            req.name
        ))),
        _ => Ok(()),
    }
}

pub struct PoolManager {
    ctx: Arc<ClusterContext>,
}

impl PoolManager {
    pub fn new(ctx: Arc<ClusterContext>) -> Self {
        Self { ctx }
    }

    fn get_versioned(&self, node: &str, name: &str) -> Result<(PoolRecord, u64)> {
        self.ctx
            .store
            .get_as::<PoolRecord>(&keys::pool(node, name))?
            .ok_or_else(|| Error::NotFound(format!("pool {} on {}", name, node)))
    }

    pub fn get(&self, node: &str, name: &str) -> Result<PoolRecord> {
        self.get_versioned(node, name).map(|(p, _)| p)
    }

    pub fn list(&self, node: Option<&str>) -> Result<Vec<PoolRecord>> {
        let prefix = match node {
            Some(n) => keys::pools_of(n),
            None => keys::POOLS.to_string(),
        };
        Ok(self
            .ctx
            .store
            .list_as::<PoolRecord>(&prefix)?
            .into_iter()
            .map(|(p, _)| p)
            .collect())
    }

    pub async fn create(&self, req: PoolRequest) -> Result<PoolRecord> {
        check_request(&req)?;
        self.ctx.registry.get(&req.node)?;
        if self.ctx.store.get(&keys::pool(&req.node, &req.name)).is_some() {
            return Err(Error::AlreadyExists(format!("pool {} on {}", req.name, req.node)));
        }
        let client = self.ctx.client(&req.node)?;

        match req.pool_type {
            PoolType::VolumeGroup => client.vg_create(&req.name, &req.devices).await?,
            PoolType::ThinPool => {
                let vg = req.volume_group.as_deref().unwrap_or_default();
                client
                    .thin_pool_create(vg, &req.name, req.size_gib.unwrap_or_default())
                    .await?
            }
            PoolType::CopyOnWritePool => client.zfs_pool_create(&req.name, &req.devices).await?,
        }

        let mut pool = PoolRecord {
            schema_version: SCHEMA_VERSION,
            name: req.name.clone(),
            pool_type: req.pool_type,
            node: req.node.clone(),
            total_gib: 0,
            free_gib: 0,
            devices: req.devices.clone(),
            volume_group: req.volume_group.clone(),
            extra: Map::new(),
        };
        let capacity = client.pool_capacity(pool.pool_type, &capacity_name(&pool)).await?;
        pool.total_gib = capacity.total_gib;
        pool.free_gib = capacity.free_gib;

        self.ctx
            .store
            .put_if(&keys::pool(&req.node, &req.name), Expect::Absent, &pool)?;
        tracing::info!(
            node = %pool.node,
            pool = %pool.name,
            pool_type = %pool.pool_type,
            total_gib = pool.total_gib,
            "pool created"
        );
        Ok(pool)
    }

    /// Remove a pool no resource or thin pool depends on.
    pub async fn delete(&self, node: &str, name: &str) -> Result<()> {
        let (pool, revision) = self.get_versioned(node, name)?;

        let resources = self.ctx.store.list_as::<ResourceRecord>(keys::RESOURCES)?;
        if let Some((res, _)) = resources
            .iter()
            .find(|(r, _)| r.pool == pool.name && r.has_node(node))
        {
            return Err(Error::PreconditionFailed(format!(
                "pool {} on {} is used by resource {}",
                name, node, res.name
            )));
        }
        let thin = self.ctx.store.list_as::<PoolRecord>(&keys::pools_of(node))?;
        if let Some((tp, _)) = thin
            .iter()
            .find(|(p, _)| p.pool_type == PoolType::ThinPool && p.volume_group.as_deref() == Some(name))
        {
            return Err(Error::PreconditionFailed(format!(
                "volume group {} on {} carries thin pool {}",
                name, node, tp.name
            )));
        }

        let client = self.ctx.client(node)?;
        let removed = match pool.pool_type {
            PoolType::VolumeGroup => client.vg_remove(&pool.name).await,
            PoolType::ThinPool => {
                let vg = pool.volume_group.as_deref().unwrap_or(&pool.name);
                client.thin_pool_remove(vg, &pool.name).await
            }
            PoolType::CopyOnWritePool => client.zfs_pool_destroy(&pool.name).await,
        };
        ignore_missing(removed)?;

        self.ctx
            .store
            .delete_if(&keys::pool(node, name), Expect::Revision(revision))?;
        tracing::info!(node = %node, pool = %name, "pool deleted");
        Ok(())
    }

    /// Extend a pool with more devices and refresh its capacity.
    ///
    /// Growth is added to the free space so consumption already accounted
    /// against the pool is kept.
    pub async fn add_disks(&self, node: &str, name: &str, devices: &[String]) -> Result<PoolRecord> {
        if devices.is_empty() {
            return Err(Error::InvalidArgument("no devices given".into()));
        }
        let (mut pool, _) = self.get_versioned(node, name)?;
        let client = self.ctx.client(node)?;
        match pool.pool_type {
            PoolType::VolumeGroup => client.vg_extend(&pool.name, devices).await?,
            PoolType::CopyOnWritePool => client.zfs_pool_add(&pool.name, devices).await?,
            PoolType::ThinPool => {
                return Err(Error::InvalidArgument(format!(
                    "thin pool {} grows with its volume group; add disks to that instead",
                    name
                )))
            }
        }
        let capacity = client.pool_capacity(pool.pool_type, &capacity_name(&pool)).await?;

        // Concurrent workflows adjust free space with revision checks, so retry on conflict
        let mut attempt = 0;
        loop {
            attempt += 1;
            let (current, revision) = self.get_versioned(node, name)?;
            pool = current;
            let grown = capacity.total_gib.saturating_sub(pool.total_gib);
            pool.total_gib = capacity.total_gib;
            pool.free_gib = pool.free_gib.saturating_add(grown).min(pool.total_gib);
            for device in devices {
                if !pool.devices.contains(device) {
                    pool.devices.push(device.clone());
                }
            }
            match self
                .ctx
                .store
                .put_if(&keys::pool(node, name), Expect::Revision(revision), &pool)
            {
                Ok(_) => {
                    tracing::info!(node = %node, pool = %name, total_gib = pool.total_gib, "pool extended");
                    return Ok(pool);
                }
                Err(Error::ConflictStale { .. }) if attempt < 3 => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

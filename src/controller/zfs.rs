//! Direct ZFS administration on a single node
//!
//! Nothing here is replicated or recorded. Objects that back a managed pool or
//! resource volume are refused so the two views cannot drift.

use super::agent_client::{ZfsEntry, ZfsKind};
use super::context::ClusterContext;
use super::records::{keys, PoolRecord, PoolType, ResourceRecord};
use super::snapshot::parse_volume_ref;
use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZfsPoolRequest {
    pub node: String,
    pub name: String,
    #[serde(default)]
    pub devices: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZfsDatasetRequest {
    pub node: String,
    pub name: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZfsVolumeRequest {
    pub node: String,
    pub name: String,
    pub size_gib: u64,
}

/// `pool[/child...]` with the characters zfs accepts in names
pub fn validate_zfs_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('/')
        && !name.ends_with('/')
        && !name.contains("//")
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':' | '/'));
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!("invalid zfs name '{}'", name)))
    }
}

pub struct ZfsDirect {
    ctx: Arc<ClusterContext>,
}

impl ZfsDirect {
    pub fn new(ctx: Arc<ClusterContext>) -> Self {
        Self { ctx }
    }

    fn managed_pool(&self, node: &str, pool: &str) -> Result<bool> {
        Ok(self
            .ctx
            .store
            .get_as::<PoolRecord>(&keys::pool(node, pool))?
            .is_some_and(|(p, _)| p.pool_type == PoolType::CopyOnWritePool))
    }

    /// Refuse names that a resource volume of a managed pool lives at.
    fn ensure_unmanaged(&self, node: &str, name: &str) -> Result<()> {
        let root = name.split('/').next().unwrap_or(name);
        if name == root {
            if self.managed_pool(node, root)? {
                return Err(Error::PreconditionFailed(format!(
                    "zfs pool {} on {} is a managed pool; use pool delete",
                    root, node
                )));
            }
            return Ok(());
        }
        if !self.managed_pool(node, root)? {
            return Ok(());
        }
        if let Ok((resource, _)) = parse_volume_ref(name) {
            let used = self
                .ctx
                .store
                .get_as::<ResourceRecord>(&keys::resource(&resource))?
                .is_some_and(|(r, _)| r.pool == root && r.has_node(node));
            if used {
                return Err(Error::PreconditionFailed(format!(
                    "{} backs resource {}",
                    name, resource
                )));
            }
        }
        Ok(())
    }

    pub async fn pool_create(&self, req: ZfsPoolRequest) -> Result<()> {
        validate_zfs_name(&req.name)?;
        if req.name.contains('/') {
            return Err(Error::InvalidArgument(format!("pool name '{}' cannot contain '/'", req.name)));
        }
        if req.devices.is_empty() {
            return Err(Error::InvalidArgument("a zfs pool needs at least one device".into()));
        }
        self.ctx.client(&req.node)?.zfs_pool_create(&req.name, &req.devices).await?;
        tracing::info!(node = %req.node, pool = %req.name, devices = ?req.devices, "zfs pool created");
        Ok(())
    }

    pub async fn pool_destroy(&self, node: &str, name: &str) -> Result<()> {
        validate_zfs_name(name)?;
        self.ensure_unmanaged(node, name)?;
        self.ctx.client(node)?.zfs_pool_destroy(name).await?;
        tracing::info!(node = %node, pool = %name, "zfs pool destroyed");
        Ok(())
    }

    pub async fn dataset_create(&self, req: ZfsDatasetRequest) -> Result<()> {
        validate_zfs_name(&req.name)?;
        self.ctx
            .client(&req.node)?
            .zfs_dataset_create(&req.name, req.properties.clone())
            .await?;
        tracing::info!(node = %req.node, dataset = %req.name, "zfs dataset created");
        Ok(())
    }

    pub async fn dataset_destroy(&self, node: &str, name: &str, recursive: bool) -> Result<()> {
        validate_zfs_name(name)?;
        if !name.contains('/') {
            return Err(Error::InvalidArgument(format!("'{}' is a pool, not a dataset", name)));
        }
        self.ensure_unmanaged(node, name)?;
        self.ctx.client(node)?.zfs_dataset_destroy(name, recursive).await?;
        tracing::info!(node = %node, dataset = %name, recursive, "zfs dataset destroyed");
        Ok(())
    }

    pub async fn volume_create(&self, req: ZfsVolumeRequest) -> Result<()> {
        validate_zfs_name(&req.name)?;
        if req.size_gib < 1 {
            return Err(Error::InvalidArgument("volume size must be at least 1 GiB".into()));
        }
        self.ensure_unmanaged(&req.node, &req.name)?;
        self.ctx
            .client(&req.node)?
            .zfs_volume_create(&req.name, req.size_gib)
            .await?;
        tracing::info!(node = %req.node, volume = %req.name, size_gib = req.size_gib, "zfs volume created");
        Ok(())
    }

    pub async fn volume_destroy(&self, node: &str, name: &str) -> Result<()> {
        validate_zfs_name(name)?;
        self.ensure_unmanaged(node, name)?;
        self.ctx.client(node)?.zfs_volume_destroy(name).await?;
        tracing::info!(node = %node, volume = %name, "zfs volume destroyed");
        Ok(())
    }

    pub async fn list(&self, node: &str, kind: ZfsKind, root: Option<&str>) -> Result<Vec<ZfsEntry>> {
        if let Some(root) = root {
            validate_zfs_name(root)?;
        }
        self.ctx.client(node)?.zfs_list(kind, root).await
    }
}

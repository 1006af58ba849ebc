//! Backing volume operations, dispatched by storage kind
//!
//! Creation is idempotent: an existing volume with the requested size counts
//! as success, one with a different size is a configuration mismatch.
//! Removal treats a missing volume as success.

use super::agent_client::{NodeAgentClient, ZfsKind};
use super::placement::BackingTarget;
use super::records::StorageKind;
use crate::common::{Error, Result};
use async_trait::async_trait;

#[async_trait]
pub trait BackingOps: Send + Sync {
    async fn create(&self, client: &NodeAgentClient, target: &BackingTarget, name: &str, size_gib: u64) -> Result<()>;

    async fn remove(&self, client: &NodeAgentClient, target: &BackingTarget, name: &str) -> Result<()>;

    async fn extend(&self, client: &NodeAgentClient, target: &BackingTarget, name: &str, size_gib: u64) -> Result<()>;

    /// Current size, `None` when the volume does not exist
    async fn size_of(&self, client: &NodeAgentClient, target: &BackingTarget, name: &str) -> Result<Option<u64>>;
}

pub struct VolumeManagerOps;
pub struct CopyOnWriteOps;

static VOLUME_MANAGER: VolumeManagerOps = VolumeManagerOps;
static COPY_ON_WRITE: CopyOnWriteOps = CopyOnWriteOps;

pub fn ops_for(kind: StorageKind) -> &'static dyn BackingOps {
    match kind {
        StorageKind::VolumeManager => &VOLUME_MANAGER,
        StorageKind::CopyOnWrite => &COPY_ON_WRITE,
    }
}

async fn create_idempotent(
    ops: &dyn BackingOps,
    client: &NodeAgentClient,
    target: &BackingTarget,
    name: &str,
    size_gib: u64,
    result: Result<()>,
) -> Result<()> {
    match result {
        Err(e) if e.is_already_exists() => match ops.size_of(client, target, name).await? {
            Some(existing) if existing == size_gib => {
                tracing::debug!(node = %client.node(), volume = %name, "backing volume already present");
                Ok(())
            }
            Some(existing) => Err(Error::ConfigMismatch(format!(
                "{} on {} exists with {} GiB, expected {} GiB",
                name,
                client.node(),
                existing,
                size_gib
            ))),
            None => Err(e),
        },
        other => other,
    }
}

fn ignore_missing(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

#[async_trait]
impl BackingOps for VolumeManagerOps {
    async fn create(&self, client: &NodeAgentClient, target: &BackingTarget, name: &str, size_gib: u64) -> Result<()> {
        let result = client
            .lv_create(&target.container, name, size_gib, target.thin_pool.as_deref())
            .await;
        create_idempotent(self, client, target, name, size_gib, result).await
    }

    async fn remove(&self, client: &NodeAgentClient, target: &BackingTarget, name: &str) -> Result<()> {
        ignore_missing(client.lv_remove(&target.container, name).await)
    }

    async fn extend(&self, client: &NodeAgentClient, target: &BackingTarget, name: &str, size_gib: u64) -> Result<()> {
        // re-running after a crash finds the volume already grown
        if let Some(current) = self.size_of(client, target, name).await? {
            if current >= size_gib {
                return Ok(());
            }
        }
        client.lv_extend(&target.container, name, size_gib).await
    }

    async fn size_of(&self, client: &NodeAgentClient, target: &BackingTarget, name: &str) -> Result<Option<u64>> {
        let volumes = client.lv_list(&target.container).await?;
        Ok(volumes.into_iter().find(|lv| lv.name == name).map(|lv| lv.size_gib))
    }
}

#[async_trait]
impl BackingOps for CopyOnWriteOps {
    async fn create(&self, client: &NodeAgentClient, target: &BackingTarget, name: &str, size_gib: u64) -> Result<()> {
        let dataset = format!("{}/{}", target.container, name);
        let result = client.zfs_volume_create(&dataset, size_gib).await;
        create_idempotent(self, client, target, name, size_gib, result).await
    }

    async fn remove(&self, client: &NodeAgentClient, target: &BackingTarget, name: &str) -> Result<()> {
        let dataset = format!("{}/{}", target.container, name);
        ignore_missing(client.zfs_volume_destroy(&dataset).await)
    }

    async fn extend(&self, client: &NodeAgentClient, target: &BackingTarget, name: &str, size_gib: u64) -> Result<()> {
        if let Some(current) = self.size_of(client, target, name).await? {
            if current >= size_gib {
                return Ok(());
            }
        }
        let dataset = format!("{}/{}", target.container, name);
        client.zfs_volume_extend(&dataset, size_gib).await
    }

    async fn size_of(&self, client: &NodeAgentClient, target: &BackingTarget, name: &str) -> Result<Option<u64>> {
        let dataset = format!("{}/{}", target.container, name);
        let volumes = client
            .zfs_list(ZfsKind::Volume, Some(&target.container))
            .await?;
        Ok(volumes
            .into_iter()
            .find(|v| v.name == dataset)
            .and_then(|v| v.size_gib))
    }
}

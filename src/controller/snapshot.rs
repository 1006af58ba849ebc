//! Snapshot Coordinator
//!
//! Snapshots are per node and per volume. Volume-manager snapshots are sized
//! copy-on-write volumes named `<lv>_<snap>` and restore by merging into the
//! origin; on a thick volume group their area is charged to the pool until
//! the snapshot is deleted or merged. Copy-on-write pools snapshot atomically
//! and restore by rollback.

use super::agent_client::{NodeAgentClient, ZfsKind};
use super::backing;
use super::context::ClusterContext;
use super::orchestrator::ignore_missing;
use super::placement::BackingTarget;
use super::records::{
    keys, PoolType, ResourceRecord, SnapshotBackend, SnapshotRecord, StorageKind, VolumeRecord,
    SCHEMA_VERSION,
};
use super::store::{Expect, TxnOp};
use crate::common::{timestamp_now, validate_object_name, Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Map;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub resource: String,
    pub node: String,
    #[serde(default)]
    pub volume: u32,
    pub name: String,
    /// Copy-on-write area for thick volume groups; defaults to the volume size
    #[serde(default)]
    pub size_gib: Option<u64>,
}

/// Backend object a snapshot lives in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub name: String,
    pub object: String,
    #[serde(default)]
    pub size_gib: Option<u64>,
}

/// Split `pool/<resource>_vol<id>` into resource and volume id.
pub fn parse_volume_ref(volume: &str) -> Result<(String, u32)> {
    let leaf = volume.rsplit('/').next().unwrap_or(volume);
    let (resource, id) = leaf
        .rsplit_once("_vol")
        .ok_or_else(|| Error::InvalidArgument(format!("'{}' is not a resource volume", volume)))?;
    let id = id
        .parse::<u32>()
        .map_err(|_| Error::InvalidArgument(format!("'{}' has no volume number", volume)))?;
    validate_object_name("resource", resource)?;
    Ok((resource.to_string(), id))
}

fn lvm_snapshot_name(resource: &str, volume: u32, snapshot: &str) -> String {
    format!("{}_{}", VolumeRecord::lv_name(resource, volume), snapshot)
}

pub struct SnapshotCoordinator {
    ctx: Arc<ClusterContext>,
}

struct Located {
    record: ResourceRecord,
    target: BackingTarget,
    client: NodeAgentClient,
    lv: String,
}

impl SnapshotCoordinator {
    pub fn new(ctx: Arc<ClusterContext>) -> Self {
        Self { ctx }
    }

    /// Resolve the node's backing volume and confirm it is there.
    async fn locate(&self, resource: &str, node: &str, volume: u32) -> Result<Located> {
        let (record, _) = self.ctx.resource(resource)?;
        if !record.has_node(node) {
            return Err(Error::NotFound(format!(
                "node {} does not host resource {}",
                node, resource
            )));
        }
        if record.volume(volume).is_none() {
            return Err(Error::NotFound(format!("volume {} of resource {}", volume, resource)));
        }
        let view = self.ctx.view()?;
        let target = self.ctx.placement.target_of(&record, &view)?;
        let client = self.ctx.client(node)?;
        let lv = VolumeRecord::lv_name(resource, volume);
        if backing::ops_for(target.storage)
            .size_of(&client, &target, &lv)
            .await?
            .is_none()
        {
            return Err(Error::NotFound(format!("backing volume {} on {}", lv, node)));
        }
        Ok(Located {
            record,
            target,
            client,
            lv,
        })
    }

    pub async fn create(&self, req: SnapshotRequest) -> Result<SnapshotRecord> {
        validate_object_name("snapshot", &req.name)?;
        let _guard = self.ctx.locks.acquire(&req.resource).await;
        let key = keys::snapshot(&req.resource, &req.node, req.volume, &req.name);
        if self.ctx.store.get(&key).is_some() {
            return Err(Error::AlreadyExists(format!(
                "snapshot {} of {} volume {} on {}",
                req.name, req.resource, req.volume, req.node
            )));
        }
        let found = self.locate(&req.resource, &req.node, req.volume).await?;
        let target = &found.target;

        let pool = found.record.pool.clone();
        let mut reservation = None;
        let (backend, object, size_gib) = match target.storage {
            StorageKind::VolumeManager => {
                let snap = lvm_snapshot_name(&req.resource, req.volume, &req.name);
                let size = match target.pool_type {
                    PoolType::ThinPool => 0,
                    _ => match req.size_gib {
                        Some(0) => {
                            return Err(Error::InvalidArgument("snapshot size must be at least 1 GiB".into()))
                        }
                        Some(size) => size,
                        None => found.record.volume(req.volume).map(|v| v.size_gib).unwrap_or(1),
                    },
                };
                if size > 0 {
                    // a thick snapshot takes its area from the volume group
                    let _allocation = self.ctx.allocation.lock().await;
                    let view = self.ctx.view()?;
                    let held = self.ctx.placement.reserve_snapshot(&view, &req.node, &pool, size)?;
                    reservation = Some(held);
                }
                found
                    .client
                    .lv_snapshot_create(&target.container, &found.lv, &snap, size)
                    .await?;
                (
                    SnapshotBackend::Lvm,
                    format!("{}/{}", target.container, snap),
                    (size > 0).then_some(size),
                )
            }
            StorageKind::CopyOnWrite => {
                let dataset = format!("{}/{}", target.container, found.lv);
                found.client.zfs_snapshot_create(&dataset, &req.name).await?;
                (SnapshotBackend::Zfs, format!("{}@{}", dataset, req.name), None)
            }
        };

        let snapshot = SnapshotRecord {
            schema_version: SCHEMA_VERSION,
            name: req.name.clone(),
            resource: req.resource.clone(),
            volume: req.volume,
            node: req.node.clone(),
            backend,
            object,
            size_gib,
            created_at: timestamp_now(),
            extra: Map::new(),
        };
        let charged: &[String] = if reservation.is_some() {
            std::slice::from_ref(&req.node)
        } else {
            &[]
        };
        let consumed = snapshot.size_gib.unwrap_or(0) as i64;
        self.ctx.commit_with_pools(charged, &pool, consumed, || {
            Ok(vec![TxnOp::put_if(key.clone(), Expect::Absent, &snapshot)?])
        })?;
        drop(reservation);
        tracing::info!(
            resource = %req.resource,
            node = %req.node,
            volume = req.volume,
            snapshot = %snapshot.object,
            "snapshot created"
        );
        Ok(snapshot)
    }

    pub fn get(&self, resource: &str, node: &str, volume: u32, name: &str) -> Result<SnapshotRecord> {
        self.ctx
            .store
            .get_as::<SnapshotRecord>(&keys::snapshot(resource, node, volume, name))?
            .map(|(s, _)| s)
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "snapshot {} of {} volume {} on {}",
                    name, resource, volume, node
                ))
            })
    }

    pub fn list(&self, resource: Option<&str>) -> Result<Vec<SnapshotRecord>> {
        let prefix = match resource {
            Some(r) => keys::snapshots_of(r),
            None => keys::SNAPSHOTS.to_string(),
        };
        Ok(self
            .ctx
            .store
            .list_as::<SnapshotRecord>(&prefix)?
            .into_iter()
            .map(|(s, _)| s)
            .collect())
    }

    pub async fn delete(&self, resource: &str, node: &str, volume: u32, name: &str) -> Result<()> {
        let _guard = self.ctx.locks.acquire(resource).await;
        let snapshot = self.get(resource, node, volume, name)?;
        let client = self.ctx.client(node)?;

        match snapshot.backend {
            SnapshotBackend::Lvm => {
                let (vg, lv) = split_object(&snapshot.object, '/')?;
                ignore_missing(client.lv_snapshot_remove(vg, lv).await)?;
            }
            SnapshotBackend::Zfs => {
                let (dataset, snap) = split_object(&snapshot.object, '@')?;
                ignore_missing(client.zfs_snapshot_destroy(dataset, snap).await)?;
            }
        }
        self.forget(&snapshot)?;
        tracing::info!(resource = %resource, node = %node, snapshot = %snapshot.object, "snapshot deleted");
        Ok(())
    }

    /// Roll the node's backing volume back to the snapshot.
    ///
    /// The volume must not be mounted anywhere and the resource must not be
    /// under promoter control. A merged volume-manager snapshot is consumed.
    pub async fn restore(&self, resource: &str, node: &str, volume: u32, name: &str) -> Result<()> {
        let _guard = self.ctx.locks.acquire(resource).await;
        let snapshot = self.get(resource, node, volume, name)?;
        let (record, _) = self.ctx.resource(resource)?;
        if let Some(mount) = record.mounts.iter().find(|m| m.volume == volume) {
            return Err(Error::PreconditionFailed(format!(
                "volume {} is mounted at {} on {}",
                volume, mount.path, mount.node
            )));
        }
        if self.ctx.ha_config(resource)?.is_some() {
            return Err(Error::PreconditionFailed(format!(
                "{} is highly available; delete the HA configuration before restoring",
                resource
            )));
        }
        let client = self.ctx.client(node)?;

        match snapshot.backend {
            SnapshotBackend::Lvm => {
                let (vg, lv) = split_object(&snapshot.object, '/')?;
                client.lv_snapshot_merge(vg, lv).await?;
                self.forget(&snapshot)?;
            }
            SnapshotBackend::Zfs => {
                let (dataset, snap) = split_object(&snapshot.object, '@')?;
                client.zfs_rollback(dataset, snap).await?;
            }
        }
        tracing::info!(resource = %resource, node = %node, snapshot = %snapshot.object, "snapshot restored");
        Ok(())
    }

    /// Drop the snapshot's record and give a thick snapshot's area back to
    /// its pool.
    fn forget(&self, snapshot: &SnapshotRecord) -> Result<()> {
        let key = keys::snapshot(&snapshot.resource, &snapshot.node, snapshot.volume, &snapshot.name);
        let charged = match (&snapshot.backend, snapshot.size_gib) {
            (SnapshotBackend::Lvm, Some(size)) if size > 0 => {
                let (record, _) = self.ctx.resource(&snapshot.resource)?;
                Some((record.pool, size))
            }
            _ => None,
        };
        match charged {
            Some((pool, size)) => {
                let node = std::slice::from_ref(&snapshot.node);
                self.ctx.commit_with_pools(node, &pool, -(size as i64), || {
                    Ok(vec![TxnOp::delete(key.clone())])
                })?;
            }
            None => {
                self.ctx.store.delete_if(&key, Expect::Any)?;
            }
        }
        Ok(())
    }

    /// What the node's backend holds for a volume, recorded or not.
    pub async fn list_on_node(&self, resource: &str, node: &str, volume: u32) -> Result<Vec<SnapshotEntry>> {
        let found = self.locate(resource, node, volume).await?;
        let target = &found.target;
        match target.storage {
            StorageKind::VolumeManager => Ok(found
                .client
                .lv_list(&target.container)
                .await?
                .into_iter()
                .filter(|lv| lv.origin.as_deref() == Some(found.lv.as_str()))
                .map(|lv| SnapshotEntry {
                    name: lv
                        .name
                        .strip_prefix(&format!("{}_", found.lv))
                        .unwrap_or(&lv.name)
                        .to_string(),
                    object: format!("{}/{}", target.container, lv.name),
                    size_gib: Some(lv.size_gib),
                })
                .collect()),
            StorageKind::CopyOnWrite => {
                let dataset = format!("{}/{}", target.container, found.lv);
                Ok(found
                    .client
                    .zfs_list(ZfsKind::Snapshot, Some(&dataset))
                    .await?
                    .into_iter()
                    .filter_map(|entry| {
                        let (_, snap) = entry.name.split_once('@')?;
                        Some(SnapshotEntry {
                            name: snap.to_string(),
                            object: entry.name.clone(),
                            size_gib: entry.size_gib,
                        })
                    })
                    .collect())
            }
        }
    }
}

fn split_object(object: &str, sep: char) -> Result<(&str, &str)> {
    object
        .rsplit_once(sep)
        .ok_or_else(|| Error::Corrupted(format!("snapshot object '{}' is malformed", object)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_volume_ref() {
        assert_eq!(parse_volume_ref("vg0/r0_vol1").unwrap(), ("r0".to_string(), 1));
        assert_eq!(parse_volume_ref("tank/db_x_vol0").unwrap(), ("db_x".to_string(), 0));
        assert!(parse_volume_ref("vg0/r0").is_err());
        assert!(parse_volume_ref("vg0/r0_volx").is_err());
    }

    #[test]
    fn test_lvm_names() {
        assert_eq!(lvm_snapshot_name("r0", 0, "s1"), "r0_vol0_s1");
        assert_eq!(split_object("vg0/r0_vol0_s1", '/').unwrap(), ("vg0", "r0_vol0_s1"));
        assert_eq!(split_object("tank/r0_vol0@s1", '@').unwrap(), ("tank/r0_vol0", "s1"));
    }
}

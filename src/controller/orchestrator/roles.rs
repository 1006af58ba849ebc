//! Roles, filesystems, mounts and live status

use super::{apply_observed, ignore_missing, live_primaries, Orchestrator};
use crate::controller::records::{keys, MountRecord, NodeLiveness, ResourceRecord, Role};
use crate::controller::store::Expect;
use crate::common::{validate_mount_path, validate_object_name, Error, Result};
use serde::{Deserialize, Serialize};

/// Live view of one node of a resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node: String,
    pub liveness: NodeLiveness,
    pub role: Role,
    #[serde(default)]
    pub disk_state: Option<String>,
    #[serde(default)]
    pub replication_state: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub resource: ResourceRecord,
    pub nodes: Vec<NodeStatus>,
}

impl Orchestrator {
    fn hosting(&self, record: &ResourceRecord, node: &str) -> Result<()> {
        if record.has_node(node) {
            Ok(())
        } else {
            Err(Error::NotFound(format!(
                "node {} does not host resource {}",
                node, record.name
            )))
        }
    }

    fn reject_ha(&self, record: &ResourceRecord) -> Result<()> {
        if self.ctx.ha_config(&record.name)?.is_some() {
            return Err(Error::Forbidden(format!(
                "roles of {} are managed by the promoter; use evict",
                record.name
            )));
        }
        Ok(())
    }

    /// Promote `node`.
    ///
    /// Without `force` no other node may be Primary. With `force` every peer
    /// must be unreachable; forcing is refused while any peer is reachable.
    pub async fn set_primary(&self, resource: &str, node: &str, force: bool) -> Result<ResourceRecord> {
        let _guard = self.ctx.locks.acquire(resource).await;
        let (mut record, revision) = self.ctx.resource(resource)?;
        self.hosting(&record, node)?;
        self.reject_ha(&record)?;

        let observed = self.ctx.observe(&record).await;
        if force {
            let mut reachable = Vec::new();
            for peer in record.nodes.iter().filter(|n| *n != node) {
                if self.ctx.registry.liveness(peer)? != NodeLiveness::Unreachable {
                    reachable.push(peer.as_str());
                }
            }
            if !reachable.is_empty() {
                return Err(Error::Forbidden(format!(
                    "forced promotion needs a degraded resource; {} still reachable",
                    reachable.join(", ")
                )));
            }
        } else {
            if let Some(other) = live_primaries(&observed).into_iter().find(|n| n != node) {
                return Err(Error::PreconditionFailed(format!(
                    "{} is already Primary on {}",
                    resource, other
                )));
            }
            // a silent peer last seen as Primary may still be one
            if let Some(other) = record.nodes.iter().find(|peer| {
                *peer != node
                    && !matches!(observed.get(*peer), Some(Ok(_)))
                    && record.role(peer) == Role::Primary
            }) {
                return Err(Error::PreconditionFailed(format!(
                    "{} was last seen Primary on {}, which does not answer; use force once it is unreachable",
                    resource, other
                )));
            }
        }

        let client = self.ctx.client(node)?;
        client.replication_promote(resource, force).await?;
        tracing::info!(resource = %resource, node = %node, force, "promoted");

        apply_observed(&mut record, &observed);
        record.claim_primary(node);
        self.ctx
            .store
            .put_if(&keys::resource(resource), Expect::Revision(revision), &record)?;
        Ok(record)
    }

    pub async fn set_secondary(&self, resource: &str, node: &str) -> Result<ResourceRecord> {
        let _guard = self.ctx.locks.acquire(resource).await;
        let (mut record, revision) = self.ctx.resource(resource)?;
        self.hosting(&record, node)?;
        self.reject_ha(&record)?;
        if let Some(mount) = record.mounts.iter().find(|m| m.node == node) {
            return Err(Error::PreconditionFailed(format!(
                "volume {} is mounted at {} on {}",
                mount.volume, mount.path, node
            )));
        }

        self.ctx.client(node)?.replication_demote(resource).await?;
        tracing::info!(resource = %resource, node = %node, "demoted");

        record.set_role(node, Role::Secondary);
        self.ctx
            .store
            .put_if(&keys::resource(resource), Expect::Revision(revision), &record)?;
        Ok(record)
    }

    async fn require_live_primary(&self, record: &ResourceRecord, node: &str) -> Result<()> {
        let status = self.ctx.client(node)?.replication_status(&record.name).await?;
        if status.role != Role::Primary {
            return Err(Error::PreconditionFailed(format!(
                "{} is not Primary on {}",
                record.name, node
            )));
        }
        Ok(())
    }

    pub async fn create_filesystem(
        &self,
        resource: &str,
        node: &str,
        volume_id: u32,
        fstype: &str,
    ) -> Result<ResourceRecord> {
        validate_object_name("filesystem type", fstype)?;
        let _guard = self.ctx.locks.acquire(resource).await;
        let (mut record, revision) = self.ctx.resource(resource)?;
        self.hosting(&record, node)?;
        let volume = record.volume(volume_id).cloned().ok_or_else(|| {
            Error::NotFound(format!("volume {} of resource {}", volume_id, resource))
        })?;
        if let Some(existing) = &volume.filesystem {
            return Err(Error::AlreadyExists(format!(
                "volume {} of {} already carries {}",
                volume_id, resource, existing
            )));
        }
        self.require_live_primary(&record, node).await?;

        self.ctx
            .client(node)?
            .fs_format(&volume.device(), fstype)
            .await?;
        tracing::info!(resource = %resource, volume = volume_id, fstype = %fstype, "filesystem created");

        if let Some(v) = record.volume_mut(volume_id) {
            v.filesystem = Some(fstype.to_string());
        }
        self.ctx
            .store
            .put_if(&keys::resource(resource), Expect::Revision(revision), &record)?;
        Ok(record)
    }

    pub async fn mount(
        &self,
        resource: &str,
        node: &str,
        volume_id: u32,
        path: &str,
        fstype: Option<&str>,
    ) -> Result<ResourceRecord> {
        validate_mount_path(path)?;
        let _guard = self.ctx.locks.acquire(resource).await;
        let (mut record, revision) = self.ctx.resource(resource)?;
        self.hosting(&record, node)?;
        if self.ctx.ha_config(resource)?.is_some() {
            return Err(Error::PreconditionFailed(format!(
                "{} is highly available; the promoter owns its mounts",
                resource
            )));
        }
        let volume = record.volume(volume_id).cloned().ok_or_else(|| {
            Error::NotFound(format!("volume {} of resource {}", volume_id, resource))
        })?;
        let fstype = match fstype.map(str::to_string).or(volume.filesystem.clone()) {
            Some(f) => f,
            None => {
                return Err(Error::PreconditionFailed(format!(
                    "volume {} of {} has no filesystem",
                    volume_id, resource
                )))
            }
        };
        if record.mounts.iter().any(|m| m.node == node && m.path == path) {
            return Err(Error::AlreadyExists(format!("mount {} on {}", path, node)));
        }
        self.require_live_primary(&record, node).await?;

        self.ctx
            .client(node)?
            .mount(&volume.device(), path, &fstype)
            .await?;
        tracing::info!(resource = %resource, node = %node, path = %path, "mounted");

        record.mounts.push(MountRecord {
            node: node.to_string(),
            volume: volume_id,
            path: path.to_string(),
            fstype,
        });
        self.ctx
            .store
            .put_if(&keys::resource(resource), Expect::Revision(revision), &record)?;
        Ok(record)
    }

    pub async fn unmount(&self, resource: &str, node: &str, path: &str) -> Result<ResourceRecord> {
        let _guard = self.ctx.locks.acquire(resource).await;
        let (mut record, revision) = self.ctx.resource(resource)?;
        if !record.mounts.iter().any(|m| m.node == node && m.path == path) {
            return Err(Error::NotFound(format!("mount {} on {}", path, node)));
        }

        ignore_missing(self.ctx.client(node)?.unmount(path).await)?;
        tracing::info!(resource = %resource, node = %node, path = %path, "unmounted");

        record.mounts.retain(|m| !(m.node == node && m.path == path));
        self.ctx
            .store
            .put_if(&keys::resource(resource), Expect::Revision(revision), &record)?;
        Ok(record)
    }

    /// Query every node and store what they report.
    pub async fn status(&self, resource: &str) -> Result<ResourceStatus> {
        let _guard = self.ctx.locks.acquire(resource).await;
        let (mut record, revision) = self.ctx.resource(resource)?;
        let observed = self.ctx.observe(&record).await;
        apply_observed(&mut record, &observed);
        self.ctx
            .store
            .put_if(&keys::resource(resource), Expect::Revision(revision), &record)?;

        let nodes = observed
            .into_iter()
            .map(|(node, status)| {
                let liveness = self
                    .ctx
                    .registry
                    .liveness(&node)
                    .unwrap_or(NodeLiveness::Unknown);
                match status {
                    Ok(s) => NodeStatus {
                        node,
                        liveness,
                        role: s.role,
                        disk_state: s.disk_state,
                        replication_state: s.replication_state,
                        error: None,
                    },
                    Err(e) => NodeStatus {
                        node,
                        liveness,
                        role: Role::Unknown,
                        disk_state: None,
                        replication_state: None,
                        error: Some(e.to_string()),
                    },
                }
            })
            .collect();
        Ok(ResourceStatus {
            resource: record,
            nodes,
        })
    }
}

//! Startup recovery of resource workflows left incomplete by a crash or shutdown

use super::create::{CreateDetail, STEP_BRING_UP};
use super::volumes::{AddVolumeDetail, RemoveVolumeDetail, ResizeDetail, STEP_ADJUST};
use super::{Orchestrator, Progress};
use crate::controller::context::WorkflowScope;
use crate::controller::records::{IntentRecord, IntentState, ResourceState, WorkflowKind};
use crate::common::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Intent ids by how their recovery ended
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub resumed: Vec<String>,
    pub rolled_back: Vec<String>,
    pub failed: Vec<String>,
}

impl RecoveryReport {
    pub fn merge(&mut self, other: RecoveryReport) {
        self.resumed.extend(other.resumed);
        self.rolled_back.extend(other.rolled_back);
        self.failed.extend(other.failed);
    }

    pub fn is_empty(&self) -> bool {
        self.resumed.is_empty() && self.rolled_back.is_empty() && self.failed.is_empty()
    }
}

enum Outcome {
    Resumed,
    RolledBack,
}

fn detail<T: DeserializeOwned>(intent: &IntentRecord) -> Result<T> {
    serde_json::from_value(intent.detail.clone()).map_err(|e| {
        Error::Corrupted(format!("intent {} carries unreadable detail: {}", intent.id, e))
    })
}

impl Orchestrator {
    /// Resume or undo every incomplete resource workflow.
    ///
    /// Creates that reached bring-up are re-run (every step is idempotent);
    /// earlier ones are rolled back. Add-volume follows the same rule at its
    /// adjust step. Deletes, removals and resizes are re-run.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        for intent in self.ctx.intents.incomplete()? {
            if matches!(intent.kind, WorkflowKind::MakeHa | WorkflowKind::DeleteHa) {
                continue;
            }
            let id = intent.id.clone();
            let kind = intent.kind;
            let _guard = self.ctx.locks.acquire(&intent.resource).await;
            let scope = WorkflowScope::detached(self.ctx.shutdown.clone(), self.ctx.parallelism(kind));
            tracing::info!(
                intent = %id,
                kind = kind.as_str(),
                resource = %intent.resource,
                checkpoint = intent.checkpoint,
                "recovering workflow"
            );

            match self.recover_one(&scope, intent).await {
                Ok(Outcome::Resumed) => report.resumed.push(id),
                Ok(Outcome::RolledBack) => report.rolled_back.push(id),
                Err(e) if e.rollback_status().is_some() => {
                    tracing::warn!(intent = %id, error = %e, "resumed workflow rolled back");
                    report.rolled_back.push(id);
                }
                Err(e) => {
                    tracing::error!(intent = %id, error = %e, "workflow recovery failed");
                    if !scope.shutting_down() {
                        self.close_failed(&id, &e);
                    }
                    report.failed.push(id);
                }
            }
        }
        Ok(report)
    }

    /// Close an intent recovery could not act on, unless a workflow already did.
    fn close_failed(&self, id: &str, error: &Error) {
        match self.ctx.intents.get(id) {
            Ok(Some(mut intent)) if !intent.state.is_terminal() => {
                if let Err(e) = self
                    .ctx
                    .intents
                    .finish(&mut intent, IntentState::Failed, Some(error.to_string()))
                {
                    tracing::error!(intent = %id, error = %e, "cannot close intent");
                }
            }
            Ok(_) => {}
            Err(e) => tracing::error!(intent = %id, error = %e, "cannot read intent"),
        }
    }

    async fn recover_one(&self, scope: &WorkflowScope, mut intent: IntentRecord) -> Result<Outcome> {
        let record = match self.ctx.resource(&intent.resource) {
            Ok((record, _)) => Some(record),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };

        match intent.kind {
            WorkflowKind::CreateResource => {
                let Some(record) = record else {
                    self.ctx.intents.finish(
                        &mut intent,
                        IntentState::RolledBack,
                        Some("resource record missing".into()),
                    )?;
                    return Ok(Outcome::RolledBack);
                };
                if record.state == ResourceState::Ready {
                    self.ctx.intents.finish(&mut intent, IntentState::Completed, None)?;
                    return Ok(Outcome::Resumed);
                }
                let target = detail::<CreateDetail>(&intent)?.target;
                let progress = Progress::all(&record.nodes, intent.checkpoint);
                if intent.checkpoint >= STEP_BRING_UP {
                    self.drive_create(scope, intent, record, target, progress).await?;
                    Ok(Outcome::Resumed)
                } else {
                    let error = Error::Cancelled("controller restarted during create".into());
                    let error = self
                        .undo_create(&mut intent, &record, &target, &progress, error)
                        .await;
                    tracing::info!(resource = %record.name, rollback = ?error.rollback_status(), "interrupted create undone");
                    Ok(Outcome::RolledBack)
                }
            }

            WorkflowKind::DeleteResource => match record {
                Some(record) => {
                    self.drive_delete(scope, &mut intent, record).await?;
                    Ok(Outcome::Resumed)
                }
                None => {
                    self.ctx.intents.finish(&mut intent, IntentState::Completed, None)?;
                    Ok(Outcome::Resumed)
                }
            },

            WorkflowKind::AddVolume => {
                let AddVolumeDetail { volume, target } = detail(&intent)?;
                let record = record.ok_or_else(|| Error::NotFound(format!("resource {}", intent.resource)))?;
                if record.volume(volume.id).is_some() {
                    self.ctx.intents.finish(&mut intent, IntentState::Completed, None)?;
                    return Ok(Outcome::Resumed);
                }
                let progress = Progress::all(&record.nodes, intent.checkpoint);
                if intent.checkpoint >= STEP_ADJUST {
                    self.drive_add_volume(scope, intent, record, volume, target, progress)
                        .await?;
                    Ok(Outcome::Resumed)
                } else {
                    let tally = self
                        .undo_add_volume(&record, &volume, &target, &progress, None)
                        .await;
                    let error = Error::Cancelled("controller restarted during add-volume".into());
                    self.rolled_back(&mut intent, error, tally.status(), Vec::new());
                    Ok(Outcome::RolledBack)
                }
            }

            WorkflowKind::RemoveVolume => {
                let RemoveVolumeDetail { volume_id } = detail(&intent)?;
                match record {
                    Some(record) if record.volume(volume_id).is_some() => {
                        self.drive_remove_volume(scope, &mut intent, record, volume_id)
                            .await?;
                    }
                    _ => self.ctx.intents.finish(&mut intent, IntentState::Completed, None)?,
                }
                Ok(Outcome::Resumed)
            }

            WorkflowKind::ResizeVolume => {
                let ResizeDetail {
                    volume_id,
                    new_size_gib,
                    target,
                } = detail(&intent)?;
                let record = record.ok_or_else(|| Error::NotFound(format!("resource {}", intent.resource)))?;
                match record.volume(volume_id) {
                    Some(v) if v.size_gib < new_size_gib => {
                        self.drive_resize(scope, &mut intent, record, volume_id, new_size_gib, target)
                            .await?;
                    }
                    _ => self.ctx.intents.finish(&mut intent, IntentState::Completed, None)?,
                }
                Ok(Outcome::Resumed)
            }

            WorkflowKind::MakeHa | WorkflowKind::DeleteHa => Ok(Outcome::Resumed),
        }
    }
}

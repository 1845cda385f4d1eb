use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::experiment::{
    ActionLogEntry, ActionReason, AppliedAction, ExperimentError, ExperimentPatch,
    ExperimentResult, RollbackAction, ScheduleUpdate,
};

use super::Autopilot;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RollbackOutcome {
    pub rolled_back: bool,
    /// The applied action that was undone.
    pub action: AppliedAction,
    pub reopened: bool,
    /// `None` for global applies; otherwise whether the canary schedule was removed.
    pub schedule_deleted: Option<bool>,
    pub schedules_updated: usize,
    pub entry: RollbackAction,
}

/// Resolves a signed index into `0..len`. Negative values count from the end.
pub fn resolve_index(len: usize, index: i64) -> Option<usize> {
    let len = i64::try_from(len).ok()?;
    let resolved = if index < 0 { len + index } else { index };
    (0..len).contains(&resolved).then_some(resolved as usize)
}

impl Autopilot {
    /// Undoes an applied action; `index` defaults to -1 (the latest entry) at
    /// call sites.
    ///
    /// The original log entry stays in place and a rollback entry is appended.
    /// Restored settings reach only schedules that have not started yet.
    pub async fn rollback_auto(
        &self,
        experiment_id: &str,
        index: i64,
    ) -> ExperimentResult<RollbackOutcome> {
        let experiment = self.experiments.get_experiment(experiment_id).await?;
        let position = resolve_index(experiment.autopilot_actions.len(), index).ok_or_else(|| {
            ExperimentError::ActionNotFound {
                experiment_id: experiment_id.to_string(),
                index,
            }
        })?;
        let action = match &experiment.autopilot_actions[position] {
            ActionLogEntry::Applied(action) => action.clone(),
            other => {
                return Err(ExperimentError::ActionNotRollbackable {
                    experiment_id: experiment_id.to_string(),
                    index,
                    reason: other.reason().to_string(),
                })
            }
        };

        let reopened = experiment.winner.as_deref() == Some(action.variant_id.as_str());
        if reopened {
            self.experiments
                .update_experiment(experiment_id, &ExperimentPatch::reopened())
                .await?;
        }

        let schedule_deleted = match action.created_schedule_id() {
            Some(schedule_id) => match self.scheduler.delete_promotion_schedule(schedule_id).await
            {
                Ok(deleted) => Some(deleted),
                Err(err) => {
                    warn!(
                        target: "autopilot.rollback",
                        experiment_id,
                        schedule_id,
                        error = %err,
                        "failed to delete canary schedule"
                    );
                    Some(false)
                }
            },
            None => None,
        };

        let now = Utc::now();
        let mut schedules_updated = 0;
        if let Some(previous) = &action.previous_promotion_settings {
            self.contents
                .set_optimized_promotion_settings(&experiment.content_id, previous)
                .await?;
            let update = ScheduleUpdate::settings(previous);
            let schedules = self
                .scheduler
                .content_promotion_schedules(&experiment.content_id)
                .await?;
            for schedule in schedules.iter().filter(|schedule| schedule.starts_after(now)) {
                self.scheduler
                    .update_promotion_schedule(&schedule.id, &update)
                    .await?;
                schedules_updated += 1;
            }
        }

        let entry = RollbackAction {
            variant_id: action.variant_id.clone(),
            rolled_back_at: now,
            reason: ActionReason::AutopilotRollback,
            original_action: action.clone(),
        };
        self.experiments
            .append_action(experiment_id, &ActionLogEntry::RolledBack(entry.clone()))
            .await?;

        info!(
            target: "autopilot.rollback",
            experiment_id,
            variant_id = %action.variant_id,
            reopened,
            schedule_deleted = ?schedule_deleted,
            schedules_updated,
            "rolled back autopilot action"
        );

        Ok(RollbackOutcome {
            rolled_back: true,
            action,
            reopened,
            schedule_deleted,
            schedules_updated,
            entry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::resolve_index;

    #[test]
    fn negative_indices_count_from_end() {
        assert_eq!(resolve_index(3, -1), Some(2));
        assert_eq!(resolve_index(3, -3), Some(0));
        assert_eq!(resolve_index(3, -4), None);
        assert_eq!(resolve_index(3, 0), Some(0));
        assert_eq!(resolve_index(3, 3), None);
        assert_eq!(resolve_index(0, -1), None);
    }
}

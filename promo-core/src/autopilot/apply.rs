use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::experiment::{
    pick_winner, ActionLogEntry, ActionReason, AppliedAction, ApplyPath, Decision, Experiment,
    ExperimentPatch, ExperimentResult, ExperimentStatus, RejectedAction, ScheduleRequest, Variant,
};

use super::Autopilot;

const MAX_RAMP_HOURS: f64 = 24.0 * 366.0;
const FALLBACK_RAMP_HOURS: f64 = 24.0;

/// Caller-supplied knobs for a single apply.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ApplyOptions {
    /// Positive values book a bounded canary schedule instead of a global swap.
    pub canary_pct: Option<f64>,
    pub ramp_hours: Option<f64>,
}

impl ApplyOptions {
    pub fn global() -> Self {
        Self::default()
    }

    pub fn canary(canary_pct: f64) -> Self {
        Self {
            canary_pct: Some(canary_pct),
            ramp_hours: None,
        }
    }

    pub fn with_ramp_hours(mut self, hours: f64) -> Self {
        self.ramp_hours = Some(hours);
        self
    }

    fn canary_pct(&self) -> Option<f64> {
        self.canary_pct.filter(|pct| pct.is_finite() && *pct > 0.0)
    }
}

/// Policy reasons an apply was refused. Each one is logged, never raised.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Rejection {
    RequiresApproval,
    BudgetIncreaseDisallowed {
        attempted_budget_change_percent: f64,
    },
    BudgetChangeExceedsMax {
        attempted_budget_change_percent: f64,
        max_budget_change_percent: f64,
    },
}

impl Rejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rejection::RequiresApproval => "requires_approval",
            Rejection::BudgetIncreaseDisallowed { .. } => "budget_increase_disallowed",
            Rejection::BudgetChangeExceedsMax { .. } => "budget_change_exceeds_max",
        }
    }

    pub fn action_reason(&self) -> ActionReason {
        match self {
            Rejection::RequiresApproval => ActionReason::AutopilotRejectedRequiresApproval,
            Rejection::BudgetIncreaseDisallowed { .. } => {
                ActionReason::AutopilotRejectedBudgetIncrease
            }
            Rejection::BudgetChangeExceedsMax { .. } => {
                ActionReason::AutopilotRejectedBudgetChangeExceedsMax
            }
        }
    }

    pub fn attempted_budget_change_percent(&self) -> Option<f64> {
        match self {
            Rejection::RequiresApproval => None,
            Rejection::BudgetIncreaseDisallowed {
                attempted_budget_change_percent,
            }
            | Rejection::BudgetChangeExceedsMax {
                attempted_budget_change_percent,
                ..
            } => Some(*attempted_budget_change_percent),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ApplyOutcome {
    /// Routine "not yet": nothing was logged.
    NotApplied { decision: Decision },
    /// The experiment already has a winner; nothing was touched.
    AlreadyCompleted { winner: Option<String> },
    Rejected {
        rejection: Rejection,
        decision: Decision,
    },
    Applied {
        variant_id: String,
        path: ApplyPath,
        action: AppliedAction,
        decision: Decision,
    },
}

impl ApplyOutcome {
    pub fn applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied { .. })
    }

    pub fn reason(&self) -> &'static str {
        match self {
            ApplyOutcome::NotApplied { decision } => decision.reason.as_str(),
            ApplyOutcome::AlreadyCompleted { .. } => "already_completed",
            ApplyOutcome::Rejected { rejection, .. } => rejection.as_str(),
            ApplyOutcome::Applied { path, .. } => path.action_reason().as_str(),
        }
    }

    pub fn decision(&self) -> Option<&Decision> {
        match self {
            ApplyOutcome::NotApplied { decision }
            | ApplyOutcome::Rejected { decision, .. }
            | ApplyOutcome::Applied { decision, .. } => Some(decision),
            ApplyOutcome::AlreadyCompleted { .. } => None,
        }
    }
}

/// Relative change from `previous` to `next` in percent; 0 without a previous budget.
pub fn budget_change_percent(previous: f64, next: f64) -> f64 {
    if previous == 0.0 {
        return 0.0;
    }
    (next - previous) / previous * 100.0
}

/// Canary spend: `canary_pct` of the previous budget, or of the new one when
/// there is no previous budget, rounded and floored at `min_budget`.
pub fn canary_budget(previous: f64, next: f64, canary_pct: f64, min_budget: f64) -> f64 {
    let reference = if previous > 0.0 { previous } else { next };
    (reference * canary_pct / 100.0).round().max(min_budget)
}

impl Autopilot {
    /// Safety-gated apply of the winning variant.
    ///
    /// Policy refusals come back as [`ApplyOutcome::Rejected`] after being
    /// logged. Collaborator failures are returned as errors, except a failed
    /// canary booking, which falls back to the global apply.
    pub async fn apply_auto(
        &self,
        experiment_id: &str,
        options: ApplyOptions,
    ) -> ExperimentResult<ApplyOutcome> {
        let experiment = self.experiments.get_experiment(experiment_id).await?;
        if experiment.status == ExperimentStatus::Completed {
            return Ok(ApplyOutcome::AlreadyCompleted {
                winner: experiment.winner.clone(),
            });
        }

        let decision = self.engine.decide(&experiment);
        if !decision.should_apply {
            info!(
                target: "autopilot.apply",
                experiment_id,
                reason = %decision.reason,
                "decision does not apply"
            );
            return Ok(ApplyOutcome::NotApplied { decision });
        }

        let autopilot = &experiment.autopilot;
        if !autopilot.is_approved() {
            let variant_id = decision.winner().map(str::to_string);
            return self
                .reject(&experiment, variant_id, Rejection::RequiresApproval, decision)
                .await;
        }

        let Some(winner) = pick_winner(&experiment.variants) else {
            return Ok(ApplyOutcome::NotApplied { decision });
        };

        let previous_budget = autopilot.previous_budget();
        let new_budget = winner.promotion_settings.budget_or_zero();
        let change = budget_change_percent(previous_budget, new_budget);
        if change > 0.0 && !autopilot.allow_budget_increase {
            let rejection = Rejection::BudgetIncreaseDisallowed {
                attempted_budget_change_percent: change,
            };
            return self
                .reject(&experiment, Some(winner.id.clone()), rejection, decision)
                .await;
        }
        if change.abs() > autopilot.max_budget_change_percent {
            let rejection = Rejection::BudgetChangeExceedsMax {
                attempted_budget_change_percent: change,
                max_budget_change_percent: autopilot.max_budget_change_percent,
            };
            return self
                .reject(&experiment, Some(winner.id.clone()), rejection, decision)
                .await;
        }

        let previous_settings = self
            .contents
            .optimized_promotion_settings(&experiment.content_id)
            .await?;

        let now = Utc::now();
        let path = match options.canary_pct() {
            Some(pct) => {
                let budget = canary_budget(previous_budget, new_budget, pct, self.canary.min_budget);
                let ramp_hours = self.ramp_hours(options.ramp_hours);
                match self
                    .book_canary(&experiment, winner, budget, ramp_hours, now)
                    .await
                {
                    Ok(path) => path,
                    Err(err) => {
                        warn!(
                            target: "autopilot.apply",
                            experiment_id,
                            error = %err,
                            "canary scheduling failed, applying globally"
                        );
                        self.apply_globally(&experiment, winner).await?
                    }
                }
            }
            None => self.apply_globally(&experiment, winner).await?,
        };

        self.experiments
            .update_experiment(experiment_id, &ExperimentPatch::completed(&winner.id, now))
            .await?;

        let action = AppliedAction {
            variant_id: winner.id.clone(),
            confidence: decision.confidence(),
            triggered_at: now,
            reason: path.action_reason(),
            path: path.clone(),
            previous_promotion_settings: previous_settings,
        };
        self.experiments
            .append_action(experiment_id, &ActionLogEntry::Applied(action.clone()))
            .await?;

        info!(
            target: "autopilot.apply",
            experiment_id,
            variant_id = %winner.id,
            reason = %action.reason,
            confidence = action.confidence,
            schedule_id = ?path.schedule_id(),
            "applied winning variant"
        );

        Ok(ApplyOutcome::Applied {
            variant_id: winner.id.clone(),
            path,
            action,
            decision,
        })
    }

    async fn reject(
        &self,
        experiment: &Experiment,
        variant_id: Option<String>,
        rejection: Rejection,
        decision: Decision,
    ) -> ExperimentResult<ApplyOutcome> {
        let entry = ActionLogEntry::Rejected(RejectedAction {
            variant_id,
            confidence: decision.confidence(),
            triggered_at: Utc::now(),
            reason: rejection.action_reason(),
            attempted_budget_change_percent: rejection.attempted_budget_change_percent(),
        });
        self.experiments
            .append_action(&experiment.id, &entry)
            .await?;
        info!(
            target: "autopilot.apply",
            experiment_id = %experiment.id,
            reason = rejection.as_str(),
            attempted_budget_change_percent = ?rejection.attempted_budget_change_percent(),
            "apply rejected"
        );
        Ok(ApplyOutcome::Rejected {
            rejection,
            decision,
        })
    }

    async fn book_canary(
        &self,
        experiment: &Experiment,
        winner: &Variant,
        budget: f64,
        ramp_hours: f64,
        now: DateTime<Utc>,
    ) -> ExperimentResult<ApplyPath> {
        let ends_at = now + Duration::seconds((ramp_hours * 3600.0).round() as i64);
        let request = ScheduleRequest {
            experiment_id: Some(experiment.id.clone()),
            variant_id: Some(winner.id.clone()),
            platform: winner.promotion_settings.platform.clone(),
            budget,
            start_time: now,
            end_time: Some(ends_at),
            is_canary: true,
            promotion_settings: winner.promotion_settings.with_budget(budget),
        };
        let schedule = self
            .scheduler
            .schedule_promotion(&experiment.content_id, &request)
            .await?;
        Ok(ApplyPath::Canary {
            schedule_id: schedule.id,
            canary_budget: budget,
            starts_at: now,
            ends_at,
        })
    }

    async fn apply_globally(
        &self,
        experiment: &Experiment,
        winner: &Variant,
    ) -> ExperimentResult<ApplyPath> {
        match self
            .applier
            .apply_winning_settings(&experiment.content_id, winner)
            .await
        {
            Ok(_) => Ok(ApplyPath::Global),
            Err(err) => {
                error!(
                    target: "autopilot.apply",
                    experiment_id = %experiment.id,
                    variant_id = %winner.id,
                    error = %err,
                    "global settings apply failed"
                );
                Err(err)
            }
        }
    }

    fn ramp_hours(&self, requested: Option<f64>) -> f64 {
        effective_ramp_hours(requested, self.canary.default_ramp_hours)
    }
}

/// Requested ramp, else the configured default, else 24 hours. A ramp is
/// usable when it is finite, positive and at most 366 days.
pub fn effective_ramp_hours(requested: Option<f64>, configured: f64) -> f64 {
    let usable = |hours: &f64| hours.is_finite() && *hours > 0.0 && *hours <= MAX_RAMP_HOURS;
    requested
        .filter(usable)
        .or_else(|| Some(configured).filter(usable))
        .unwrap_or(FALLBACK_RAMP_HOURS)
}

use async_trait::async_trait;

use super::error::ExperimentResult;
use super::models::{
    ActionLogEntry, AppliedSettings, Experiment, ExperimentPatch, PromotionSchedule,
    PromotionSettings, ScheduleRequest, ScheduleUpdate, Variant,
};

/// Document store holding experiments and their autopilot action log.
///
/// Implementations must not lose concurrent appends to the action log.
/// Concurrent applies on the same experiment are not synchronized here; the
/// caller provides at most one in-flight apply per experiment.
#[async_trait]
pub trait ExperimentStore: Send + Sync {
    async fn get_experiment(&self, experiment_id: &str) -> ExperimentResult<Experiment>;

    async fn update_experiment(
        &self,
        experiment_id: &str,
        patch: &ExperimentPatch,
    ) -> ExperimentResult<()>;

    async fn append_action(
        &self,
        experiment_id: &str,
        entry: &ActionLogEntry,
    ) -> ExperimentResult<()>;
}

#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn optimized_promotion_settings(
        &self,
        content_id: &str,
    ) -> ExperimentResult<Option<PromotionSettings>>;

    async fn set_optimized_promotion_settings(
        &self,
        content_id: &str,
        settings: &PromotionSettings,
    ) -> ExperimentResult<()>;
}

/// Permanent swap of a winning variant's settings onto a content record and
/// its future schedules.
#[async_trait]
pub trait SettingsApplier: Send + Sync {
    async fn apply_winning_settings(
        &self,
        content_id: &str,
        variant: &Variant,
    ) -> ExperimentResult<AppliedSettings>;
}

#[async_trait]
pub trait PromotionScheduler: Send + Sync {
    async fn schedule_promotion(
        &self,
        content_id: &str,
        request: &ScheduleRequest,
    ) -> ExperimentResult<PromotionSchedule>;

    async fn content_promotion_schedules(
        &self,
        content_id: &str,
    ) -> ExperimentResult<Vec<PromotionSchedule>>;

    async fn update_promotion_schedule(
        &self,
        schedule_id: &str,
        update: &ScheduleUpdate,
    ) -> ExperimentResult<()>;

    /// Returns `false` when no such schedule existed.
    async fn delete_promotion_schedule(&self, schedule_id: &str) -> ExperimentResult<bool>;
}

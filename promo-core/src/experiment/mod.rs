pub mod collaborators;
pub mod decision;
pub mod error;
pub mod models;
pub mod scoring;
pub mod stats;
pub mod store;

pub use collaborators::{ContentStore, ExperimentStore, PromotionScheduler, SettingsApplier};
pub use decision::{
    decide_auto_apply, risk_score, Decision, DecisionEngine, DecisionReason, Evaluation,
    Simulation,
};
pub use error::{ExperimentError, ExperimentResult};
pub use models::{
    ActionLogEntry, ActionReason, AppliedAction, AppliedSettings, ApplyPath, AutopilotConfig,
    AutopilotMode, Experiment, ExperimentPatch, ExperimentStatus, PromotionSchedule,
    PromotionSettings, RejectedAction, RollbackAction, ScheduleRequest, ScheduleUpdate, Variant,
    VariantMetrics,
};
pub use scoring::{pick_winner, score};
pub use stats::{confidence_for_variants, posterior_samples_top_vs_baseline};
pub use store::{SqliteExperimentStore, SqliteExperimentStoreBuilder};

pub mod autopilot;
pub mod config;
pub mod error;
pub mod experiment;
pub mod sqlite;

pub use autopilot::{
    budget_change_percent, canary_budget, ApplyOptions, ApplyOutcome, Autopilot,
    MetricsUpdateOutcome, Rejection, RollbackOutcome,
};
pub use config::{load_promo_config, CanarySettings, EngineSettings, PromoConfig, StoreSection};
pub use error::{ConfigError, Result};
pub use experiment::{
    decide_auto_apply, pick_winner, ActionLogEntry, ActionReason, AppliedAction, ApplyPath,
    AutopilotConfig, AutopilotMode, ContentStore, Decision, DecisionEngine, DecisionReason,
    Evaluation, Experiment, ExperimentError, ExperimentPatch, ExperimentResult, ExperimentStatus,
    ExperimentStore, PromotionSchedule, PromotionScheduler, PromotionSettings, SettingsApplier,
    Simulation, SqliteExperimentStore, SqliteExperimentStoreBuilder, Variant, VariantMetrics,
};

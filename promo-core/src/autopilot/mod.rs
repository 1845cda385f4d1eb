//! Autopilot workflows over experiments.
//!
//! [`Autopilot`] owns the collaborator handles and drives the two mutating
//! workflows: the safety-gated apply ([`Autopilot::apply_auto`]) and the
//! rollback ([`Autopilot::rollback_auto`]). Both await their collaborators
//! strictly in sequence and write the action log entry last, so an entry only
//! ever describes a state change that already happened.

mod apply;
mod rollback;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{CanarySettings, EngineSettings};
use crate::experiment::{
    AutopilotMode, ContentStore, Decision, DecisionEngine, ExperimentResult, ExperimentStore,
    PromotionScheduler, SettingsApplier,
};

pub use apply::{
    budget_change_percent, canary_budget, effective_ramp_hours, ApplyOptions, ApplyOutcome,
    Rejection,
};
pub use rollback::{resolve_index, RollbackOutcome};

pub struct Autopilot {
    experiments: Arc<dyn ExperimentStore>,
    contents: Arc<dyn ContentStore>,
    applier: Arc<dyn SettingsApplier>,
    scheduler: Arc<dyn PromotionScheduler>,
    engine: DecisionEngine,
    canary: CanarySettings,
}

impl fmt::Debug for Autopilot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Autopilot")
            .field("experiments", &"<ExperimentStore>")
            .field("contents", &"<ContentStore>")
            .field("applier", &"<SettingsApplier>")
            .field("scheduler", &"<PromotionScheduler>")
            .field("engine", &self.engine)
            .field("canary", &self.canary)
            .finish()
    }
}

/// Result of the metrics-update trigger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum MetricsUpdateOutcome {
    /// Recommend mode: the decision is surfaced and nothing is mutated.
    Recommended { decision: Decision },
    /// Auto mode: the apply workflow ran.
    Evaluated { outcome: ApplyOutcome },
}

impl Autopilot {
    pub fn new(
        experiments: Arc<dyn ExperimentStore>,
        contents: Arc<dyn ContentStore>,
        applier: Arc<dyn SettingsApplier>,
        scheduler: Arc<dyn PromotionScheduler>,
    ) -> Self {
        Self {
            experiments,
            contents,
            applier,
            scheduler,
            engine: DecisionEngine::default(),
            canary: CanarySettings::default(),
        }
    }

    /// Wires every collaborator to a single backend, such as the SQLite store.
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: ExperimentStore + ContentStore + SettingsApplier + PromotionScheduler + 'static,
    {
        Self::new(
            backend.clone(),
            backend.clone(),
            backend.clone(),
            backend,
        )
    }

    pub fn with_engine_settings(mut self, settings: EngineSettings) -> Self {
        self.engine = DecisionEngine::new(settings);
        self
    }

    pub fn with_canary_settings(mut self, settings: CanarySettings) -> Self {
        self.canary = settings;
        self
    }

    pub fn engine(&self) -> &DecisionEngine {
        &self.engine
    }

    /// Loads the experiment and evaluates it without side effects.
    pub async fn decide(&self, experiment_id: &str) -> ExperimentResult<Decision> {
        let experiment = self.experiments.get_experiment(experiment_id).await?;
        Ok(self.engine.decide(&experiment))
    }

    /// Entry point for the external metrics-update trigger.
    pub async fn on_metrics_update(
        &self,
        experiment_id: &str,
        options: ApplyOptions,
    ) -> ExperimentResult<MetricsUpdateOutcome> {
        let experiment = self.experiments.get_experiment(experiment_id).await?;
        match experiment.autopilot.mode {
            AutopilotMode::Recommend => {
                let decision = self.engine.decide(&experiment);
                info!(
                    target: "autopilot.decision",
                    experiment_id,
                    should_apply = decision.should_apply,
                    reason = %decision.reason,
                    "recommendation only"
                );
                Ok(MetricsUpdateOutcome::Recommended { decision })
            }
            AutopilotMode::Auto => {
                let outcome = self.apply_auto(experiment_id, options).await?;
                Ok(MetricsUpdateOutcome::Evaluated { outcome })
            }
        }
    }
}

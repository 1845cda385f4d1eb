use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::EngineSettings;

use super::models::{Experiment, Variant};
use super::scoring::pick_winner;
use super::stats::{
    confidence_for_variants, percentile, posterior_samples_top_vs_baseline, sort_samples,
    top_by_rate,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    AutopilotDisabled,
    MinSampleNotMet,
    NoVariants,
    AboveThreshold,
    BelowThreshold,
}

impl DecisionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionReason::AutopilotDisabled => "autopilot_disabled",
            DecisionReason::MinSampleNotMet => "min_sample_not_met",
            DecisionReason::NoVariants => "no_variants",
            DecisionReason::AboveThreshold => "above_threshold",
            DecisionReason::BelowThreshold => "below_threshold",
        }
    }
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Simulation {
    pub samples: Vec<f64>,
    pub p50: f64,
    pub p95: f64,
}

/// Statistics computed once the sample gate is passed.
///
/// `winner` is the score-based pick whose settings get applied; `top_variant`
/// and `top_rate` come from conversion rate and only explain the decision.
/// The two may name different variants.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Evaluation {
    pub winner: String,
    pub confidence: f64,
    pub top_variant: String,
    pub predicted_uplift: f64,
    pub inc_conversions_per_1000_views: f64,
    pub estimated_revenue_change_per_1000_views: f64,
    pub baseline_rate: f64,
    pub top_rate: f64,
    pub risk_score: f64,
    pub simulation: Simulation,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    pub should_apply: bool,
    pub reason: DecisionReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_views: Option<u64>,
    pub min_sample: u64,
    pub confidence_threshold: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<Evaluation>,
}

impl Decision {
    fn held(reason: DecisionReason, total_views: Option<u64>, experiment: &Experiment) -> Self {
        Self {
            should_apply: false,
            reason,
            total_views,
            min_sample: experiment.autopilot.min_sample,
            confidence_threshold: experiment.autopilot.confidence_threshold,
            evaluation: None,
        }
    }

    pub fn winner(&self) -> Option<&str> {
        self.evaluation.as_ref().map(|eval| eval.winner.as_str())
    }

    pub fn confidence(&self) -> f64 {
        self.evaluation
            .as_ref()
            .map(|eval| eval.confidence)
            .unwrap_or(0.0)
    }

    /// One-line explanation suitable for an operator dashboard.
    pub fn summary(&self) -> String {
        let views = self.total_views.unwrap_or(0);
        match (self.reason, &self.evaluation) {
            (DecisionReason::AutopilotDisabled, _) => "autopilot disabled".to_string(),
            (DecisionReason::MinSampleNotMet, _) => format!(
                "minimum sample not met: {views} views, need {}",
                self.min_sample
            ),
            (DecisionReason::NoVariants, _) => "experiment has no variants".to_string(),
            (DecisionReason::AboveThreshold, Some(eval)) => format!(
                "above threshold: {:.1}% confidence (need {:.1}%), apply {}",
                eval.confidence, self.confidence_threshold, eval.winner
            ),
            (DecisionReason::BelowThreshold, Some(eval)) => format!(
                "below threshold: {:.1}% confidence, need {:.1}%",
                eval.confidence, self.confidence_threshold
            ),
            (reason, None) => reason.as_str().to_string(),
        }
    }
}

/// Pure decision over an experiment snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecisionEngine {
    settings: EngineSettings,
}

impl DecisionEngine {
    pub fn new(settings: EngineSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn decide(&self, experiment: &Experiment) -> Decision {
        let autopilot = &experiment.autopilot;
        if !autopilot.enabled {
            return Decision::held(DecisionReason::AutopilotDisabled, None, experiment);
        }

        let total_views = experiment.total_views();
        if total_views < autopilot.min_sample {
            return Decision::held(DecisionReason::MinSampleNotMet, Some(total_views), experiment);
        }

        let variants = &experiment.variants;
        let (Some(winner), Some(top)) = (pick_winner(variants), top_by_rate(variants)) else {
            return Decision::held(DecisionReason::NoVariants, Some(total_views), experiment);
        };

        let confidence = confidence_for_variants(variants);
        let top_variant = &variants[top];
        let top_rate = top_variant.metrics.conversion_rate();
        let others: Vec<&Variant> = variants
            .iter()
            .enumerate()
            .filter(|(idx, _)| *idx != top)
            .map(|(_, variant)| variant)
            .collect();
        let baseline_rate = mean(others.iter().map(|v| v.metrics.conversion_rate()));

        let rate_delta = top_rate - baseline_rate;
        let predicted_uplift = if baseline_rate > 0.0 {
            rate_delta / baseline_rate * 100.0
        } else {
            0.0
        };
        let inc_conversions_per_1000_views = rate_delta * 1000.0;
        let avg_revenue_per_conversion = if top_variant.metrics.conversions > 0 {
            top_variant.metrics.revenue_per_conversion()
        } else {
            mean(others.iter().map(|v| v.metrics.revenue_per_conversion()))
        };
        let estimated_revenue_change_per_1000_views =
            inc_conversions_per_1000_views * avg_revenue_per_conversion;

        let risk_score = risk_score(confidence, total_views, autopilot.min_sample);
        let simulation = self.simulate(experiment);

        let should_apply = confidence >= autopilot.confidence_threshold;
        let reason = if should_apply {
            DecisionReason::AboveThreshold
        } else {
            DecisionReason::BelowThreshold
        };

        debug!(
            target: "autopilot.decision",
            experiment_id = %experiment.id,
            winner = %winner.id,
            top_variant = %top_variant.id,
            confidence,
            threshold = autopilot.confidence_threshold,
            risk_score,
            reason = %reason,
            "evaluated experiment"
        );

        Decision {
            should_apply,
            reason,
            total_views: Some(total_views),
            min_sample: autopilot.min_sample,
            confidence_threshold: autopilot.confidence_threshold,
            evaluation: Some(Evaluation {
                winner: winner.id.clone(),
                confidence,
                top_variant: top_variant.id.clone(),
                predicted_uplift,
                inc_conversions_per_1000_views,
                estimated_revenue_change_per_1000_views,
                baseline_rate,
                top_rate,
                risk_score,
                simulation,
            }),
        }
    }

    fn simulate(&self, experiment: &Experiment) -> Simulation {
        let seed = simulation_seed(&experiment.variants, self.settings.seed);
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        let samples = posterior_samples_top_vs_baseline(
            &experiment.variants,
            self.settings.simulation_samples,
            &mut rng,
        );
        let mut sorted = samples.clone();
        sort_samples(&mut sorted);
        Simulation {
            p50: percentile(&sorted, 0.5),
            p95: percentile(&sorted, 0.95),
            samples,
        }
    }
}

/// Decides with default engine settings.
pub fn decide_auto_apply(experiment: &Experiment) -> Decision {
    DecisionEngine::default().decide(experiment)
}

/// Risk in [0, 100]: mean of the confidence gap and the sample shortfall.
pub fn risk_score(confidence: f64, total_views: u64, min_sample: u64) -> f64 {
    let confidence_gap = 1.0 - (confidence / 100.0).clamp(0.0, 1.0);
    let coverage = if min_sample == 0 {
        1.0
    } else {
        (total_views as f64 / min_sample as f64).min(1.0)
    };
    let shortfall = 1.0 - coverage;
    ((confidence_gap + shortfall) / 2.0 * 100.0).clamp(0.0, 100.0)
}

/// Seed derived from the variant counters, so an unchanged experiment
/// always replays the same simulation.
fn simulation_seed(variants: &[Variant], global_seed: u64) -> u64 {
    let mut hasher = DefaultHasher::new();
    global_seed.hash(&mut hasher);
    for variant in variants {
        variant.id.hash(&mut hasher);
        variant.metrics.views.hash(&mut hasher);
        variant.metrics.engagement.hash(&mut hasher);
        variant.metrics.conversions.hash(&mut hasher);
        variant.metrics.revenue.to_bits().hash(&mut hasher);
    }
    hasher.finish()
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), value| (sum + value, count + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

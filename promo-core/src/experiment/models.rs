use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Per-variant counters. Missing fields deserialize as zero.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VariantMetrics {
    pub views: u64,
    pub engagement: u64,
    pub conversions: u64,
    pub revenue: f64,
}

impl VariantMetrics {
    pub fn new(views: u64, engagement: u64, conversions: u64, revenue: f64) -> Self {
        Self {
            views,
            engagement,
            conversions,
            revenue,
        }
    }

    /// Conversions per view; zero views yields a zero rate.
    pub fn conversion_rate(&self) -> f64 {
        if self.views == 0 {
            return 0.0;
        }
        self.conversions as f64 / self.views as f64
    }

    /// Revenue per conversion, treating zero conversions as one.
    pub fn revenue_per_conversion(&self) -> f64 {
        self.revenue / self.conversions.max(1) as f64
    }
}

/// Promotion configuration carried by a variant or a content record.
///
/// Only `budget` is interpreted here; everything else rides along in `extra`
/// so that a settings swap or restore is lossless. An absent budget stays
/// absent and is never written back as zero.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PromotionSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PromotionSettings {
    pub fn new(platform: impl Into<String>, budget: f64) -> Self {
        Self {
            platform: Some(platform.into()),
            budget: Some(budget),
            extra: Map::new(),
        }
    }

    pub fn with_budget(&self, budget: f64) -> Self {
        Self {
            budget: Some(budget),
            ..self.clone()
        }
    }

    /// Budget for arithmetic; a missing budget counts as zero.
    pub fn budget_or_zero(&self) -> f64 {
        self.budget.unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Variant {
    pub id: String,
    #[serde(default)]
    pub metrics: VariantMetrics,
    #[serde(default)]
    pub promotion_settings: PromotionSettings,
}

impl Variant {
    pub fn new(id: impl Into<String>, metrics: VariantMetrics) -> Self {
        Self {
            id: id.into(),
            metrics,
            promotion_settings: PromotionSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: PromotionSettings) -> Self {
        self.promotion_settings = settings;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    #[default]
    Active,
    Completed,
}

impl ExperimentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentStatus::Active => "active",
            ExperimentStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExperimentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ExperimentStatus::Active),
            "completed" => Ok(ExperimentStatus::Completed),
            other => Err(format!("unknown experiment status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AutopilotMode {
    /// Decisions are surfaced to an operator but never applied on a metrics update.
    #[default]
    Recommend,
    /// Confident decisions are applied as soon as a metrics update arrives.
    Auto,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AutopilotConfig {
    pub enabled: bool,
    /// Percentage in [0, 100].
    pub confidence_threshold: f64,
    pub min_sample: u64,
    pub max_budget_change_percent: f64,
    pub allow_budget_increase: bool,
    pub mode: AutopilotMode,
    pub requires_approval: bool,
    pub approved_by: Option<String>,
    pub previous_promotion_settings: Option<PromotionSettings>,
}

impl Default for AutopilotConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            confidence_threshold: 95.0,
            min_sample: 100,
            max_budget_change_percent: 50.0,
            allow_budget_increase: false,
            mode: AutopilotMode::Recommend,
            requires_approval: false,
            approved_by: None,
            previous_promotion_settings: None,
        }
    }
}

impl AutopilotConfig {
    /// True unless approval is required and nobody has signed off.
    pub fn is_approved(&self) -> bool {
        if !self.requires_approval {
            return true;
        }
        self.approved_by
            .as_deref()
            .map(|approver| !approver.trim().is_empty())
            .unwrap_or(false)
    }

    pub fn previous_budget(&self) -> f64 {
        self.previous_promotion_settings
            .as_ref()
            .map(PromotionSettings::budget_or_zero)
            .unwrap_or(0.0)
    }
}

/// Experiment document as held by the experiment store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Experiment {
    pub id: String,
    pub content_id: String,
    #[serde(default)]
    pub variants: Vec<Variant>,
    #[serde(default)]
    pub status: ExperimentStatus,
    #[serde(default)]
    pub winner: Option<String>,
    #[serde(default)]
    pub completed_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub autopilot: AutopilotConfig,
    #[serde(default)]
    pub autopilot_actions: Vec<ActionLogEntry>,
}

impl Experiment {
    pub fn new(id: impl Into<String>, content_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content_id: content_id.into(),
            variants: Vec::new(),
            status: ExperimentStatus::Active,
            winner: None,
            completed_date: None,
            autopilot: AutopilotConfig::default(),
            autopilot_actions: Vec::new(),
        }
    }

    pub fn with_variant(mut self, variant: Variant) -> Self {
        self.variants.push(variant);
        self
    }

    pub fn with_autopilot(mut self, autopilot: AutopilotConfig) -> Self {
        self.autopilot = autopilot;
        self
    }

    pub fn total_views(&self) -> u64 {
        self.variants
            .iter()
            .map(|variant| variant.metrics.views)
            .sum()
    }

    pub fn variant(&self, variant_id: &str) -> Option<&Variant> {
        self.variants.iter().find(|variant| variant.id == variant_id)
    }

    /// `winner` is set exactly when the experiment is completed.
    pub fn is_consistent(&self) -> bool {
        self.winner.is_some() == (self.status == ExperimentStatus::Completed)
    }

    pub fn apply_patch(&mut self, patch: &ExperimentPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(winner) = &patch.winner {
            self.winner = winner.clone();
        }
        if let Some(completed_date) = patch.completed_date {
            self.completed_date = completed_date;
        }
    }
}

/// Partial update of the experiment document. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExperimentPatch {
    pub status: Option<ExperimentStatus>,
    pub winner: Option<Option<String>>,
    pub completed_date: Option<Option<DateTime<Utc>>>,
}

impl ExperimentPatch {
    pub fn completed(winner: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            status: Some(ExperimentStatus::Completed),
            winner: Some(Some(winner.into())),
            completed_date: Some(Some(at)),
        }
    }

    pub fn reopened() -> Self {
        Self {
            status: Some(ExperimentStatus::Active),
            winner: Some(None),
            completed_date: Some(None),
        }
    }
}

/// How a winning variant reached production.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApplyPath {
    /// A bounded-budget schedule was booked; global settings are untouched.
    Canary {
        schedule_id: String,
        canary_budget: f64,
        starts_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
    },
    /// The winner's settings replaced the content's settings.
    Global,
}

impl ApplyPath {
    pub fn schedule_id(&self) -> Option<&str> {
        match self {
            ApplyPath::Canary { schedule_id, .. } => Some(schedule_id),
            ApplyPath::Global => None,
        }
    }

    pub fn action_reason(&self) -> ActionReason {
        match self {
            ApplyPath::Canary { .. } => ActionReason::AutopilotCanaryApply,
            ApplyPath::Global => ActionReason::AutopilotAutoApply,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionReason {
    AutopilotAutoApply,
    AutopilotCanaryApply,
    AutopilotRejectedRequiresApproval,
    AutopilotRejectedBudgetIncrease,
    AutopilotRejectedBudgetChangeExceedsMax,
    AutopilotRollback,
}

impl ActionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionReason::AutopilotAutoApply => "autopilot_auto_apply",
            ActionReason::AutopilotCanaryApply => "autopilot_canary_apply",
            ActionReason::AutopilotRejectedRequiresApproval => {
                "autopilot_rejected_requires_approval"
            }
            ActionReason::AutopilotRejectedBudgetIncrease => "autopilot_rejected_budget_increase",
            ActionReason::AutopilotRejectedBudgetChangeExceedsMax => {
                "autopilot_rejected_budget_change_exceeds_max"
            }
            ActionReason::AutopilotRollback => "autopilot_rollback",
        }
    }
}

impl fmt::Display for ActionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A completed apply. `previous_promotion_settings` is the content's settings
/// snapshot taken before anything was mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppliedAction {
    pub variant_id: String,
    pub confidence: f64,
    pub triggered_at: DateTime<Utc>,
    pub reason: ActionReason,
    pub path: ApplyPath,
    #[serde(default)]
    pub previous_promotion_settings: Option<PromotionSettings>,
}

impl AppliedAction {
    pub fn created_schedule_id(&self) -> Option<&str> {
        self.path.schedule_id()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RejectedAction {
    #[serde(default)]
    pub variant_id: Option<String>,
    pub confidence: f64,
    pub triggered_at: DateTime<Utc>,
    pub reason: ActionReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempted_budget_change_percent: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RollbackAction {
    pub variant_id: String,
    pub rolled_back_at: DateTime<Utc>,
    pub reason: ActionReason,
    pub original_action: AppliedAction,
}

/// One entry of the append-only autopilot action log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionLogEntry {
    Applied(AppliedAction),
    Rejected(RejectedAction),
    RolledBack(RollbackAction),
}

impl ActionLogEntry {
    pub fn kind(&self) -> &'static str {
        match self {
            ActionLogEntry::Applied(_) => "applied",
            ActionLogEntry::Rejected(_) => "rejected",
            ActionLogEntry::RolledBack(_) => "rolled_back",
        }
    }

    pub fn reason(&self) -> ActionReason {
        match self {
            ActionLogEntry::Applied(action) => action.reason,
            ActionLogEntry::Rejected(action) => action.reason,
            ActionLogEntry::RolledBack(action) => action.reason,
        }
    }

    pub fn variant_id(&self) -> Option<&str> {
        match self {
            ActionLogEntry::Applied(action) => Some(&action.variant_id),
            ActionLogEntry::Rejected(action) => action.variant_id.as_deref(),
            ActionLogEntry::RolledBack(action) => Some(&action.variant_id),
        }
    }

    pub fn recorded_at(&self) -> DateTime<Utc> {
        match self {
            ActionLogEntry::Applied(action) => action.triggered_at,
            ActionLogEntry::Rejected(action) => action.triggered_at,
            ActionLogEntry::RolledBack(action) => action.rolled_back_at,
        }
    }

    pub fn as_applied(&self) -> Option<&AppliedAction> {
        match self {
            ActionLogEntry::Applied(action) => Some(action),
            _ => None,
        }
    }
}

/// Schedule booking handed to the promotion scheduler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleRequest {
    pub experiment_id: Option<String>,
    pub variant_id: Option<String>,
    pub platform: Option<String>,
    pub budget: f64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub is_canary: bool,
    pub promotion_settings: PromotionSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromotionSchedule {
    pub id: String,
    pub content_id: String,
    pub experiment_id: Option<String>,
    pub variant_id: Option<String>,
    pub platform: Option<String>,
    pub budget: f64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub is_canary: bool,
    pub promotion_settings: PromotionSettings,
}

impl PromotionSchedule {
    pub fn from_request(
        id: impl Into<String>,
        content_id: impl Into<String>,
        request: &ScheduleRequest,
    ) -> Self {
        Self {
            id: id.into(),
            content_id: content_id.into(),
            experiment_id: request.experiment_id.clone(),
            variant_id: request.variant_id.clone(),
            platform: request.platform.clone(),
            budget: request.budget,
            start_time: request.start_time,
            end_time: request.end_time,
            is_active: true,
            is_canary: request.is_canary,
            promotion_settings: request.promotion_settings.clone(),
        }
    }

    pub fn starts_after(&self, now: DateTime<Utc>) -> bool {
        self.start_time > now
    }

    pub fn apply_update(&mut self, update: &ScheduleUpdate) {
        if let Some(settings) = &update.promotion_settings {
            self.promotion_settings = settings.clone();
        }
        if let Some(budget) = update.budget {
            self.budget = budget;
        }
        if let Some(is_active) = update.is_active {
            self.is_active = is_active;
        }
    }
}

/// Partial update of a promotion schedule.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ScheduleUpdate {
    pub promotion_settings: Option<PromotionSettings>,
    pub budget: Option<f64>,
    pub is_active: Option<bool>,
}

impl ScheduleUpdate {
    /// Replaces the schedule's settings with `settings`. The schedule budget
    /// changes only when `settings` carries one.
    pub fn settings(settings: &PromotionSettings) -> Self {
        Self {
            promotion_settings: Some(settings.clone()),
            budget: settings.budget,
            is_active: None,
        }
    }
}

/// Acknowledgement from the settings-apply collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppliedSettings {
    pub variant_id: String,
    #[serde(default)]
    pub schedules_updated: usize,
}

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use clap::{Args, Parser, Subcommand, ValueEnum};
use promo_core::{
    load_promo_config, ActionLogEntry, ApplyOptions, ApplyOutcome, ApplyPath, Autopilot, Decision,
    Experiment, ExperimentStore, PromoConfig, PromotionSchedule, PromotionScheduler,
    PromotionSettings, RollbackOutcome, SqliteExperimentStore,
};
use serde::Serialize;
use thiserror::Error;
use tokio::runtime::Runtime;
use tracing::debug;
use tracing_subscriber::EnvFilter;

pub type Result<T> = std::result::Result<T, AppError>;

pub const LOG_ENV: &str = "PROMOCTL_LOG";
const DEFAULT_CONFIG: &str = "configs/promo.toml";

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] promo_core::ConfigError),
    #[error("experiment error: {0}")]
    Experiment(#[from] promo_core::ExperimentError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Promotion experiment autopilot control", long_about = None)]
pub struct Cli {
    /// Path to promo.toml; built-in defaults apply when the default path is absent
    #[arg(long, default_value = DEFAULT_CONFIG)]
    pub config: PathBuf,
    /// Override for the experiments database
    #[arg(long)]
    pub db: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Imports an experiment JSON document
    Import(ImportArgs),
    /// Shows an experiment document
    Show(ExperimentArgs),
    /// Evaluates an experiment without applying anything
    Decide(ExperimentArgs),
    /// Runs the safety-gated apply
    Apply(ApplyArgs),
    /// Rolls back an applied autopilot action
    Rollback(RollbackArgs),
    /// Lists the autopilot action log
    Actions(ExperimentArgs),
    /// Content promotion settings
    #[command(subcommand)]
    Content(ContentCommands),
    /// Lists promotion schedules for a content record
    Schedules(ContentArgs),
}

#[derive(Args, Debug)]
pub struct ImportArgs {
    pub file: PathBuf,
}

#[derive(Args, Debug)]
pub struct ExperimentArgs {
    pub experiment_id: String,
}

#[derive(Args, Debug)]
pub struct ApplyArgs {
    pub experiment_id: String,
    /// Books a canary schedule at this share of the reference budget
    #[arg(long)]
    pub canary_pct: Option<f64>,
    /// Canary window length in hours
    #[arg(long)]
    pub ramp_hours: Option<f64>,
}

#[derive(Args, Debug)]
pub struct RollbackArgs {
    pub experiment_id: String,
    /// Action log index; negative values count from the end
    #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
    pub index: i64,
}

#[derive(Subcommand, Debug)]
pub enum ContentCommands {
    /// Replaces the optimized promotion settings from a JSON file
    Set(ContentSetArgs),
    /// Shows the optimized promotion settings
    Show(ContentArgs),
}

#[derive(Args, Debug)]
pub struct ContentSetArgs {
    pub content_id: String,
    pub settings_file: PathBuf,
}

#[derive(Args, Debug)]
pub struct ContentArgs {
    pub content_id: String,
}

/// Installs the stderr subscriber, filtered by `PROMOCTL_LOG` (default `info`).
pub fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

pub fn run(cli: Cli) -> Result<()> {
    let context = AppContext::new(&cli)?;

    match &cli.command {
        Commands::Import(args) => render(&context.import(&args.file)?, cli.format)?,
        Commands::Show(args) => render(&context.show(&args.experiment_id)?, cli.format)?,
        Commands::Decide(args) => render(&context.decide(&args.experiment_id)?, cli.format)?,
        Commands::Apply(args) => {
            let options = ApplyOptions {
                canary_pct: args.canary_pct,
                ramp_hours: args.ramp_hours,
            };
            render(&context.apply(&args.experiment_id, options)?, cli.format)?
        }
        Commands::Rollback(args) => render(
            &context.rollback(&args.experiment_id, args.index)?,
            cli.format,
        )?,
        Commands::Actions(args) => render(&context.actions(&args.experiment_id)?, cli.format)?,
        Commands::Content(ContentCommands::Set(args)) => render(
            &context.content_set(&args.content_id, &args.settings_file)?,
            cli.format,
        )?,
        Commands::Content(ContentCommands::Show(args)) => {
            render(&context.content_show(&args.content_id)?, cli.format)?
        }
        Commands::Schedules(args) => render(&context.schedules(&args.content_id)?, cli.format)?,
    }

    Ok(())
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    runtime: Runtime,
    store: Arc<SqliteExperimentStore>,
    autopilot: Autopilot,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config = load_config(&cli.config)?;
        let db_path = cli
            .db
            .clone()
            .unwrap_or_else(|| config.database_path("."));
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let store = SqliteExperimentStore::builder()
            .path(&db_path)
            .create_if_missing(true)
            .ensure_schema(true)
            .build()?;
        let store = Arc::new(store);
        debug!(target: "promoctl", db = %db_path.display(), "opened experiment store");

        let autopilot = Autopilot::from_backend(store.clone())
            .with_engine_settings(config.engine)
            .with_canary_settings(config.canary);
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        Ok(Self {
            runtime,
            store,
            autopilot,
        })
    }

    fn import(&self, file: &Path) -> Result<ImportReport> {
        let raw = fs::read_to_string(file)?;
        let experiment: Experiment = serde_json::from_str(&raw)?;
        if experiment.id.trim().is_empty() {
            return Err(AppError::InvalidInput(format!(
                "{} has an empty experiment id",
                file.display()
            )));
        }
        self.store.put_experiment(&experiment)?;
        Ok(ImportReport {
            experiment_id: experiment.id.clone(),
            content_id: experiment.content_id.clone(),
            variants: experiment.variants.len(),
            actions: self.store.actions(&experiment.id)?.len(),
        })
    }

    fn show(&self, experiment_id: &str) -> Result<Experiment> {
        Ok(self
            .runtime
            .block_on(self.store.get_experiment(experiment_id))?)
    }

    fn decide(&self, experiment_id: &str) -> Result<Decision> {
        Ok(self.runtime.block_on(self.autopilot.decide(experiment_id))?)
    }

    fn apply(&self, experiment_id: &str, options: ApplyOptions) -> Result<ApplyOutcome> {
        Ok(self
            .runtime
            .block_on(self.autopilot.apply_auto(experiment_id, options))?)
    }

    fn rollback(&self, experiment_id: &str, index: i64) -> Result<RollbackOutcome> {
        Ok(self
            .runtime
            .block_on(self.autopilot.rollback_auto(experiment_id, index))?)
    }

    fn actions(&self, experiment_id: &str) -> Result<ActionList> {
        let experiment = self
            .runtime
            .block_on(self.store.get_experiment(experiment_id))?;
        Ok(ActionList {
            experiment_id: experiment.id,
            entries: experiment.autopilot_actions,
        })
    }

    fn content_set(&self, content_id: &str, settings_file: &Path) -> Result<ContentReport> {
        let raw = fs::read_to_string(settings_file)?;
        let settings: PromotionSettings = serde_json::from_str(&raw)?;
        self.store.set_content_settings(content_id, &settings)?;
        Ok(ContentReport {
            content_id: content_id.to_string(),
            settings: Some(settings),
        })
    }

    fn content_show(&self, content_id: &str) -> Result<ContentReport> {
        Ok(ContentReport {
            content_id: content_id.to_string(),
            settings: self.store.content_settings(content_id)?,
        })
    }

    fn schedules(&self, content_id: &str) -> Result<ScheduleList> {
        let rows = self
            .runtime
            .block_on(self.store.content_promotion_schedules(content_id))?;
        Ok(ScheduleList {
            content_id: content_id.to_string(),
            rows,
        })
    }
}

fn load_config(path: &Path) -> Result<PromoConfig> {
    if !path.exists() && path == Path::new(DEFAULT_CONFIG) {
        return Ok(PromoConfig::default());
    }
    Ok(load_promo_config(path)?)
}

fn format_budget(budget: Option<f64>) -> String {
    budget
        .map(|value| format!("{value:.2}"))
        .unwrap_or_else(|| "-".to_string())
}

#[derive(Debug, Serialize)]
pub struct ImportReport {
    pub experiment_id: String,
    pub content_id: String,
    pub variants: usize,
    pub actions: usize,
}

#[derive(Debug, Serialize)]
pub struct ActionList {
    pub experiment_id: String,
    pub entries: Vec<ActionLogEntry>,
}

#[derive(Debug, Serialize)]
pub struct ContentReport {
    pub content_id: String,
    pub settings: Option<PromotionSettings>,
}

#[derive(Debug, Serialize)]
pub struct ScheduleList {
    pub content_id: String,
    pub rows: Vec<PromotionSchedule>,
}

impl DisplayFallback for ImportReport {
    fn display(&self) -> String {
        format!(
            "Imported {} (content {}): {} variants, {} logged actions",
            self.experiment_id, self.content_id, self.variants, self.actions
        )
    }
}

impl DisplayFallback for Experiment {
    fn display(&self) -> String {
        let mut lines = vec![format!(
            "{} | content={} | status={} | winner={}",
            self.id,
            self.content_id,
            self.status,
            self.winner.as_deref().unwrap_or("-")
        )];
        let autopilot = &self.autopilot;
        lines.push(format!(
            "Autopilot: enabled={} mode={:?} threshold={:.1}% min_sample={}",
            autopilot.enabled,
            autopilot.mode,
            autopilot.confidence_threshold,
            autopilot.min_sample
        ));
        for variant in &self.variants {
            let metrics = &variant.metrics;
            lines.push(format!(
                "  - {}: views={} engagement={} conversions={} revenue={:.2} rate={:.2}% budget={}",
                variant.id,
                metrics.views,
                metrics.engagement,
                metrics.conversions,
                metrics.revenue,
                metrics.conversion_rate() * 100.0,
                format_budget(variant.promotion_settings.budget)
            ));
        }
        lines.push(format!("Actions: {}", self.autopilot_actions.len()));
        lines.join("\n")
    }
}

impl DisplayFallback for Decision {
    fn display(&self) -> String {
        let mut lines = vec![self.summary()];
        if let Some(eval) = &self.evaluation {
            lines.push(format!(
                "  winner={} top_by_rate={} risk={:.1}",
                eval.winner, eval.top_variant, eval.risk_score
            ));
            lines.push(format!(
                "  rates: top={:.2}% baseline={:.2}% uplift={:.1}%",
                eval.top_rate * 100.0,
                eval.baseline_rate * 100.0,
                eval.predicted_uplift
            ));
            lines.push(format!(
                "  per 1000 views: {:+.2} conversions, {:+.2} revenue",
                eval.inc_conversions_per_1000_views, eval.estimated_revenue_change_per_1000_views
            ));
            lines.push(format!(
                "  simulated delta: p50={:+.4} p95={:+.4} ({} draws)",
                eval.simulation.p50,
                eval.simulation.p95,
                eval.simulation.samples.len()
            ));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for ApplyOutcome {
    fn display(&self) -> String {
        match self {
            ApplyOutcome::NotApplied { decision } => {
                format!("Not applied: {}", decision.summary())
            }
            ApplyOutcome::AlreadyCompleted { winner } => format!(
                "Already completed (winner {})",
                winner.as_deref().unwrap_or("-")
            ),
            ApplyOutcome::Rejected { rejection, .. } => {
                match rejection.attempted_budget_change_percent() {
                    Some(change) => format!(
                        "Rejected: {} (attempted budget change {:+.1}%)",
                        rejection.as_str(),
                        change
                    ),
                    None => format!("Rejected: {}", rejection.as_str()),
                }
            }
            ApplyOutcome::Applied {
                variant_id,
                path,
                action,
                ..
            } => match path {
                ApplyPath::Canary {
                    schedule_id,
                    canary_budget,
                    ends_at,
                    ..
                } => format!(
                    "Applied {variant_id} as canary {schedule_id}: budget {canary_budget:.2} until {} ({:.1}% confidence)",
                    ends_at.format("%Y-%m-%d %H:%M UTC"),
                    action.confidence
                ),
                ApplyPath::Global => format!(
                    "Applied {variant_id} globally ({:.1}% confidence)",
                    action.confidence
                ),
            },
        }
    }
}

impl DisplayFallback for RollbackOutcome {
    fn display(&self) -> String {
        let mut lines = vec![format!(
            "Rolled back {} applied at {}",
            self.action.variant_id,
            self.action.triggered_at.format("%Y-%m-%d %H:%M UTC")
        )];
        if self.reopened {
            lines.push("  experiment reopened".to_string());
        }
        match self.schedule_deleted {
            Some(true) => lines.push("  canary schedule deleted".to_string()),
            Some(false) => lines.push("  canary schedule not deleted".to_string()),
            None => {}
        }
        lines.push(format!("  future schedules restored: {}", self.schedules_updated));
        lines.join("\n")
    }
}

impl DisplayFallback for ActionList {
    fn display(&self) -> String {
        if self.entries.is_empty() {
            return format!("No autopilot actions for {}", self.experiment_id);
        }
        self.entries
            .iter()
            .enumerate()
            .map(|(idx, entry)| {
                format!(
                    "#{idx} {} | {} | variant={} | {}",
                    entry.recorded_at().format("%Y-%m-%d %H:%M:%S"),
                    entry.kind(),
                    entry.variant_id().unwrap_or("-"),
                    entry.reason()
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl DisplayFallback for ContentReport {
    fn display(&self) -> String {
        match &self.settings {
            Some(settings) => format!(
                "{}: platform={} budget={} extra_fields={}",
                self.content_id,
                settings.platform.as_deref().unwrap_or("-"),
                format_budget(settings.budget),
                settings.extra.len()
            ),
            None => format!("{}: no optimized promotion settings", self.content_id),
        }
    }
}

impl DisplayFallback for ScheduleList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return format!("No schedules for {}", self.content_id);
        }
        let now = Utc::now();
        self.rows
            .iter()
            .map(|schedule| {
                format!(
                    "{} | start={} | budget={:.2} | {}{}{}",
                    schedule.id,
                    schedule.start_time.format("%Y-%m-%d %H:%M"),
                    schedule.budget,
                    if schedule.starts_after(now) {
                        "upcoming"
                    } else {
                        "started"
                    },
                    if schedule.is_canary { " | canary" } else { "" },
                    if schedule.is_active { "" } else { " | inactive" }
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const EXPERIMENT: &str = r#"{
        "id": "exp-cli",
        "content_id": "content-cli",
        "variants": [
            {"id": "A", "metrics": {"views": 1200, "conversions": 50},
             "promotion_settings": {"platform": "instagram", "budget": 90.0}},
            {"id": "B", "metrics": {"views": 300, "conversions": 5},
             "promotion_settings": {"platform": "instagram", "budget": 60.0}}
        ],
        "autopilot": {"enabled": true, "confidence_threshold": 50, "min_sample": 10,
                      "previous_promotion_settings": {"budget": 100.0}}
    }"#;

    fn prepare_test_context(command: Commands) -> (TempDir, AppContext, Cli) {
        let temp = TempDir::new().unwrap();
        let cli = Cli {
            config: PathBuf::from(DEFAULT_CONFIG),
            db: Some(temp.path().join("data/experiments.sqlite")),
            format: OutputFormat::Json,
            command,
        };
        let context = AppContext::new(&cli).unwrap();
        (temp, context, cli)
    }

    #[test]
    fn parses_apply_with_canary_flags() {
        let cli = Cli::try_parse_from([
            "promoctl",
            "--format",
            "json",
            "apply",
            "exp-1",
            "--canary-pct",
            "10",
            "--ramp-hours",
            "6",
        ])
        .unwrap();
        assert!(matches!(cli.format, OutputFormat::Json));
        match cli.command {
            Commands::Apply(args) => {
                assert_eq!(args.experiment_id, "exp-1");
                assert_eq!(args.canary_pct, Some(10.0));
                assert_eq!(args.ramp_hours, Some(6.0));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn rollback_index_defaults_to_latest_and_accepts_negatives() {
        let cli = Cli::try_parse_from(["promoctl", "rollback", "exp-1"]).unwrap();
        let Commands::Rollback(args) = cli.command else {
            panic!("expected rollback");
        };
        assert_eq!(args.index, -1);

        let cli = Cli::try_parse_from(["promoctl", "rollback", "exp-1", "--index", "-2"]).unwrap();
        let Commands::Rollback(args) = cli.command else {
            panic!("expected rollback");
        };
        assert_eq!(args.index, -2);
    }

    #[test]
    fn parses_content_subcommands() {
        let cli =
            Cli::try_parse_from(["promoctl", "content", "set", "content-1", "settings.json"])
                .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Content(ContentCommands::Set(ContentSetArgs { ref content_id, .. }))
                if content_id == "content-1"
        ));
        assert!(Cli::try_parse_from(["promoctl", "content"]).is_err());
    }

    #[test]
    fn import_decide_apply_rollback_flow() {
        let (temp, context, _cli) = prepare_test_context(Commands::Show(ExperimentArgs {
            experiment_id: "exp-cli".into(),
        }));
        let file = temp.path().join("experiment.json");
        fs::write(&file, EXPERIMENT).unwrap();

        let report = context.import(&file).unwrap();
        assert_eq!(report.variants, 2);
        assert_eq!(report.actions, 0);

        let decision = context.decide("exp-cli").unwrap();
        assert!(decision.should_apply);
        assert!(decision.display().starts_with("above threshold"));

        let outcome = context
            .apply(
                "exp-cli",
                ApplyOptions {
                    canary_pct: Some(10.0),
                    ramp_hours: None,
                },
            )
            .unwrap();
        assert!(outcome.applied());
        assert!(outcome.display().starts_with("Applied A as canary"));

        let schedules = context.schedules("content-cli").unwrap();
        assert_eq!(schedules.rows.len(), 1);
        assert_eq!(schedules.rows[0].budget, 10.0);

        let rollback = context.rollback("exp-cli", -1).unwrap();
        assert!(rollback.reopened);
        assert!(context.schedules("content-cli").unwrap().rows.is_empty());

        let actions = context.actions("exp-cli").unwrap();
        assert_eq!(actions.entries.len(), 2);
        assert!(actions.display().contains("rolled_back"));
    }

    #[test]
    fn content_settings_round_trip_through_files() {
        let (temp, context, _cli) = prepare_test_context(Commands::Content(
            ContentCommands::Show(ContentArgs {
                content_id: "content-1".into(),
            }),
        ));
        assert!(context.content_show("content-1").unwrap().settings.is_none());

        let file = temp.path().join("settings.json");
        fs::write(&file, r#"{"platform": "tiktok", "budget": 75.5, "cadence": "daily"}"#).unwrap();
        context.content_set("content-1", &file).unwrap();

        let report = context.content_show("content-1").unwrap();
        let settings = report.settings.unwrap();
        assert_eq!(settings.budget, Some(75.5));
        assert_eq!(settings.extra.get("cadence"), Some(&serde_json::json!("daily")));
    }

    #[test]
    fn unknown_experiment_is_an_error() {
        let (_temp, context, _cli) = prepare_test_context(Commands::Decide(ExperimentArgs {
            experiment_id: "missing".into(),
        }));
        let err = context.decide("missing").unwrap_err();
        assert!(matches!(
            err,
            AppError::Experiment(promo_core::ExperimentError::NotFound { .. })
        ));
    }
}

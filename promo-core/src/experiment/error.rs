use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExperimentError {
    #[error("experiment {experiment_id} not found")]
    NotFound { experiment_id: String },
    #[error("experiment {experiment_id} has no autopilot action at index {index}")]
    ActionNotFound { experiment_id: String, index: i64 },
    #[error("autopilot action {index} on experiment {experiment_id} cannot be rolled back ({reason})")]
    ActionNotRollbackable {
        experiment_id: String,
        index: i64,
        reason: String,
    },
    #[error("content {content_id} not found")]
    ContentNotFound { content_id: String },
    #[error("promotion schedule {schedule_id} not found")]
    ScheduleNotFound { schedule_id: String },
    #[error("promotion scheduler error: {0}")]
    Scheduler(String),
    #[error("settings apply error: {0}")]
    SettingsApply(String),
    #[error("experiment store error: {0}")]
    Store(String),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("experiment store path not configured")]
    MissingStore,
    #[error("failed to open database at {path}: {source}")]
    OpenDatabase {
        path: PathBuf,
        source: rusqlite::Error,
    },
}

pub type ExperimentResult<T> = std::result::Result<T, ExperimentError>;

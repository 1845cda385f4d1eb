use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::sqlite::configure_connection;

use super::collaborators::{ContentStore, ExperimentStore, PromotionScheduler, SettingsApplier};
use super::error::{ExperimentError, ExperimentResult};
use super::models::{
    ActionLogEntry, AppliedSettings, Experiment, ExperimentPatch, PromotionSchedule,
    PromotionSettings, ScheduleRequest, ScheduleUpdate, Variant,
};

const EXPERIMENT_SCHEMA: &str = include_str!("../../../sql/experiments.sql");

#[derive(Debug, Clone)]
pub struct SqliteExperimentStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
    ensure_schema: bool,
}

impl Default for SqliteExperimentStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
            ensure_schema: false,
        }
    }
}

impl SqliteExperimentStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Creates the experiment tables while building. Ignored for read-only stores.
    pub fn ensure_schema(mut self, value: bool) -> Self {
        self.ensure_schema = value;
        self
    }

    pub fn build(self) -> ExperimentResult<SqliteExperimentStore> {
        let path = self
            .path
            .filter(|path| !path.as_os_str().is_empty())
            .ok_or(ExperimentError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };

        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }

        let store = SqliteExperimentStore { path, flags };
        if self.ensure_schema && !self.read_only {
            store.initialize()?;
        }
        Ok(store)
    }
}

/// SQLite-backed experiments, contents and promotion schedules.
///
/// The experiment document lives in `experiments.document`; its action log is
/// kept in `experiment_actions`, which only ever receives inserts.
#[derive(Debug, Clone)]
pub struct SqliteExperimentStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteExperimentStore {
    pub fn builder() -> SqliteExperimentStoreBuilder {
        SqliteExperimentStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> ExperimentResult<Self> {
        SqliteExperimentStoreBuilder::new().path(path).build()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> ExperimentResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            ExperimentError::OpenDatabase {
                path: self.path.clone(),
                source,
            }
        })?;
        configure_connection(&conn).map_err(|source| ExperimentError::OpenDatabase {
            path: self.path.clone(),
            source,
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> ExperimentResult<()> {
        let conn = self.open()?;
        conn.execute_batch(EXPERIMENT_SCHEMA)?;
        Ok(())
    }

    /// Inserts or replaces an experiment document.
    ///
    /// Actions carried by the document are appended only when the experiment
    /// has no logged actions yet; an existing log is never rewritten.
    pub fn put_experiment(&self, experiment: &Experiment) -> ExperimentResult<()> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        write_document(&tx, experiment)?;

        let logged: i64 = tx.query_row(
            "SELECT COUNT(*) FROM experiment_actions WHERE experiment_id = ?1",
            [experiment.id.as_str()],
            |row| row.get(0),
        )?;
        if logged == 0 {
            for entry in &experiment.autopilot_actions {
                insert_action(&tx, &experiment.id, entry)?;
            }
        }
        tx.commit()?;
        debug!(
            target: "experiment.store",
            experiment_id = %experiment.id,
            variants = experiment.variants.len(),
            "stored experiment"
        );
        Ok(())
    }

    pub fn load_experiment(&self, experiment_id: &str) -> ExperimentResult<Experiment> {
        let conn = self.open()?;
        let document: Option<String> = conn
            .query_row(
                "SELECT document FROM experiments WHERE experiment_id = ?1",
                [experiment_id],
                |row| row.get(0),
            )
            .optional()?;
        let document = document.ok_or_else(|| ExperimentError::NotFound {
            experiment_id: experiment_id.to_string(),
        })?;
        let mut experiment: Experiment = serde_json::from_str(&document)?;
        experiment.autopilot_actions = load_actions(&conn, experiment_id)?;
        Ok(experiment)
    }

    pub fn patch_experiment(
        &self,
        experiment_id: &str,
        patch: &ExperimentPatch,
    ) -> ExperimentResult<()> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let document: Option<String> = tx
            .query_row(
                "SELECT document FROM experiments WHERE experiment_id = ?1",
                [experiment_id],
                |row| row.get(0),
            )
            .optional()?;
        let document = document.ok_or_else(|| ExperimentError::NotFound {
            experiment_id: experiment_id.to_string(),
        })?;
        let mut experiment: Experiment = serde_json::from_str(&document)?;
        experiment.apply_patch(patch);
        write_document(&tx, &experiment)?;
        tx.commit()?;
        debug!(
            target: "experiment.store",
            experiment_id,
            status = %experiment.status,
            winner = ?experiment.winner,
            "patched experiment"
        );
        Ok(())
    }

    pub fn record_action(
        &self,
        experiment_id: &str,
        entry: &ActionLogEntry,
    ) -> ExperimentResult<()> {
        let conn = self.open()?;
        let inserted = conn.execute(
            "INSERT INTO experiment_actions(experiment_id, kind, reason, variant_id, entry, recorded_at)
             SELECT ?1, ?2, ?3, ?4, ?5, ?6
             WHERE EXISTS (SELECT 1 FROM experiments WHERE experiment_id = ?1)",
            params![
                experiment_id,
                entry.kind(),
                entry.reason().as_str(),
                entry.variant_id(),
                serde_json::to_string(entry)?,
                entry.recorded_at().naive_utc(),
            ],
        )?;
        if inserted == 0 {
            return Err(ExperimentError::NotFound {
                experiment_id: experiment_id.to_string(),
            });
        }
        Ok(())
    }

    pub fn actions(&self, experiment_id: &str) -> ExperimentResult<Vec<ActionLogEntry>> {
        let conn = self.open()?;
        load_actions(&conn, experiment_id)
    }

    pub fn content_settings(&self, content_id: &str) -> ExperimentResult<Option<PromotionSettings>> {
        let conn = self.open()?;
        let raw: Option<Option<String>> = conn
            .query_row(
                "SELECT optimized_promotion_settings FROM contents WHERE content_id = ?1",
                [content_id],
                |row| row.get(0),
            )
            .optional()?;
        match raw.flatten() {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn set_content_settings(
        &self,
        content_id: &str,
        settings: &PromotionSettings,
    ) -> ExperimentResult<()> {
        let conn = self.open()?;
        upsert_content_settings(&conn, content_id, settings)?;
        Ok(())
    }

    pub fn insert_schedule(
        &self,
        content_id: &str,
        request: &ScheduleRequest,
    ) -> ExperimentResult<PromotionSchedule> {
        let schedule = PromotionSchedule::from_request(
            format!("sched-{}", Uuid::new_v4().simple()),
            content_id,
            request,
        );
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO promotion_schedules (
                schedule_id, content_id, experiment_id, variant_id, platform, budget,
                start_time, end_time, is_active, is_canary, promotion_settings
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                &schedule.id,
                &schedule.content_id,
                &schedule.experiment_id,
                &schedule.variant_id,
                &schedule.platform,
                schedule.budget,
                schedule.start_time.naive_utc(),
                schedule.end_time.map(|dt| dt.naive_utc()),
                schedule.is_active,
                schedule.is_canary,
                serde_json::to_string(&schedule.promotion_settings)?,
            ],
        )?;
        Ok(schedule)
    }

    pub fn schedules_for_content(&self, content_id: &str) -> ExperimentResult<Vec<PromotionSchedule>> {
        let conn = self.open()?;
        load_schedules(&conn, content_id)
    }

    pub fn update_schedule(
        &self,
        schedule_id: &str,
        update: &ScheduleUpdate,
    ) -> ExperimentResult<()> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE promotion_schedules
             SET promotion_settings = COALESCE(?2, promotion_settings),
                 budget = COALESCE(?3, budget),
                 is_active = COALESCE(?4, is_active)
             WHERE schedule_id = ?1",
            params![
                schedule_id,
                update
                    .promotion_settings
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                update.budget,
                update.is_active,
            ],
        )?;
        if affected == 0 {
            return Err(ExperimentError::ScheduleNotFound {
                schedule_id: schedule_id.to_string(),
            });
        }
        Ok(())
    }

    pub fn delete_schedule(&self, schedule_id: &str) -> ExperimentResult<bool> {
        let conn = self.open()?;
        let affected = conn.execute(
            "DELETE FROM promotion_schedules WHERE schedule_id = ?1",
            [schedule_id],
        )?;
        Ok(affected > 0)
    }

    /// Writes the variant's settings onto the content and every schedule of
    /// that content that has not started yet, in one transaction.
    pub fn apply_variant_settings(
        &self,
        content_id: &str,
        variant: &Variant,
        now: DateTime<Utc>,
    ) -> ExperimentResult<AppliedSettings> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let settings = &variant.promotion_settings;
        upsert_content_settings(&tx, content_id, settings)?;

        let future: Vec<String> = load_schedules(&tx, content_id)?
            .into_iter()
            .filter(|schedule| schedule.starts_after(now))
            .map(|schedule| schedule.id)
            .collect();
        let encoded = serde_json::to_string(settings)?;
        for schedule_id in &future {
            tx.execute(
                "UPDATE promotion_schedules
                 SET promotion_settings = ?2, budget = COALESCE(?3, budget)
                 WHERE schedule_id = ?1",
                params![schedule_id, &encoded, settings.budget],
            )?;
        }
        tx.commit()?;
        debug!(
            target: "experiment.store",
            content_id,
            variant_id = %variant.id,
            schedules_updated = future.len(),
            "applied variant settings"
        );
        Ok(AppliedSettings {
            variant_id: variant.id.clone(),
            schedules_updated: future.len(),
        })
    }

    async fn blocking<T, F>(&self, job: F) -> ExperimentResult<T>
    where
        T: Send + 'static,
        F: FnOnce(SqliteExperimentStore) -> ExperimentResult<T> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || job(store))
            .await
            .map_err(|err| ExperimentError::Store(err.to_string()))?
    }
}

fn write_document(tx: &Transaction<'_>, experiment: &Experiment) -> ExperimentResult<()> {
    let mut document = experiment.clone();
    document.autopilot_actions.clear();
    tx.execute(
        "INSERT INTO experiments (experiment_id, content_id, status, winner, completed_at, document)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(experiment_id) DO UPDATE SET
            content_id = excluded.content_id,
            status = excluded.status,
            winner = excluded.winner,
            completed_at = excluded.completed_at,
            document = excluded.document,
            updated_at = CURRENT_TIMESTAMP",
        params![
            &document.id,
            &document.content_id,
            document.status.as_str(),
            &document.winner,
            document.completed_date.map(|dt| dt.naive_utc()),
            serde_json::to_string(&document)?,
        ],
    )?;
    Ok(())
}

fn insert_action(
    tx: &Transaction<'_>,
    experiment_id: &str,
    entry: &ActionLogEntry,
) -> ExperimentResult<()> {
    tx.execute(
        "INSERT INTO experiment_actions(experiment_id, kind, reason, variant_id, entry, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            experiment_id,
            entry.kind(),
            entry.reason().as_str(),
            entry.variant_id(),
            serde_json::to_string(entry)?,
            entry.recorded_at().naive_utc(),
        ],
    )?;
    Ok(())
}

fn load_actions(conn: &Connection, experiment_id: &str) -> ExperimentResult<Vec<ActionLogEntry>> {
    let mut stmt = conn.prepare(
        "SELECT entry FROM experiment_actions WHERE experiment_id = ?1 ORDER BY seq ASC",
    )?;
    let raw = stmt
        .query_map([experiment_id], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    raw.iter()
        .map(|entry| serde_json::from_str(entry).map_err(ExperimentError::from))
        .collect()
}

fn upsert_content_settings(
    conn: &Connection,
    content_id: &str,
    settings: &PromotionSettings,
) -> ExperimentResult<()> {
    conn.execute(
        "INSERT INTO contents (content_id, optimized_promotion_settings)
         VALUES (?1, ?2)
         ON CONFLICT(content_id) DO UPDATE SET
            optimized_promotion_settings = excluded.optimized_promotion_settings,
            updated_at = CURRENT_TIMESTAMP",
        params![content_id, serde_json::to_string(settings)?],
    )?;
    Ok(())
}

fn load_schedules(conn: &Connection, content_id: &str) -> ExperimentResult<Vec<PromotionSchedule>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM promotion_schedules WHERE content_id = ?1 ORDER BY start_time ASC",
    )?;
    let rows = stmt
        .query_map([content_id], schedule_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn schedule_from_row(row: &Row<'_>) -> rusqlite::Result<PromotionSchedule> {
    let start_time: NaiveDateTime = row.get("start_time")?;
    let end_time: Option<NaiveDateTime> = row.get("end_time")?;
    let settings: String = row.get("promotion_settings")?;
    let promotion_settings = serde_json::from_str(&settings).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(err))
    })?;
    Ok(PromotionSchedule {
        id: row.get("schedule_id")?,
        content_id: row.get("content_id")?,
        experiment_id: row.get("experiment_id")?,
        variant_id: row.get("variant_id")?,
        platform: row.get("platform")?,
        budget: row.get("budget")?,
        start_time: Utc.from_utc_datetime(&start_time),
        end_time: end_time.map(|dt| Utc.from_utc_datetime(&dt)),
        is_active: row.get("is_active")?,
        is_canary: row.get("is_canary")?,
        promotion_settings,
    })
}

#[async_trait]
impl ExperimentStore for SqliteExperimentStore {
    async fn get_experiment(&self, experiment_id: &str) -> ExperimentResult<Experiment> {
        let experiment_id = experiment_id.to_string();
        self.blocking(move |store| store.load_experiment(&experiment_id))
            .await
    }

    async fn update_experiment(
        &self,
        experiment_id: &str,
        patch: &ExperimentPatch,
    ) -> ExperimentResult<()> {
        let experiment_id = experiment_id.to_string();
        let patch = patch.clone();
        self.blocking(move |store| store.patch_experiment(&experiment_id, &patch))
            .await
    }

    async fn append_action(
        &self,
        experiment_id: &str,
        entry: &ActionLogEntry,
    ) -> ExperimentResult<()> {
        let experiment_id = experiment_id.to_string();
        let entry = entry.clone();
        self.blocking(move |store| store.record_action(&experiment_id, &entry))
            .await
    }
}

#[async_trait]
impl ContentStore for SqliteExperimentStore {
    async fn optimized_promotion_settings(
        &self,
        content_id: &str,
    ) -> ExperimentResult<Option<PromotionSettings>> {
        let content_id = content_id.to_string();
        self.blocking(move |store| store.content_settings(&content_id))
            .await
    }

    async fn set_optimized_promotion_settings(
        &self,
        content_id: &str,
        settings: &PromotionSettings,
    ) -> ExperimentResult<()> {
        let content_id = content_id.to_string();
        let settings = settings.clone();
        self.blocking(move |store| store.set_content_settings(&content_id, &settings))
            .await
    }
}

#[async_trait]
impl SettingsApplier for SqliteExperimentStore {
    async fn apply_winning_settings(
        &self,
        content_id: &str,
        variant: &Variant,
    ) -> ExperimentResult<AppliedSettings> {
        let content_id = content_id.to_string();
        let variant = variant.clone();
        self.blocking(move |store| store.apply_variant_settings(&content_id, &variant, Utc::now()))
            .await
    }
}

#[async_trait]
impl PromotionScheduler for SqliteExperimentStore {
    async fn schedule_promotion(
        &self,
        content_id: &str,
        request: &ScheduleRequest,
    ) -> ExperimentResult<PromotionSchedule> {
        let content_id = content_id.to_string();
        let request = request.clone();
        self.blocking(move |store| store.insert_schedule(&content_id, &request))
            .await
    }

    async fn content_promotion_schedules(
        &self,
        content_id: &str,
    ) -> ExperimentResult<Vec<PromotionSchedule>> {
        let content_id = content_id.to_string();
        self.blocking(move |store| store.schedules_for_content(&content_id))
            .await
    }

    async fn update_promotion_schedule(
        &self,
        schedule_id: &str,
        update: &ScheduleUpdate,
    ) -> ExperimentResult<()> {
        let schedule_id = schedule_id.to_string();
        let update = update.clone();
        self.blocking(move |store| store.update_schedule(&schedule_id, &update))
            .await
    }

    async fn delete_promotion_schedule(&self, schedule_id: &str) -> ExperimentResult<bool> {
        let schedule_id = schedule_id.to_string();
        self.blocking(move |store| store.delete_schedule(&schedule_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::models::VariantMetrics;
    use chrono::Duration;
    use tempfile::tempdir;

    fn store(dir: &Path) -> SqliteExperimentStore {
        let store = SqliteExperimentStore::new(dir.join("experiments.sqlite")).unwrap();
        store.initialize().unwrap();
        store
    }

    #[test]
    fn builder_requires_path() {
        let err = SqliteExperimentStore::builder().build().unwrap_err();
        assert!(matches!(err, ExperimentError::MissingStore));
        let err = SqliteExperimentStore::builder().path("").build().unwrap_err();
        assert!(matches!(err, ExperimentError::MissingStore));
    }

    #[test]
    fn builder_can_create_schema() {
        let dir = tempdir().unwrap();
        let store = SqliteExperimentStore::builder()
            .path(dir.path().join("fresh.sqlite"))
            .ensure_schema(true)
            .build()
            .unwrap();
        assert!(store.actions("exp-1").unwrap().is_empty());
    }

    #[test]
    fn missing_experiment_is_not_found() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        assert!(matches!(
            store.load_experiment("nope"),
            Err(ExperimentError::NotFound { .. })
        ));
        assert!(matches!(
            store.patch_experiment("nope", &ExperimentPatch::reopened()),
            Err(ExperimentError::NotFound { .. })
        ));
    }

    #[test]
    fn schedule_update_only_touches_given_fields() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let now = Utc::now();
        let schedule = store
            .insert_schedule(
                "content-1",
                &ScheduleRequest {
                    experiment_id: None,
                    variant_id: None,
                    platform: Some("tiktok".into()),
                    budget: 80.0,
                    start_time: now + Duration::hours(2),
                    end_time: None,
                    is_canary: false,
                    promotion_settings: PromotionSettings::new("tiktok", 80.0),
                },
            )
            .unwrap();

        store
            .update_schedule(
                &schedule.id,
                &ScheduleUpdate {
                    is_active: Some(false),
                    ..Default::default()
                },
            )
            .unwrap();
        let stored = &store.schedules_for_content("content-1").unwrap()[0];
        assert!(!stored.is_active);
        assert_eq!(stored.budget, 80.0);
        assert_eq!(stored.promotion_settings, PromotionSettings::new("tiktok", 80.0));

        assert!(matches!(
            store.update_schedule("sched-missing", &ScheduleUpdate::default()),
            Err(ExperimentError::ScheduleNotFound { .. })
        ));
        assert!(store.delete_schedule(&schedule.id).unwrap());
        assert!(!store.delete_schedule(&schedule.id).unwrap());
    }

    #[test]
    fn put_experiment_keeps_existing_log() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let experiment = Experiment::new("exp-1", "content-1")
            .with_variant(Variant::new("a", VariantMetrics::new(10, 0, 1, 0.0)));
        store.put_experiment(&experiment).unwrap();
        assert!(store.actions("exp-1").unwrap().is_empty());

        let mut updated = experiment.clone();
        updated.variants[0].metrics.views = 20;
        store.put_experiment(&updated).unwrap();
        let loaded = store.load_experiment("exp-1").unwrap();
        assert_eq!(loaded.variants[0].metrics.views, 20);
    }
}

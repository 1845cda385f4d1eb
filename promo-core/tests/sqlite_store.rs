use std::sync::Arc;

use chrono::{Duration, Utc};
use promo_core::experiment::ScheduleRequest;
use promo_core::{
    ActionLogEntry, ActionReason, ApplyOptions, ApplyOutcome, Autopilot, AutopilotConfig,
    ContentStore, Experiment, ExperimentError, ExperimentStatus, ExperimentStore,
    PromotionScheduler, PromotionSettings, SettingsApplier, SqliteExperimentStore, Variant,
    VariantMetrics,
};
use tempfile::TempDir;

fn setup_store() -> (TempDir, Arc<SqliteExperimentStore>) {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteExperimentStore::builder()
        .path(dir.path().join("experiments.sqlite"))
        .create_if_missing(true)
        .ensure_schema(true)
        .build()
        .unwrap();
    (dir, Arc::new(store))
}

fn experiment() -> Experiment {
    Experiment::new("exp-42", "content-7")
        .with_variant(
            Variant::new("A", VariantMetrics::new(1200, 180, 50, 600.0))
                .with_settings(PromotionSettings::new("youtube", 450.0)),
        )
        .with_variant(
            Variant::new("B", VariantMetrics::new(300, 20, 5, 50.0))
                .with_settings(PromotionSettings::new("youtube", 200.0)),
        )
        .with_autopilot(AutopilotConfig {
            enabled: true,
            confidence_threshold: 50.0,
            min_sample: 10,
            previous_promotion_settings: Some(PromotionSettings::new("youtube", 500.0)),
            ..Default::default()
        })
}

fn future_schedule(start_in: Duration, budget: f64) -> ScheduleRequest {
    ScheduleRequest {
        experiment_id: None,
        variant_id: None,
        platform: Some("youtube".into()),
        budget,
        start_time: Utc::now() + start_in,
        end_time: None,
        is_canary: false,
        promotion_settings: PromotionSettings::new("youtube", budget),
    }
}

#[tokio::test]
async fn experiment_document_round_trips() {
    let (_dir, store) = setup_store();
    store.put_experiment(&experiment()).unwrap();

    let loaded = store.get_experiment("exp-42").await.unwrap();
    assert_eq!(loaded, experiment());

    let err = store.get_experiment("exp-missing").await.unwrap_err();
    assert!(matches!(err, ExperimentError::NotFound { .. }));
}

#[tokio::test]
async fn action_log_only_grows() {
    let (_dir, store) = setup_store();
    store.put_experiment(&experiment()).unwrap();
    let autopilot = Autopilot::from_backend(store.clone());

    autopilot
        .apply_auto("exp-42", ApplyOptions::global())
        .await
        .unwrap();
    autopilot.rollback_auto("exp-42", -1).await.unwrap();

    let actions = store.actions("exp-42").unwrap();
    let kinds: Vec<_> = actions.iter().map(ActionLogEntry::kind).collect();
    assert_eq!(kinds, ["applied", "rolled_back"]);

    // Re-importing the document must not rewrite the log.
    store.put_experiment(&experiment()).unwrap();
    assert_eq!(store.actions("exp-42").unwrap(), actions);

    let err = store
        .append_action("exp-missing", &actions[0])
        .await
        .unwrap_err();
    assert!(matches!(err, ExperimentError::NotFound { .. }));
}

#[tokio::test]
async fn winning_settings_reach_only_future_schedules() {
    let (_dir, store) = setup_store();
    let past = store
        .schedule_promotion("content-7", &future_schedule(Duration::hours(-1), 300.0))
        .await
        .unwrap();
    let upcoming = store
        .schedule_promotion("content-7", &future_schedule(Duration::hours(4), 300.0))
        .await
        .unwrap();

    let winner = experiment().variants[0].clone();
    let applied = store
        .apply_winning_settings("content-7", &winner)
        .await
        .unwrap();
    assert_eq!(applied.variant_id, "A");
    assert_eq!(applied.schedules_updated, 1);

    assert_eq!(
        store.optimized_promotion_settings("content-7").await.unwrap(),
        Some(winner.promotion_settings.clone())
    );
    let schedules = store.content_promotion_schedules("content-7").await.unwrap();
    let by_id = |id: &str| schedules.iter().find(|s| s.id == id).unwrap().clone();
    assert_eq!(by_id(&past.id).budget, 300.0);
    assert_eq!(by_id(&upcoming.id).budget, 450.0);
    assert_eq!(by_id(&upcoming.id).promotion_settings, winner.promotion_settings);
}

#[tokio::test]
async fn canary_apply_and_rollback_against_sqlite() {
    let (_dir, store) = setup_store();
    store.put_experiment(&experiment()).unwrap();
    let original = PromotionSettings::new("youtube", 500.0);
    store
        .set_optimized_promotion_settings("content-7", &original)
        .await
        .unwrap();
    store
        .schedule_promotion("content-7", &future_schedule(Duration::days(2), 500.0))
        .await
        .unwrap();
    let autopilot = Autopilot::from_backend(store.clone());

    let outcome = autopilot
        .apply_auto("exp-42", ApplyOptions::canary(10.0).with_ramp_hours(12.0))
        .await
        .unwrap();
    let ApplyOutcome::Applied { path, action, .. } = &outcome else {
        panic!("expected apply, got {outcome:?}");
    };
    assert_eq!(action.reason, ActionReason::AutopilotCanaryApply);
    assert_eq!(action.previous_promotion_settings, Some(original.clone()));
    let canary_id = path.schedule_id().unwrap().to_string();

    let schedules = store.content_promotion_schedules("content-7").await.unwrap();
    let canary = schedules.iter().find(|s| s.id == canary_id).unwrap();
    assert!(canary.is_canary);
    assert_eq!(canary.budget, 50.0);
    assert_eq!(canary.experiment_id.as_deref(), Some("exp-42"));

    let stored = store.get_experiment("exp-42").await.unwrap();
    assert_eq!(stored.status, ExperimentStatus::Completed);
    assert_eq!(stored.winner.as_deref(), Some("A"));

    let rollback = autopilot.rollback_auto("exp-42", -1).await.unwrap();
    assert!(rollback.reopened);
    assert_eq!(rollback.schedule_deleted, Some(true));
    assert_eq!(rollback.schedules_updated, 1);

    let schedules = store.content_promotion_schedules("content-7").await.unwrap();
    assert_eq!(schedules.len(), 1);
    assert_eq!(schedules[0].promotion_settings, original);
    assert_eq!(
        store.optimized_promotion_settings("content-7").await.unwrap(),
        Some(original)
    );

    let stored = store.get_experiment("exp-42").await.unwrap();
    assert_eq!(stored.status, ExperimentStatus::Active);
    assert!(stored.winner.is_none());
    assert_eq!(stored.autopilot_actions.len(), 2);
}

#[tokio::test]
async fn global_apply_and_rollback_restore_content_against_sqlite() {
    let (_dir, store) = setup_store();
    store.put_experiment(&experiment()).unwrap();
    let mut original = PromotionSettings::new("youtube", 500.0);
    original
        .extra
        .insert("cadence".into(), serde_json::Value::from("weekly"));
    store
        .set_optimized_promotion_settings("content-7", &original)
        .await
        .unwrap();
    let upcoming = store
        .schedule_promotion("content-7", &future_schedule(Duration::days(1), 500.0))
        .await
        .unwrap();
    let autopilot = Autopilot::from_backend(store.clone());

    let outcome = autopilot
        .apply_auto("exp-42", ApplyOptions::global())
        .await
        .unwrap();
    assert_eq!(outcome.reason(), "autopilot_auto_apply");
    let swapped = store
        .optimized_promotion_settings("content-7")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(swapped.budget, Some(450.0));

    let rollback = autopilot.rollback_auto("exp-42", -1).await.unwrap();
    assert!(rollback.reopened);
    assert_eq!(rollback.schedules_updated, 1);
    assert_eq!(
        store.optimized_promotion_settings("content-7").await.unwrap(),
        Some(original.clone())
    );
    let schedules = store.content_promotion_schedules("content-7").await.unwrap();
    let restored = schedules.iter().find(|s| s.id == upcoming.id).unwrap();
    assert_eq!(restored.budget, 500.0);
    assert_eq!(restored.promotion_settings, original);
}

#[tokio::test]
async fn budgetless_content_survives_canary_rollback_against_sqlite() {
    let (_dir, store) = setup_store();
    store.put_experiment(&experiment()).unwrap();
    let original: PromotionSettings =
        serde_json::from_value(serde_json::json!({"platform": "instagram", "cadence": "daily"}))
            .unwrap();
    store
        .set_optimized_promotion_settings("content-7", &original)
        .await
        .unwrap();
    let upcoming = store
        .schedule_promotion("content-7", &future_schedule(Duration::days(3), 300.0))
        .await
        .unwrap();
    let autopilot = Autopilot::from_backend(store.clone());

    autopilot
        .apply_auto("exp-42", ApplyOptions::canary(10.0))
        .await
        .unwrap();
    autopilot.rollback_auto("exp-42", -1).await.unwrap();

    let restored = store
        .optimized_promotion_settings("content-7")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        serde_json::to_value(&restored).unwrap(),
        serde_json::json!({"platform": "instagram", "cadence": "daily"})
    );
    let schedules = store.content_promotion_schedules("content-7").await.unwrap();
    let future = schedules.iter().find(|s| s.id == upcoming.id).unwrap();
    assert_eq!(future.budget, 300.0);
}

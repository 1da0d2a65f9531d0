mod common;

use common::{day, init_logging, orchestrator, raw, retail_history};
use retail_insight_core::{
    anomaly::{AnomalyDetector, OutlierScorer},
    error::PipelineResult,
    forecast::{ForecastEngine, ForecastFit, Forecaster},
    rng::ModelRng,
    run::{ArtifactTable, FailureKind, WarningKind},
    segmentation::{ClusterFit, Clusterer, KMeans, Point, SegmentationEngine},
    ArtifactStore, CancelToken, PipelineConfig, PipelineError, PipelineOrchestrator, RunState,
};

fn rows_for(store: &ArtifactStore, table: ArtifactTable, run_id: &str) -> i64 {
    store.artifact_row_count(table, run_id).expect("row count")
}

#[test]
fn clean_input_runs_to_complete_and_persists_everything() {
    init_logging();
    let orch = orchestrator(PipelineConfig::default());
    let raw = retail_history(60, 40);
    let run = orch
        .run_with("run-complete".into(), &raw, Some(day(60)), &CancelToken::new())
        .expect("run");

    assert_eq!(run.state, RunState::Complete);
    assert!(run.failure.is_none());
    assert!(!run.partial);
    assert_eq!(run.input_row_count, raw.len());
    assert_eq!(run.rejected_row_count, 0);
    assert_eq!(run.as_of, Some(day(60)));
    assert!(run.finished_at.is_some());
    assert!(run.skipped.is_empty());

    let store = orch.store();
    assert_eq!(rows_for(store, ArtifactTable::CustomerFeatures, "run-complete"), 40);
    assert_eq!(rows_for(store, ArtifactTable::RevenuePeriods, "run-complete"), 60);
    assert_eq!(rows_for(store, ArtifactTable::Forecasts, "run-complete"), 30);
    for artifact in &run.artifact_references {
        assert!(!artifact.partial);
        let persisted = rows_for(store, artifact.table, "run-complete");
        match artifact.table {
            ArtifactTable::RunManifest => assert_eq!(persisted, 1),
            _ => assert_eq!(persisted, artifact.row_count as i64, "{:?}", artifact.table),
        }
    }

    let manifest = store.load_run("run-complete").expect("load").expect("manifest");
    assert_eq!(manifest.state, RunState::Complete);
    assert_eq!(manifest.config_fingerprint, run.config_fingerprint);
    assert_eq!(
        store.latest_completed_run_id().expect("latest").as_deref(),
        Some("run-complete")
    );
}

#[test]
fn event_log_records_the_stage_walk() {
    let orch = orchestrator(PipelineConfig::default());
    let run = orch
        .run_with("run-events".into(), &retail_history(30, 20), None, &CancelToken::new())
        .expect("run");

    let types: Vec<String> = orch
        .store()
        .events_for_run(&run.run_id)
        .expect("events")
        .into_iter()
        .map(|e| e.event_type)
        .collect();

    assert_eq!(types.first().map(String::as_str), Some("run_started"));
    assert_eq!(types.last().map(String::as_str), Some("run_completed"));
    assert_eq!(types.iter().filter(|t| *t == "stage_entered").count(), 5);
    assert_eq!(types.iter().filter(|t| *t == "model_completed").count(), 3);
    assert!(types.contains(&"features_built".to_string()));
    assert!(types.contains(&"persist_attempted".to_string()));
}

#[test]
fn sixty_percent_rejection_fails_without_modeling_artifacts() {
    let orch = orchestrator(PipelineConfig::default());
    let rows: Vec<_> = (0..10)
        .map(|i| {
            let qty = if i < 6 { 0 } else { 2 };
            raw(&format!("T{i}"), "C1", 1 + i, "P1", qty, 10.0)
        })
        .collect();
    let run = orch
        .run_with("run-dq".into(), &rows, None, &CancelToken::new())
        .expect("run");

    assert_eq!(run.state, RunState::Failed);
    let failure = run.failure.as_ref().expect("failure");
    assert_eq!(failure.kind, FailureKind::DataQuality);
    assert_eq!(failure.stage, RunState::Validating);
    assert_eq!(run.rejected_row_count, 6);
    assert_eq!(run.rejections_by_rule.get("non_positive_quantity"), Some(&6));

    let store = orch.store();
    for table in [
        ArtifactTable::CustomerFeatures,
        ArtifactTable::RevenuePeriods,
        ArtifactTable::ProductFeatures,
        ArtifactTable::Forecasts,
    ] {
        assert_eq!(rows_for(store, table, "run-dq"), 0, "{table:?}");
    }
    // The failed run is still audited.
    assert_eq!(rows_for(store, ArtifactTable::RunManifest, "run-dq"), 1);
    assert!(store.latest_completed_run_id().expect("latest").is_none());
    assert!(!run.can_retry_persisting());
}

#[test]
fn rejections_under_the_ceiling_are_a_warning() {
    let orch = orchestrator(PipelineConfig::default());
    let mut rows = retail_history(30, 20);
    rows[0].quantity = Some(-1);
    rows[1].customer_id = None;
    let run = orch.run(&rows, None).expect("run");

    assert_eq!(run.state, RunState::Complete);
    assert_eq!(run.rejected_row_count, 2);
    assert!(run.has_warning(WarningKind::RowsRejected));
}

#[test]
fn short_history_degrades_but_completes() {
    let orch = orchestrator(PipelineConfig::default());
    let run = orch.run(&retail_history(10, 20), None).expect("run");

    assert_eq!(run.state, RunState::Complete);
    assert!(run.has_warning(WarningKind::AnomalySkipped));
    assert!(run.has_warning(WarningKind::ForecastLowConfidence));
    assert!(run.skipped.iter().any(|(model, _)| model == "anomaly"));

    let store = orch.store();
    let periods = store.revenue_periods(&run.run_id, None, None).expect("periods");
    assert_eq!(periods.len(), 10);
    assert!(periods.iter().all(|p| p.anomaly_score.is_none() && !p.is_anomaly));
    let forecasts = store.forecasts(&run.run_id, None).expect("forecasts");
    assert!(!forecasts.is_empty());
    assert!(forecasts.iter().all(|f| f.low_confidence));
}

#[test]
fn two_customers_collapse_to_fallback_segment() {
    let orch = orchestrator(PipelineConfig::default());
    let rows: Vec<_> = (0..20)
        .map(|i| raw(&format!("T{i}"), if i % 2 == 0 { "C1" } else { "C2" }, 1 + i, "P1", 1, 5.0))
        .collect();
    let run = orch.run(&rows, None).expect("run");

    assert_eq!(run.state, RunState::Complete);
    assert!(run.has_warning(WarningKind::SegmentationCollapsed));
    let customers = orch.store().customer_features(&run.run_id).expect("customers");
    assert_eq!(customers.len(), 2);
    assert!(customers.iter().all(|c| c.segment.as_deref() == Some("Lost")));
    assert!(customers.iter().all(|c| c.cluster.is_none()));
}

#[test]
fn reruns_never_overwrite_history() {
    let orch = orchestrator(PipelineConfig::default());
    let raw = retail_history(30, 20);
    let first = orch.run(&raw, None).expect("first");
    let second = orch.run(&raw, None).expect("second");

    assert_ne!(first.run_id, second.run_id);
    let store = orch.store();
    assert_eq!(store.run_count().expect("count"), 2);
    assert_eq!(
        rows_for(store, ArtifactTable::CustomerFeatures, &first.run_id),
        rows_for(store, ArtifactTable::CustomerFeatures, &second.run_id),
    );
    assert_eq!(
        store.latest_completed_run_id().expect("latest"),
        Some(second.run_id.clone())
    );
}

#[test]
fn cancelled_before_start_persists_only_the_manifest() {
    let orch = orchestrator(PipelineConfig::default());
    let token = CancelToken::new();
    token.cancel();
    let run = orch
        .run_with("run-cancel-early".into(), &retail_history(30, 20), None, &token)
        .expect("run");

    assert_eq!(run.state, RunState::Failed);
    let failure = run.failure.as_ref().expect("failure");
    assert_eq!(failure.kind, FailureKind::Cancelled);
    assert_eq!(failure.message, "cancelled");
    assert!(run.partial);

    let store = orch.store();
    assert_eq!(rows_for(store, ArtifactTable::CustomerFeatures, "run-cancel-early"), 0);
    assert_eq!(rows_for(store, ArtifactTable::RunManifest, "run-cancel-early"), 1);
}

/// Delegates to k-means and raises the cancel flag while Modeling runs.
struct CancelDuringModeling {
    token: CancelToken,
    inner: KMeans,
}

impl Clusterer for CancelDuringModeling {
    fn name(&self) -> &'static str { "kmeans" }

    fn fit(&self, points: &[Point], k: usize, rng: &mut ModelRng) -> PipelineResult<ClusterFit> {
        self.token.cancel();
        self.inner.fit(points, k, rng)
    }
}

#[test]
fn cancelled_after_modeling_keeps_completed_artifacts_tagged_partial() {
    let config = PipelineConfig::default();
    let token = CancelToken::new();
    let clusterer = CancelDuringModeling {
        token: token.clone(),
        inner: KMeans::from_config(&config.segmentation),
    };
    let orch = orchestrator(config.clone()).with_segmentation(SegmentationEngine::with_clusterer(
        config.segmentation.clone(),
        Box::new(clusterer),
    ));
    let run = orch
        .run_with("run-cancel-late".into(), &retail_history(30, 20), None, &token)
        .expect("run");

    assert_eq!(run.state, RunState::Failed);
    assert_eq!(run.failure.as_ref().map(|f| f.kind), Some(FailureKind::Cancelled));
    assert_eq!(run.failure.as_ref().map(|f| f.stage), Some(RunState::Modeling));
    assert!(run.partial);
    assert!(run.artifact_references.iter().all(|a| a.partial));

    let store = orch.store();
    assert_eq!(rows_for(store, ArtifactTable::CustomerFeatures, "run-cancel-late"), 20);
    assert!(rows_for(store, ArtifactTable::Forecasts, "run-cancel-late") > 0);
    // Partial runs are never served as the latest result.
    assert!(store.latest_completed_run_id().expect("latest").is_none());
}

fn temp_db_path(tag: &str) -> String {
    std::env::temp_dir()
        .join(format!("insight-{tag}-{}.db", uuid::Uuid::new_v4()))
        .to_string_lossy()
        .into_owned()
}

fn remove_db(path: &str) {
    for suffix in ["", "-wal", "-shm"] {
        let _ = std::fs::remove_file(format!("{path}{suffix}"));
    }
}

#[test]
fn persistence_failure_is_retried_from_the_snapshot() {
    let path = temp_db_path("retry");
    let store = ArtifactStore::open(&path).expect("open");
    let orch = PipelineOrchestrator::new(PipelineConfig::default(), store).expect("orchestrator");

    // Break the forecasts table from a second connection.
    let saboteur = rusqlite::Connection::open(&path).expect("second connection");
    saboteur
        .execute_batch("ALTER TABLE forecasts RENAME TO forecasts_off;")
        .expect("rename away");

    let mut run = orch
        .run_with("run-retry".into(), &retail_history(30, 20), None, &CancelToken::new())
        .expect("run");

    assert_eq!(run.state, RunState::Failed);
    assert_eq!(run.failure.as_ref().map(|f| f.kind), Some(FailureKind::Persistence));
    assert!(run.can_retry_persisting());
    assert!(run.snapshot.as_ref().is_some_and(|s| s.is_complete()));
    // Nothing from the failed attempt is visible.
    assert_eq!(orch.store().run_count().expect("count"), 0);
    assert_eq!(rows_for(orch.store(), ArtifactTable::CustomerFeatures, "run-retry"), 0);

    saboteur
        .execute_batch("ALTER TABLE forecasts_off RENAME TO forecasts;")
        .expect("rename back");
    orch.retry_persisting(&mut run).expect("retry");

    assert_eq!(run.state, RunState::Complete);
    assert!(run.failure.is_none());
    assert!(run.snapshot.is_none());
    assert_eq!(rows_for(orch.store(), ArtifactTable::CustomerFeatures, "run-retry"), 20);
    assert_eq!(rows_for(orch.store(), ArtifactTable::Forecasts, "run-retry"), 30);

    let attempts: Vec<String> = orch
        .store()
        .events_for_run("run-retry")
        .expect("events")
        .into_iter()
        .filter(|e| e.event_type == "persist_attempted")
        .map(|e| e.payload)
        .collect();
    assert_eq!(attempts.len(), 2);
    assert!(attempts[0].contains("\"ok\":false"));
    assert!(attempts[1].contains("\"attempt\":2"));

    drop(saboteur);
    drop(orch);
    remove_db(&path);
}

#[test]
fn retry_is_refused_unless_persistence_failed() {
    let orch = orchestrator(PipelineConfig::default());
    let mut run = orch.run(&retail_history(20, 10), None).expect("run");
    assert_eq!(run.state, RunState::Complete);

    match orch.retry_persisting(&mut run) {
        Err(PipelineError::InvalidTransition { from, to }) => {
            assert_eq!(from, RunState::Complete);
            assert_eq!(to, RunState::Persisting);
        }
        other => panic!("expected InvalidTransition, got {other:?}"),
    }
}

#[test]
fn invalid_config_is_rejected_up_front() {
    let mut config = PipelineConfig::default();
    config.segmentation.min_clusters = 9;
    config.segmentation.max_clusters = 3;
    let store = common::store();
    match PipelineOrchestrator::new(config, store) {
        Err(PipelineError::InvalidConfig(_)) => {}
        Err(other) => panic!("expected InvalidConfig, got {other:?}"),
        Ok(_) => panic!("expected InvalidConfig"),
    }
}

#[test]
fn sequential_modeling_matches_parallel() {
    let raw = retail_history(45, 30);
    let parallel = orchestrator(PipelineConfig::default());
    let mut config = PipelineConfig::default();
    config.orchestrator.parallel_modeling = false;
    let sequential = orchestrator(config);

    let a = parallel
        .run_with("run-p".into(), &raw, None, &CancelToken::new())
        .expect("parallel");
    let b = sequential
        .run_with("run-s".into(), &raw, None, &CancelToken::new())
        .expect("sequential");

    let seg_a = parallel.store().customer_features(&a.run_id).expect("a");
    let seg_b = sequential.store().customer_features(&b.run_id).expect("b");
    assert_eq!(seg_a, seg_b);
    assert_eq!(
        parallel.store().forecasts(&a.run_id, None).expect("a"),
        sequential.store().forecasts(&b.run_id, None).expect("b"),
    );
}

/// A forecaster that always panics.
struct Exploding;

impl Forecaster for Exploding {
    fn name(&self) -> &'static str { "exploding" }

    fn fit_predict(&self, _history: &[f64], _season: usize, _horizon: usize) -> PipelineResult<ForecastFit> {
        panic!("forecaster blew up");
    }
}

fn assert_forecast_panic_is_a_skip(parallel: bool) {
    let mut config = PipelineConfig::default();
    config.orchestrator.parallel_modeling = parallel;
    let orch = orchestrator(config.clone())
        .with_forecast(ForecastEngine::with_forecaster(config.forecast.clone(), Box::new(Exploding)));
    let run = orch
        .run_with("run-boom".into(), &retail_history(30, 20), None, &CancelToken::new())
        .expect("run survives a panicking model");

    assert_eq!(run.state, RunState::Complete);
    assert!(run
        .warnings
        .iter()
        .any(|w| w.kind == WarningKind::ModelFailed && w.message.contains("forecast")));
    let store = orch.store();
    assert_eq!(rows_for(store, ArtifactTable::Forecasts, "run-boom"), 0);
    assert_eq!(rows_for(store, ArtifactTable::CustomerFeatures, "run-boom"), 20);
}

#[test]
fn panicking_forecaster_is_skipped_in_parallel_mode() {
    assert_forecast_panic_is_a_skip(true);
}

#[test]
fn panicking_forecaster_is_skipped_in_sequential_mode() {
    assert_forecast_panic_is_a_skip(false);
}

/// Scores only the first half of the series.
struct HalfScorer;

impl OutlierScorer for HalfScorer {
    fn name(&self) -> &'static str { "half" }

    fn score(&self, rows: &[Vec<f64>], _rng: &mut ModelRng) -> PipelineResult<Vec<f64>> {
        Ok(vec![0.5; rows.len() / 2])
    }
}

#[test]
fn mis_sized_anomaly_scores_skip_the_detector() {
    let config = PipelineConfig::default();
    let orch = orchestrator(config.clone())
        .with_anomaly_detector(AnomalyDetector::with_scorer(config.anomaly.clone(), Box::new(HalfScorer)));
    let run = orch
        .run_with("run-half".into(), &retail_history(30, 20), None, &CancelToken::new())
        .expect("run");

    assert_eq!(run.state, RunState::Complete);
    assert!(run
        .warnings
        .iter()
        .any(|w| w.kind == WarningKind::ModelFailed && w.message.contains("anomaly")));
    let periods = orch.store().revenue_periods("run-half", None, None).expect("periods");
    assert_eq!(periods.len(), 30);
    assert!(periods.iter().all(|p| p.anomaly_score.is_none()));
}

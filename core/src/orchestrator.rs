//! PipelineOrchestrator — drives one PipelineRun through its stages.
//!
//! EXECUTION ORDER (fixed):
//!   1. Validating       raw rows → accepted Transactions (fail fast on ceiling)
//!   2. FeatureBuilding  RFM, revenue periods, product ABC
//!   3. Modeling         segmentation ∥ anomaly detection ∥ forecasting
//!   4. Persisting       one transaction: artifacts + manifest + event log
//!
//! RULES:
//!   - Only Validating may fail the run on data. Model degradation and model
//!     errors become warnings and skip reasons; the run still completes.
//!   - The three models share nothing mutable. Each gets an immutable view
//!     of the FeatureSet and its own RNG stream from the RngBank.
//!   - Cancellation is honoured between stages only. Completed artifacts are
//!     persisted, tagged partial.
//!   - A run never overwrites another run's rows.

use std::{
    panic::{self, AssertUnwindSafe},
    thread,
};

use chrono::{NaiveDate, Utc};

use crate::{
    anomaly::{AnomalyDetector, AnomalyReport},
    config::PipelineConfig,
    error::{PipelineError, PipelineResult},
    event::PipelineEvent,
    feature_engine::{FeatureEngine, FeatureSet},
    forecast::{ForecastEngine, ForecastResult},
    query::QueryService,
    rng::{ModelSlot, RngBank},
    run::{ArtifactRef, ArtifactTable, CancelToken, FailureKind, PipelineRun, RunState, WarningKind},
    segmentation::{SegmentationEngine, SegmentationResult},
    snapshot::ModelingSnapshot,
    store::ArtifactStore,
    transaction::RawTransaction,
    types::RunId,
    validator::Validator,
};

pub struct PipelineOrchestrator {
    config:       PipelineConfig,
    fingerprint:  String,
    rng_bank:     RngBank,
    store:        ArtifactStore,
    validator:    Validator,
    features:     FeatureEngine,
    segmentation: SegmentationEngine,
    anomaly:      AnomalyDetector,
    forecast:     ForecastEngine,
}

/// What each model produced, before it is folded into the run.
struct ModelOutcomes {
    segmentation: PipelineResult<SegmentationResult>,
    anomalies:    PipelineResult<AnomalyReport>,
    forecast:     PipelineResult<ForecastResult>,
}

impl PipelineOrchestrator {
    /// Validate the config, migrate the store and wire the default engines.
    pub fn new(config: PipelineConfig, store: ArtifactStore) -> PipelineResult<Self> {
        config.validate()?;
        store.migrate()?;
        Ok(Self {
            fingerprint:  config.fingerprint()?,
            rng_bank:     RngBank::new(config.seed),
            store,
            validator:    Validator::new(config.validation.clone()),
            features:     FeatureEngine::new(config.features.clone()),
            segmentation: SegmentationEngine::new(config.segmentation.clone()),
            anomaly:      AnomalyDetector::new(config.anomaly.clone()),
            forecast:     ForecastEngine::new(config.forecast.clone()),
            config,
        })
    }

    pub fn with_segmentation(mut self, engine: SegmentationEngine) -> Self {
        self.segmentation = engine;
        self
    }

    pub fn with_anomaly_detector(mut self, detector: AnomalyDetector) -> Self {
        self.anomaly = detector;
        self
    }

    pub fn with_forecast(mut self, engine: ForecastEngine) -> Self {
        self.forecast = engine;
        self
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn queries(&self) -> QueryService<'_> {
        QueryService::new(&self.store, &self.config.segmentation.labels)
    }

    /// Run the pipeline under a fresh run id.
    pub fn run(
        &self,
        raw: &[RawTransaction],
        as_of: Option<NaiveDate>,
    ) -> PipelineResult<PipelineRun> {
        let run_id = uuid::Uuid::new_v4().to_string();
        self.run_with(run_id, raw, as_of, &CancelToken::new())
    }

    /// Run the pipeline to a terminal state.
    ///
    /// `Ok` carries the run whether it completed or failed; inspect
    /// `run.state` and `run.failure`. `Err` means the outcome itself could
    /// not be recorded.
    ///
    /// `as_of` defaults to the date of the latest accepted transaction.
    pub fn run_with(
        &self,
        run_id: RunId,
        raw: &[RawTransaction],
        as_of: Option<NaiveDate>,
        cancel: &CancelToken,
    ) -> PipelineResult<PipelineRun> {
        let mut run = PipelineRun::new(
            run_id.clone(),
            self.rng_bank.master_seed(),
            self.fingerprint.clone(),
        );
        run.input_row_count = raw.len();
        run.events.push(PipelineEvent::RunStarted {
            run_id:          run_id.clone(),
            seed:            run.seed,
            input_row_count: raw.len(),
        });
        log::info!(
            "run={run_id} started: {} rows, seed={}, config={}",
            raw.len(),
            run.seed,
            run.config_fingerprint,
        );

        let mut snapshot = ModelingSnapshot::new(run_id.clone());
        if cancel.is_cancelled() {
            return self.finish_cancelled(run, snapshot);
        }

        // ── Validating ─────────────────────────────────────────
        run.transition(RunState::Validating)?;
        let batch = self.validator.partition(raw);
        run.rejected_row_count = batch.report.rejected;
        run.rejections_by_rule = batch.report.by_rule.clone();
        if batch.report.rejected > 0 {
            run.events.push(PipelineEvent::RowsRejected {
                run_id:   run_id.clone(),
                rejected: batch.report.rejected,
                total:    batch.report.total,
                by_rule:  batch.report.by_rule.clone(),
            });
        }
        if let Err(e) = self.validator.check_ceiling(&batch.report) {
            run.fail(FailureKind::DataQuality, e.to_string())?;
            run.artifact_references = artifact_refs(&run, None, false);
            self.store.write_run(&run, None)?;
            return Ok(run);
        }
        if batch.report.rejected > 0 {
            run.warn(
                WarningKind::RowsRejected,
                format!(
                    "{} of {} rows rejected ({:.1}%)",
                    batch.report.rejected,
                    batch.report.total,
                    batch.report.rejection_rate * 100.0,
                ),
            );
        }
        if cancel.is_cancelled() {
            return self.finish_cancelled(run, snapshot);
        }

        // ── FeatureBuilding ────────────────────────────────────
        run.transition(RunState::FeatureBuilding)?;
        let as_of = as_of
            .or_else(|| batch.accepted.iter().map(|t| t.date()).max())
            .unwrap_or_else(|| Utc::now().date_naive());
        run.as_of = Some(as_of);
        let features = self.features.compute(&batch.accepted, as_of);
        run.events.push(PipelineEvent::FeaturesBuilt {
            run_id:    run_id.clone(),
            customers: features.customers.len(),
            periods:   features.revenue_periods.len(),
            products:  features.products.len(),
        });
        snapshot.features = Some(features);
        if cancel.is_cancelled() {
            return self.finish_cancelled(run, snapshot);
        }

        // ── Modeling ───────────────────────────────────────────
        run.transition(RunState::Modeling)?;
        if let Some(features) = snapshot.features.as_ref() {
            let outcomes = self.fan_out(features);
            self.absorb(&mut run, &mut snapshot, outcomes);
        }
        if cancel.is_cancelled() {
            return self.finish_cancelled(run, snapshot);
        }

        // ── Persisting ─────────────────────────────────────────
        self.persist(&mut run, snapshot)?;
        Ok(run)
    }

    /// Re-attempt only the Persisting stage of a run that failed with a
    /// persistence error, from its retained snapshot. Validation, features
    /// and models are not recomputed.
    pub fn retry_persisting(&self, run: &mut PipelineRun) -> PipelineResult<()> {
        if !run.can_retry_persisting() {
            return Err(PipelineError::InvalidTransition {
                from: run.state,
                to:   RunState::Persisting,
            });
        }
        let Some(snapshot) = run.snapshot.take() else {
            return Err(PipelineError::InvalidTransition {
                from: run.state,
                to:   RunState::Persisting,
            });
        };
        log::info!("run={} retrying persistence", run.run_id);
        run.failure = None;
        run.finished_at = None;
        self.persist(run, snapshot)
    }

    // ── Stages ─────────────────────────────────────────────────

    fn fan_out(&self, features: &FeatureSet) -> ModelOutcomes {
        let mut seg_rng = self.rng_bank.for_model(ModelSlot::Segmentation);
        let mut anomaly_rng = self.rng_bank.for_model(ModelSlot::Anomaly);
        let segmentation = &self.segmentation;
        let anomaly = &self.anomaly;
        let forecast = &self.forecast;
        let request = forecast.default_request();

        if !self.config.orchestrator.parallel_modeling {
            return ModelOutcomes {
                segmentation: isolated("segmentation", || {
                    segmentation.segment(&features.customers, &mut seg_rng)
                }),
                anomalies: isolated("anomaly", || {
                    anomaly.detect(&features.revenue_periods, &mut anomaly_rng)
                }),
                forecast: isolated("forecast", || {
                    forecast.forecast(&features.revenue_periods, request)
                }),
            };
        }

        thread::scope(|s| {
            let seg = s.spawn(move || segmentation.segment(&features.customers, &mut seg_rng));
            let anom = s.spawn(move || anomaly.detect(&features.revenue_periods, &mut anomaly_rng));
            let fc = s.spawn(move || forecast.forecast(&features.revenue_periods, request));
            ModelOutcomes {
                segmentation: seg.join().unwrap_or_else(|_| Err(panicked("segmentation"))),
                anomalies:    anom.join().unwrap_or_else(|_| Err(panicked("anomaly"))),
                forecast:     fc.join().unwrap_or_else(|_| Err(panicked("forecast"))),
            }
        })
    }

    /// Fold model outcomes into the run: warnings, skip reasons, events.
    fn absorb(&self, run: &mut PipelineRun, snapshot: &mut ModelingSnapshot, outcomes: ModelOutcomes) {
        let seg_name = ModelSlot::Segmentation.name();
        match outcomes.segmentation {
            Ok(result) => {
                if let Some(reason) = &result.degraded {
                    run.warn(WarningKind::SegmentationCollapsed, reason.clone());
                }
                completed(run, seg_name, result.assignments.len());
                snapshot.segmentation = Some(result);
            }
            Err(e) => skip(run, seg_name, WarningKind::ModelFailed, e.to_string()),
        }

        let anomaly_name = ModelSlot::Anomaly.name();
        match outcomes.anomalies {
            Ok(report) => {
                match &report.skipped {
                    Some(reason) => {
                        skip(run, anomaly_name, WarningKind::AnomalySkipped, reason.clone())
                    }
                    None => completed(run, anomaly_name, report.flags.len()),
                }
                snapshot.anomalies = Some(report);
            }
            Err(e) => skip(run, anomaly_name, WarningKind::ModelFailed, e.to_string()),
        }

        let forecast_name = ModelSlot::Forecast.name();
        match outcomes.forecast {
            Ok(result) => {
                match &result.skipped {
                    Some(reason) => {
                        skip(run, forecast_name, WarningKind::ForecastSkipped, reason.clone())
                    }
                    None => {
                        if result.low_confidence {
                            run.warn(
                                WarningKind::ForecastLowConfidence,
                                format!(
                                    "forecast fitted on {} periods; fewer than two seasonal cycles",
                                    result.history_len
                                ),
                            );
                        }
                        completed(run, forecast_name, result.records.len());
                    }
                }
                snapshot.forecast = Some(result);
            }
            Err(e) => skip(run, forecast_name, WarningKind::ModelFailed, e.to_string()),
        }
    }

    /// Write everything in one transaction. On failure nothing is written,
    /// the run ends `Failed` with a persistence failure and keeps the
    /// snapshot for `retry_persisting`.
    fn persist(&self, run: &mut PipelineRun, snapshot: ModelingSnapshot) -> PipelineResult<()> {
        run.transition(RunState::Persisting)?;
        let attempt = run
            .events
            .iter()
            .filter(|e| matches!(e, PipelineEvent::PersistAttempted { .. }))
            .count() as u32
            + 1;

        let mut done = run.clone();
        done.events.push(PipelineEvent::PersistAttempted {
            run_id: run.run_id.clone(),
            attempt,
            ok: true,
        });
        done.transition(RunState::Complete)?;
        done.finished_at = Some(Utc::now());
        done.events.push(PipelineEvent::RunCompleted {
            run_id:        run.run_id.clone(),
            warning_count: done.warnings.len(),
        });
        done.artifact_references = artifact_refs(&done, Some(&snapshot), false);

        match self.store.write_run(&done, Some(&snapshot)) {
            Ok(()) => {
                log::info!(
                    "run={} complete: {} warnings, {} skipped",
                    done.run_id,
                    done.warnings.len(),
                    done.skipped.len(),
                );
                *run = done;
                Ok(())
            }
            Err(e) => {
                log::error!("run={} persistence attempt {attempt} failed: {e}", run.run_id);
                run.events.push(PipelineEvent::PersistAttempted {
                    run_id: run.run_id.clone(),
                    attempt,
                    ok: false,
                });
                run.fail(FailureKind::Persistence, e.to_string())?;
                run.snapshot = Some(snapshot);
                Ok(())
            }
        }
    }

    fn finish_cancelled(
        &self,
        mut run: PipelineRun,
        snapshot: ModelingSnapshot,
    ) -> PipelineResult<PipelineRun> {
        run.fail(FailureKind::Cancelled, "cancelled")?;
        run.partial = true;
        let snapshot = snapshot.features.is_some().then_some(snapshot);
        run.artifact_references = artifact_refs(&run, snapshot.as_ref(), true);
        self.store.write_run(&run, snapshot.as_ref())?;
        Ok(run)
    }
}

fn completed(run: &mut PipelineRun, model: &str, output_rows: usize) {
    log::info!("run={} model {model} completed ({output_rows} rows)", run.run_id);
    run.events.push(PipelineEvent::ModelCompleted {
        run_id: run.run_id.clone(),
        model: model.to_string(),
        output_rows,
    });
}

fn skip(run: &mut PipelineRun, model: &str, kind: WarningKind, reason: String) {
    run.warn(kind, format!("{model} skipped: {reason}"));
    run.events.push(PipelineEvent::ModelSkipped {
        run_id: run.run_id.clone(),
        model:  model.to_string(),
        reason: reason.clone(),
    });
    run.skipped.push((model.to_string(), reason));
}

/// Run one model on the calling thread; a panic becomes an error.
fn isolated<T>(model: &str, f: impl FnOnce() -> PipelineResult<T>) -> PipelineResult<T> {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|_| Err(panicked(model)))
}

fn panicked(model: &str) -> PipelineError {
    PipelineError::Other(anyhow::anyhow!("{model} model panicked"))
}

/// References to every table the write will touch, with row counts.
fn artifact_refs(
    run: &PipelineRun,
    snapshot: Option<&ModelingSnapshot>,
    partial: bool,
) -> Vec<ArtifactRef> {
    let mut refs = Vec::new();
    let mut push = |table: ArtifactTable, row_count: usize| {
        refs.push(ArtifactRef { table, run_id: run.run_id.clone(), row_count, partial });
    };
    if let Some(features) = snapshot.and_then(|s| s.features.as_ref()) {
        push(ArtifactTable::CustomerFeatures, features.customers.len());
        push(ArtifactTable::RevenuePeriods, features.revenue_periods.len());
        push(ArtifactTable::ProductFeatures, features.products.len());
    }
    if let Some(forecast) = snapshot.and_then(|s| s.forecast.as_ref()) {
        push(ArtifactTable::Forecasts, forecast.records.len());
    }
    push(ArtifactTable::RunManifest, 1);
    push(ArtifactTable::EventLog, run.events.len());
    refs
}

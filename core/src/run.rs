//! PipelineRun — the unit of reproducibility and audit.
//!
//! A run walks a fixed state machine:
//!
//!   Pending → Validating → FeatureBuilding → Modeling → Persisting → Complete
//!
//! with `Failed` reachable from every non-terminal state. The one way out of
//! `Failed` is a persistence retry: `Failed → Persisting`, allowed only when
//! the failure was a PersistenceError and the modeled snapshot is retained.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::{PipelineError, PipelineResult},
    event::PipelineEvent,
    snapshot::ModelingSnapshot,
    types::RunId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Validating,
    FeatureBuilding,
    Modeling,
    Persisting,
    Complete,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending         => "pending",
            Self::Validating      => "validating",
            Self::FeatureBuilding => "feature_building",
            Self::Modeling        => "modeling",
            Self::Persisting      => "persisting",
            Self::Complete        => "complete",
            Self::Failed          => "failed",
        }
    }

    fn can_advance_to(&self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Pending, Validating)
                | (Validating, FeatureBuilding)
                | (FeatureBuilding, Modeling)
                | (Modeling, Persisting)
                | (Persisting, Complete)
                | (Pending | Validating | FeatureBuilding | Modeling | Persisting, Failed)
                | (Failed, Persisting)
        )
    }
}

// ── Warnings and failures ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    SegmentationCollapsed,
    ForecastLowConfidence,
    ForecastSkipped,
    AnomalySkipped,
    RowsRejected,
    /// A model returned an error and was skipped.
    ModelFailed,
}

/// A DegradedResultWarning: recorded, never fatal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunWarning {
    pub stage:   RunState,
    pub kind:    WarningKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    DataQuality,
    Persistence,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    pub kind:     FailureKind,
    pub stage:    RunState,
    pub message:  String,
}

// ── Artifacts ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactTable {
    CustomerFeatures,
    RevenuePeriods,
    ProductFeatures,
    Forecasts,
    RunManifest,
    EventLog,
}

impl ArtifactTable {
    pub fn table_name(&self) -> &'static str {
        match self {
            Self::CustomerFeatures => "customer_features",
            Self::RevenuePeriods   => "revenue_periods",
            Self::ProductFeatures  => "product_features",
            Self::Forecasts        => "forecasts",
            Self::RunManifest      => "run_manifest",
            Self::EventLog         => "event_log",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub table:     ArtifactTable,
    pub run_id:    RunId,
    pub row_count: usize,
    pub partial:   bool,
}

// ── Cancellation ─────────────────────────────────────────────────────────────

/// Checked by the orchestrator between stages only.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

// ── The run ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id:             RunId,
    pub started_at:         DateTime<Utc>,
    pub finished_at:        Option<DateTime<Utc>>,
    pub as_of:              Option<NaiveDate>,
    pub seed:               u64,
    pub config_fingerprint: String,
    pub state:              RunState,
    pub input_row_count:    usize,
    pub rejected_row_count: usize,
    pub rejections_by_rule: BTreeMap<String, usize>,
    pub warnings:           Vec<RunWarning>,
    /// Models that did not produce output, with the reason.
    pub skipped:            Vec<(String, String)>,
    pub failure:            Option<RunFailure>,
    /// True when the run did not reach Complete but some artifacts were kept.
    pub partial:            bool,
    pub artifact_references: Vec<ArtifactRef>,
    #[serde(skip)]
    pub events:             Vec<PipelineEvent>,
    /// Retained so a failed persistence attempt can be retried in place.
    #[serde(skip)]
    pub snapshot:           Option<ModelingSnapshot>,
}

impl PipelineRun {
    pub fn new(run_id: RunId, seed: u64, config_fingerprint: String) -> Self {
        Self {
            run_id,
            started_at: Utc::now(),
            finished_at: None,
            as_of: None,
            seed,
            config_fingerprint,
            state: RunState::Pending,
            input_row_count: 0,
            rejected_row_count: 0,
            rejections_by_rule: BTreeMap::new(),
            warnings: Vec::new(),
            skipped: Vec::new(),
            failure: None,
            partial: false,
            artifact_references: Vec::new(),
            events: Vec::new(),
            snapshot: None,
        }
    }

    /// Move to `next`, recording a StageEntered event.
    pub fn transition(&mut self, next: RunState) -> PipelineResult<()> {
        if !self.state.can_advance_to(next) {
            return Err(PipelineError::InvalidTransition { from: self.state, to: next });
        }
        log::info!("run={} {} -> {}", self.run_id, self.state.as_str(), next.as_str());
        self.state = next;
        self.events.push(PipelineEvent::StageEntered {
            run_id: self.run_id.clone(),
            stage:  next,
        });
        Ok(())
    }

    pub fn warn(&mut self, kind: WarningKind, message: impl Into<String>) {
        let message = message.into();
        log::warn!("run={} warning {:?}: {message}", self.run_id, kind);
        self.warnings.push(RunWarning { stage: self.state, kind, message });
    }

    /// Terminal failure from the current stage.
    pub fn fail(&mut self, kind: FailureKind, message: impl Into<String>) -> PipelineResult<()> {
        let failure = RunFailure { kind, stage: self.state, message: message.into() };
        log::warn!(
            "run={} failed in {} ({:?}): {}",
            self.run_id,
            failure.stage.as_str(),
            failure.kind,
            failure.message,
        );
        self.transition(RunState::Failed)?;
        self.events.push(PipelineEvent::RunFailed {
            run_id:  self.run_id.clone(),
            kind,
            message: failure.message.clone(),
        });
        self.failure = Some(failure);
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.state == RunState::Complete
    }

    pub fn has_warning(&self, kind: WarningKind) -> bool {
        self.warnings.iter().any(|w| w.kind == kind)
    }

    pub fn can_retry_persisting(&self) -> bool {
        self.state == RunState::Failed
            && self.snapshot.is_some()
            && self.failure.as_ref().is_some_and(|f| f.kind == FailureKind::Persistence)
    }
}

//! The run event log — the structured audit trail of one PipelineRun.
//!
//! RULE: Events are only appended, in the order things happened.
//! They are buffered on the PipelineRun and written by the orchestrator
//! together with the run manifest; no component writes them directly.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    run::{FailureKind, RunState},
    types::RunId,
};

/// Variants are added over time — never removed or reordered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    // ── Lifecycle ──────────────────────────────────
    RunStarted {
        run_id: RunId,
        seed: u64,
        input_row_count: usize,
    },
    StageEntered {
        run_id: RunId,
        stage: RunState,
    },
    RunCompleted {
        run_id: RunId,
        warning_count: usize,
    },
    RunFailed {
        run_id: RunId,
        kind: FailureKind,
        message: String,
    },

    // ── Validation ─────────────────────────────────
    RowsRejected {
        run_id: RunId,
        rejected: usize,
        total: usize,
        by_rule: BTreeMap<String, usize>,
    },

    // ── Features ───────────────────────────────────
    FeaturesBuilt {
        run_id: RunId,
        customers: usize,
        periods: usize,
        products: usize,
    },

    // ── Modeling ───────────────────────────────────
    ModelCompleted {
        run_id: RunId,
        model: String,
        output_rows: usize,
    },
    ModelSkipped {
        run_id: RunId,
        model: String,
        reason: String,
    },

    // ── Persistence ────────────────────────────────
    PersistAttempted {
        run_id: RunId,
        attempt: u32,
        ok: bool,
    },
}

impl PipelineEvent {
    /// Stable name for the event_type column in event_log.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::RunStarted { .. }       => "run_started",
            Self::StageEntered { .. }     => "stage_entered",
            Self::RunCompleted { .. }     => "run_completed",
            Self::RunFailed { .. }        => "run_failed",
            Self::RowsRejected { .. }     => "rows_rejected",
            Self::FeaturesBuilt { .. }    => "features_built",
            Self::ModelCompleted { .. }   => "model_completed",
            Self::ModelSkipped { .. }     => "model_skipped",
            Self::PersistAttempted { .. } => "persist_attempted",
        }
    }
}

/// One persisted row of event_log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub id:         Option<i64>,
    pub run_id:     RunId,
    pub seq:        u64,
    pub event_type: String,
    pub payload:    String,
}

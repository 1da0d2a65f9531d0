use thiserror::Error;

use crate::run::RunState;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(
        "Data quality ceiling exceeded: {rejected}/{total} rows rejected \
         (rate {rate:.3} > ceiling {ceiling:.3})"
    )]
    DataQuality {
        rejected: usize,
        total:    usize,
        rate:     f64,
        ceiling:  f64,
    },

    #[error("Artifact write failed for run '{run_id}': {source}")]
    Persistence {
        run_id: String,
        #[source]
        source: Box<PipelineError>,
    },

    #[error("Invalid run transition: {from:?} -> {to:?}")]
    InvalidTransition { from: RunState, to: RunState },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Run '{run_id}' not found")]
    RunNotFound { run_id: String },

    #[error("No completed run has been persisted yet")]
    NoCompletedRun,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

//! Shared primitive types used across the entire pipeline.

/// The canonical run identifier. One PipelineRun = one run_id.
pub type RunId = String;

/// A stable customer identifier as it arrives from ingestion.
pub type CustomerId = String;

/// A stable product identifier as it arrives from ingestion.
pub type ProductId = String;

/// Floating tolerance used when comparing monetary sums.
pub const MONEY_EPSILON: f64 = 1e-6;

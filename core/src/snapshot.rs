//! Modeling snapshot — everything the Persisting stage needs.
//!
//! Captured at the end of Modeling (or at cancellation) and retained on the
//! PipelineRun, so a failed persistence attempt can be retried without
//! re-running validation, feature building or any model.

use serde::{Deserialize, Serialize};

use crate::{
    anomaly::AnomalyReport,
    feature_engine::FeatureSet,
    forecast::ForecastResult,
    segmentation::SegmentationResult,
    types::RunId,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelingSnapshot {
    pub run_id:       RunId,
    pub features:     Option<FeatureSet>,
    pub segmentation: Option<SegmentationResult>,
    pub anomalies:    Option<AnomalyReport>,
    pub forecast:     Option<ForecastResult>,
}

impl ModelingSnapshot {
    pub fn new(run_id: RunId) -> Self {
        Self { run_id, ..Self::default() }
    }

    /// True when every stage output is present.
    pub fn is_complete(&self) -> bool {
        self.features.is_some()
            && self.segmentation.is_some()
            && self.anomalies.is_some()
            && self.forecast.is_some()
    }
}

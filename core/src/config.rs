use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};

// ── Validation ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Fraction of rejected rows above which the run fails fast.
    pub rejection_ceiling: f64,
    pub valid_from: Option<NaiveDate>,
    pub valid_to: Option<NaiveDate>,
    /// Empty = any category accepted.
    pub categories: Vec<String>,
    /// Empty = any region accepted.
    pub regions: Vec<String>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            rejection_ceiling: 0.5,
            valid_from: None,
            valid_to: None,
            categories: Vec::new(),
            regions: Vec::new(),
        }
    }
}

// ── Feature engineering ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Width of one revenue period in days (1 = daily).
    pub period_days: u32,
    /// Cumulative revenue share closing the A class.
    pub abc_a_share: f64,
    /// Cumulative revenue share closing the B class.
    pub abc_b_share: f64,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            period_days: 1,
            abc_a_share: 0.80,
            abc_b_share: 0.95,
        }
    }
}

// ── Segmentation ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RankingWeights {
    pub recency: f64,
    pub frequency: f64,
    pub monetary: f64,
}

impl Default for RankingWeights {
    fn default() -> Self {
        Self { recency: 1.0, frequency: 1.0, monetary: 1.0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentationConfig {
    /// Ordered best → worst.
    pub labels: Vec<String>,
    pub fallback_label: String,
    pub min_clusters: usize,
    pub max_clusters: usize,
    pub n_init: usize,
    pub max_iterations: usize,
    pub tolerance: f64,
    pub weights: RankingWeights,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            labels: ["Champions", "Loyal", "Potential", "At Risk", "Lost"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            fallback_label: "Lost".into(),
            min_clusters: 3,
            max_clusters: 8,
            n_init: 10,
            max_iterations: 300,
            tolerance: 1e-4,
            weights: RankingWeights::default(),
        }
    }
}

// ── Anomaly detection ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    /// Explicit percentile (0–100). Derived from `contamination` when absent.
    pub threshold_percentile: Option<f64>,
    pub contamination: f64,
    pub min_periods: usize,
    pub n_trees: usize,
    pub max_samples: usize,
    /// Scores at or below this are never flagged.
    pub min_score: f64,
}

impl AnomalyConfig {
    pub fn effective_percentile(&self) -> f64 {
        self.threshold_percentile
            .unwrap_or(100.0 * (1.0 - self.contamination))
    }
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            threshold_percentile: None,
            contamination: 0.05,
            min_periods: 14,
            n_trees: 100,
            max_samples: 256,
            min_score: 0.6,
        }
    }
}

// ── Forecasting ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForecastConfig {
    pub horizon: usize,
    pub period_days: u32,
    pub season_length: usize,
    pub interval_level: f64,
    /// Multiplier applied to confidence when history is short.
    pub low_confidence_factor: f64,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            horizon: 30,
            period_days: 1,
            season_length: 7,
            interval_level: 0.95,
            low_confidence_factor: 0.5,
        }
    }
}

// ── Orchestration ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub parallel_modeling: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self { parallel_modeling: true }
    }
}

// ── Root ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub seed: u64,
    pub validation: ValidationConfig,
    pub features: FeatureConfig,
    pub segmentation: SegmentationConfig,
    pub anomaly: AnomalyConfig,
    pub forecast: ForecastConfig,
    pub orchestrator: OrchestratorConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            validation: ValidationConfig::default(),
            features: FeatureConfig::default(),
            segmentation: SegmentationConfig::default(),
            anomaly: AnomalyConfig::default(),
            forecast: ForecastConfig::default(),
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load from a JSON file. Missing sections fall back to defaults.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        let config: PipelineConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Stable fingerprint of the effective configuration, stamped on
    /// every run manifest so two runs can be compared for reproducibility.
    pub fn fingerprint(&self) -> PipelineResult<String> {
        let json = serde_json::to_string(self)?;
        // FNV-1a, 64 bit.
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in json.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    pub fn validate(&self) -> PipelineResult<()> {
        let bad = |msg: String| Err(PipelineError::InvalidConfig(msg));

        let v = &self.validation;
        if !(0.0..=1.0).contains(&v.rejection_ceiling) {
            return bad(format!("rejection_ceiling {} not in [0,1]", v.rejection_ceiling));
        }
        if let (Some(from), Some(to)) = (v.valid_from, v.valid_to) {
            if from > to {
                return bad(format!("valid_from {from} is after valid_to {to}"));
            }
        }

        let f = &self.features;
        if f.period_days == 0 {
            return bad("features.period_days must be > 0".into());
        }
        if !(0.0 < f.abc_a_share && f.abc_a_share <= f.abc_b_share && f.abc_b_share <= 1.0) {
            return bad("abc shares must satisfy 0 < a <= b <= 1".into());
        }

        let s = &self.segmentation;
        if s.labels.is_empty() {
            return bad("segmentation.labels must not be empty".into());
        }
        if !s.labels.contains(&s.fallback_label) {
            return bad(format!("fallback_label '{}' is not in labels", s.fallback_label));
        }
        if s.min_clusters < 2 || s.min_clusters > s.max_clusters {
            return bad(format!(
                "cluster range {}..={} is invalid",
                s.min_clusters, s.max_clusters
            ));
        }
        if s.n_init == 0 || s.max_iterations == 0 {
            return bad("n_init and max_iterations must be > 0".into());
        }

        let a = &self.anomaly;
        let p = a.effective_percentile();
        if !(0.0..=100.0).contains(&p) {
            return bad(format!("anomaly percentile {p} not in [0,100]"));
        }
        if a.n_trees == 0 || a.max_samples < 2 || a.min_periods < 2 {
            return bad("anomaly n_trees > 0, max_samples >= 2, min_periods >= 2".into());
        }

        let fc = &self.forecast;
        if fc.horizon == 0 || fc.period_days == 0 || fc.season_length == 0 {
            return bad("forecast.horizon, period_days and season_length must be > 0".into());
        }
        if fc.period_days % f.period_days != 0 {
            return bad(format!(
                "forecast.period_days {} is not a multiple of features.period_days {}",
                fc.period_days, f.period_days
            ));
        }
        if !(0.0 < fc.interval_level && fc.interval_level < 1.0) {
            return bad(format!("interval_level {} not in (0,1)", fc.interval_level));
        }
        if !(0.0..=1.0).contains(&fc.low_confidence_factor) {
            return bad("low_confidence_factor must be in [0,1]".into());
        }
        Ok(())
    }
}

//! AnomalyDetector — unsupervised outlier scoring over the revenue series.
//!
//! Each period is described by (total_revenue, transaction_count,
//! average_ticket). The scorer is trained on the whole series and returns a
//! score per period where higher means more isolated. A period is flagged
//! when its score exceeds the percentile threshold of the score
//! distribution, floored at `min_score`.
//!
//! Series shorter than `min_periods` are not scored: the report carries no
//! flags and a skip reason instead of an error.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::{
    config::AnomalyConfig,
    error::{PipelineError, PipelineResult},
    feature_engine::RevenuePeriod,
    rng::ModelRng,
};

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

// ── Capability ───────────────────────────────────────────────────────────────

pub trait OutlierScorer: Send + Sync {
    fn name(&self) -> &'static str;

    /// One score per row; higher = more anomalous.
    fn score(&self, rows: &[Vec<f64>], rng: &mut ModelRng) -> PipelineResult<Vec<f64>>;
}

// ── Isolation forest ─────────────────────────────────────────────────────────

pub struct IsolationForest {
    pub n_trees:     usize,
    pub max_samples: usize,
}

enum Node {
    Leaf { size: usize },
    Split { feature: usize, value: f64, left: usize, right: usize },
}

struct IsolationTree {
    nodes: Vec<Node>,
}

impl IsolationTree {
    fn grow(rows: &[Vec<f64>], sample: &[usize], height_limit: usize, rng: &mut ModelRng) -> Self {
        let mut tree = Self { nodes: Vec::new() };
        tree.build(rows, sample.to_vec(), 0, height_limit, rng);
        tree
    }

    fn build(
        &mut self,
        rows: &[Vec<f64>],
        members: Vec<usize>,
        depth: usize,
        height_limit: usize,
        rng: &mut ModelRng,
    ) -> usize {
        let id = self.nodes.len();
        self.nodes.push(Node::Leaf { size: members.len() });
        if depth >= height_limit || members.len() <= 1 {
            return id;
        }

        // Only features that still vary inside this node can split it.
        let n_features = rows[members[0]].len();
        let splittable: Vec<(usize, f64, f64)> = (0..n_features)
            .filter_map(|f| {
                let (lo, hi) = members.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &i| {
                    (lo.min(rows[i][f]), hi.max(rows[i][f]))
                });
                (hi > lo).then_some((f, lo, hi))
            })
            .collect();
        if splittable.is_empty() {
            return id;
        }

        let (feature, lo, hi) = splittable[rng.next_below(splittable.len())];
        let value = rng.uniform(lo, hi);
        let (left_members, right_members): (Vec<usize>, Vec<usize>) =
            members.into_iter().partition(|&i| rows[i][feature] < value);

        let left = self.build(rows, left_members, depth + 1, height_limit, rng);
        let right = self.build(rows, right_members, depth + 1, height_limit, rng);
        self.nodes[id] = Node::Split { feature, value, left, right };
        id
    }

    fn path_length(&self, row: &[f64]) -> f64 {
        let mut node = 0;
        let mut depth = 0.0;
        loop {
            match self.nodes[node] {
                Node::Leaf { size } => return depth + average_path_length(size),
                Node::Split { feature, value, left, right } => {
                    node = if row[feature] < value { left } else { right };
                    depth += 1.0;
                }
            }
        }
    }
}

impl OutlierScorer for IsolationForest {
    fn name(&self) -> &'static str { "isolation_forest" }

    fn score(&self, rows: &[Vec<f64>], rng: &mut ModelRng) -> PipelineResult<Vec<f64>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let psi = self.max_samples.min(rows.len()).max(2).min(rows.len());
        let height_limit = (psi as f64).log2().ceil() as usize;

        let trees: Vec<IsolationTree> = (0..self.n_trees)
            .map(|_| {
                let sample = rng.sample_indices(rows.len(), psi);
                IsolationTree::grow(rows, &sample, height_limit, rng)
            })
            .collect();

        let norm = average_path_length(psi).max(f64::EPSILON);
        Ok(rows
            .iter()
            .map(|row| {
                let mean_path = trees.iter().map(|t| t.path_length(row)).sum::<f64>()
                    / trees.len() as f64;
                2f64.powf(-mean_path / norm)
            })
            .collect())
    }
}

/// Expected path length of an unsuccessful BST search over n points.
fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

// ── Results ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyFlag {
    pub period_start:   NaiveDate,
    pub anomaly_score:  f64,
    pub is_anomaly:     bool,
    pub threshold_used: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnomalyReport {
    pub flags:   Vec<AnomalyFlag>,
    pub scorer:  String,
    /// Set when the series was too short to score.
    pub skipped: Option<String>,
}

impl AnomalyReport {
    pub fn anomaly_count(&self) -> usize {
        self.flags.iter().filter(|f| f.is_anomaly).count()
    }
}

// ── Detector ─────────────────────────────────────────────────────────────────

pub struct AnomalyDetector {
    config: AnomalyConfig,
    scorer: Box<dyn OutlierScorer>,
}

impl AnomalyDetector {
    pub fn new(config: AnomalyConfig) -> Self {
        let scorer = Box::new(IsolationForest {
            n_trees:     config.n_trees,
            max_samples: config.max_samples,
        });
        Self { config, scorer }
    }

    pub fn with_scorer(config: AnomalyConfig, scorer: Box<dyn OutlierScorer>) -> Self {
        Self { config, scorer }
    }

    pub fn detect(
        &self,
        periods: &[RevenuePeriod],
        rng: &mut ModelRng,
    ) -> PipelineResult<AnomalyReport> {
        if periods.len() < self.config.min_periods {
            let reason = format!(
                "series has {} periods, minimum is {}",
                periods.len(),
                self.config.min_periods
            );
            log::warn!("anomaly: skipped: {reason}");
            return Ok(AnomalyReport {
                flags:   Vec::new(),
                scorer:  self.scorer.name().to_string(),
                skipped: Some(reason),
            });
        }

        let rows: Vec<Vec<f64>> = periods.iter().map(period_features).collect();
        let scores = self.scorer.score(&rows, rng)?;
        if scores.len() != periods.len() {
            return Err(PipelineError::Other(anyhow::anyhow!(
                "{} returned {} scores for {} periods",
                self.scorer.name(),
                scores.len(),
                periods.len()
            )));
        }

        let percentile_value = percentile(&scores, self.config.effective_percentile());
        let threshold = percentile_value.max(self.config.min_score);

        let flags: Vec<AnomalyFlag> = periods
            .iter()
            .zip(&scores)
            .map(|(p, &score)| AnomalyFlag {
                period_start:   p.period_start,
                anomaly_score:  score,
                is_anomaly:     score > threshold,
                threshold_used: threshold,
            })
            .collect();

        let report = AnomalyReport {
            flags,
            scorer: self.scorer.name().to_string(),
            skipped: None,
        };
        log::info!(
            "anomaly: {} of {} periods flagged (threshold={threshold:.4}, p{:.1}={percentile_value:.4})",
            report.anomaly_count(),
            periods.len(),
            self.config.effective_percentile(),
        );
        Ok(report)
    }
}

fn period_features(p: &RevenuePeriod) -> Vec<f64> {
    let ticket = if p.transaction_count > 0 {
        p.total_revenue / p.transaction_count as f64
    } else {
        0.0
    };
    vec![p.total_revenue, p.transaction_count as f64, ticket]
}

/// Linear-interpolation percentile (`p` in 0–100).
pub fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let rank = (p / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

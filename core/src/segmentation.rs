//! SegmentationEngine — clusters customers on normalised RFM features and
//! maps raw clusters onto the ordered label set.
//!
//! Steps:
//!   1. z-score each RFM dimension (zero-variance dimensions become 0)
//!   2. fit the Clusterer for every k in the candidate range
//!   3. pick k at the elbow of the inertia curve
//!   4. rank clusters by composite quality and hand out labels best-first
//!
//! With fewer distinct customers than `min_clusters` every customer gets the
//! fallback label and the result is marked degraded.

use serde::{Deserialize, Serialize};

use crate::{
    config::SegmentationConfig,
    error::{PipelineError, PipelineResult},
    feature_engine::CustomerFeatureRecord,
    rng::ModelRng,
    types::CustomerId,
};

pub type Point = [f64; 3];

// ── Capability ───────────────────────────────────────────────────────────────

/// Result of one clustering fit.
#[derive(Debug, Clone)]
pub struct ClusterFit {
    pub assignments: Vec<usize>,
    pub centroids:   Vec<Point>,
    pub inertia:     f64,
}

/// A partitional clustering algorithm with a caller-supplied cluster count.
pub trait Clusterer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Partition `points` into exactly `k` clusters. `k <= points.len()`.
    fn fit(&self, points: &[Point], k: usize, rng: &mut ModelRng) -> PipelineResult<ClusterFit>;
}

/// Lloyd's k-means with k-means++ seeding and best-of-`n_init` restarts.
pub struct KMeans {
    pub n_init:         usize,
    pub max_iterations: usize,
    pub tolerance:      f64,
}

impl KMeans {
    pub fn from_config(config: &SegmentationConfig) -> Self {
        Self {
            n_init:         config.n_init,
            max_iterations: config.max_iterations,
            tolerance:      config.tolerance,
        }
    }

    fn seed_centroids(&self, points: &[Point], k: usize, rng: &mut ModelRng) -> Vec<Point> {
        let mut centroids = vec![points[rng.next_below(points.len())]];
        let mut nearest: Vec<f64> = points.iter().map(|p| sq_dist(p, &centroids[0])).collect();

        while centroids.len() < k {
            let total: f64 = nearest.iter().sum();
            let pick = if total <= 0.0 {
                rng.next_below(points.len())
            } else {
                let target = rng.next_f64() * total;
                let mut running = 0.0;
                nearest
                    .iter()
                    .position(|d| {
                        running += d;
                        running > target
                    })
                    .unwrap_or(points.len() - 1)
            };
            let chosen = points[pick];
            for (d, p) in nearest.iter_mut().zip(points) {
                *d = d.min(sq_dist(p, &chosen));
            }
            centroids.push(chosen);
        }
        centroids
    }

    fn lloyd(&self, points: &[Point], mut centroids: Vec<Point>) -> ClusterFit {
        let k = centroids.len();
        let mut assignments = vec![0usize; points.len()];

        for _ in 0..self.max_iterations {
            for (slot, p) in assignments.iter_mut().zip(points) {
                *slot = nearest_centroid(p, &centroids).0;
            }

            let mut sums = vec![[0.0; 3]; k];
            let mut counts = vec![0usize; k];
            for (&c, p) in assignments.iter().zip(points) {
                counts[c] += 1;
                for d in 0..3 {
                    sums[c][d] += p[d];
                }
            }

            let mut shift = 0.0f64;
            for c in 0..k {
                let next = if counts[c] == 0 {
                    // Empty cluster: reseed at the point worst served by its centroid.
                    let far = farthest_point(points, &assignments, &centroids);
                    assignments[far] = c;
                    points[far]
                } else {
                    let n = counts[c] as f64;
                    [sums[c][0] / n, sums[c][1] / n, sums[c][2] / n]
                };
                shift = shift.max(sq_dist(&next, &centroids[c]));
                centroids[c] = next;
            }

            if shift <= self.tolerance {
                break;
            }
        }

        for (slot, p) in assignments.iter_mut().zip(points) {
            *slot = nearest_centroid(p, &centroids).0;
        }
        let inertia = points
            .iter()
            .zip(&assignments)
            .map(|(p, &c)| sq_dist(p, &centroids[c]))
            .sum();

        ClusterFit { assignments, centroids, inertia }
    }
}

impl Clusterer for KMeans {
    fn name(&self) -> &'static str { "kmeans" }

    fn fit(&self, points: &[Point], k: usize, rng: &mut ModelRng) -> PipelineResult<ClusterFit> {
        if k == 0 || k > points.len() {
            return Err(PipelineError::InvalidConfig(format!(
                "k={k} is invalid for {} points",
                points.len()
            )));
        }

        let mut best: Option<ClusterFit> = None;
        for _ in 0..self.n_init.max(1) {
            let seeds = self.seed_centroids(points, k, rng);
            let fit = self.lloyd(points, seeds);
            if best.as_ref().map_or(true, |b| fit.inertia < b.inertia) {
                best = Some(fit);
            }
        }
        best.ok_or_else(|| PipelineError::Other(anyhow::anyhow!("kmeans produced no fit")))
    }
}

// ── Results ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentAssignment {
    pub customer_id: CustomerId,
    pub segment:     String,
    pub cluster:     Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterProfile {
    pub cluster:       usize,
    pub label:         String,
    pub size:          usize,
    pub quality_score: f64,
    pub mean_recency:  f64,
    pub mean_frequency: f64,
    pub mean_monetary: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SegmentationResult {
    pub assignments:   Vec<SegmentAssignment>,
    pub chosen_k:      Option<usize>,
    pub inertia_curve: Vec<(usize, f64)>,
    pub profiles:      Vec<ClusterProfile>,
    /// Set when the population collapsed to the fallback label.
    pub degraded:      Option<String>,
}

// ── Engine ───────────────────────────────────────────────────────────────────

pub struct SegmentationEngine {
    config:    SegmentationConfig,
    clusterer: Box<dyn Clusterer>,
}

impl SegmentationEngine {
    pub fn new(config: SegmentationConfig) -> Self {
        let clusterer = Box::new(KMeans::from_config(&config));
        Self { config, clusterer }
    }

    pub fn with_clusterer(config: SegmentationConfig, clusterer: Box<dyn Clusterer>) -> Self {
        Self { config, clusterer }
    }

    pub fn segment(
        &self,
        customers: &[CustomerFeatureRecord],
        rng: &mut ModelRng,
    ) -> PipelineResult<SegmentationResult> {
        let mut ordered: Vec<&CustomerFeatureRecord> = customers.iter().collect();
        ordered.sort_by(|a, b| a.customer_id.cmp(&b.customer_id));

        let raw: Vec<Point> = ordered
            .iter()
            .map(|c| [c.recency_days as f64, c.frequency_count as f64, c.monetary_total])
            .collect();
        let points = standardize(&raw);

        let distinct = count_distinct(&points);
        let min_k = self.config.min_clusters;
        if distinct < min_k {
            return Ok(self.collapse(&ordered, distinct));
        }
        let max_k = self.config.max_clusters.min(distinct);

        let mut fits = Vec::with_capacity(max_k - min_k + 1);
        for k in min_k..=max_k {
            let fit = self.clusterer.fit(&points, k, rng)?;
            log::debug!("segmentation: {} k={k} inertia={:.4}", self.clusterer.name(), fit.inertia);
            fits.push((k, fit));
        }
        let inertia_curve: Vec<(usize, f64)> = fits.iter().map(|(k, f)| (*k, f.inertia)).collect();
        let elbow = elbow_index(&inertia_curve);
        let (chosen_k, fit) = fits.swap_remove(elbow);

        let labels = self.rank_labels(&fit.centroids);
        let profiles = build_profiles(&fit, &raw, &labels, &self.config);

        let assignments = ordered
            .iter()
            .zip(&fit.assignments)
            .map(|(c, &cluster)| SegmentAssignment {
                customer_id: c.customer_id.clone(),
                segment:     labels[cluster].clone(),
                cluster:     Some(cluster),
            })
            .collect();

        log::info!(
            "segmentation: {} customers into k={chosen_k} clusters ({})",
            ordered.len(),
            self.clusterer.name(),
        );

        Ok(SegmentationResult {
            assignments,
            chosen_k: Some(chosen_k),
            inertia_curve,
            profiles,
            degraded: None,
        })
    }

    fn collapse(&self, ordered: &[&CustomerFeatureRecord], distinct: usize) -> SegmentationResult {
        let reason = format!(
            "{} customers ({distinct} distinct feature vectors) below minimum cluster count {}; \
             all assigned '{}'",
            ordered.len(),
            self.config.min_clusters,
            self.config.fallback_label,
        );
        log::warn!("segmentation: degraded mode: {reason}");
        SegmentationResult {
            assignments: ordered
                .iter()
                .map(|c| SegmentAssignment {
                    customer_id: c.customer_id.clone(),
                    segment:     self.config.fallback_label.clone(),
                    cluster:     None,
                })
                .collect(),
            chosen_k: None,
            inertia_curve: Vec::new(),
            profiles: Vec::new(),
            degraded: Some(reason),
        }
    }

    /// Label per cluster index, best composite quality first.
    fn rank_labels(&self, centroids: &[Point]) -> Vec<String> {
        let k = centroids.len();
        let n_labels = self.config.labels.len();
        let mut order: Vec<usize> = (0..k).collect();
        order.sort_by(|&a, &b| {
            let qa = quality(&centroids[a], &self.config);
            let qb = quality(&centroids[b], &self.config);
            qb.total_cmp(&qa).then_with(|| a.cmp(&b))
        });

        let mut labels = vec![String::new(); k];
        for (rank, &cluster) in order.iter().enumerate() {
            let idx = if k <= 1 {
                0
            } else {
                ((rank * (n_labels - 1)) as f64 / (k - 1) as f64).round() as usize
            };
            labels[cluster] = self.config.labels[idx.min(n_labels - 1)].clone();
        }
        labels
    }
}

/// Higher frequency + higher monetary + lower recency = better.
fn quality(centroid: &Point, config: &SegmentationConfig) -> f64 {
    let w = &config.weights;
    w.frequency * centroid[1] + w.monetary * centroid[2] - w.recency * centroid[0]
}

fn build_profiles(
    fit: &ClusterFit,
    raw: &[Point],
    labels: &[String],
    config: &SegmentationConfig,
) -> Vec<ClusterProfile> {
    (0..fit.centroids.len())
        .map(|cluster| {
            let members: Vec<&Point> = raw
                .iter()
                .zip(&fit.assignments)
                .filter(|(_, c)| **c == cluster)
                .map(|(p, _)| p)
                .collect();
            let n = members.len().max(1) as f64;
            let mean = |d: usize| members.iter().map(|p| p[d]).sum::<f64>() / n;
            ClusterProfile {
                cluster,
                label: labels[cluster].clone(),
                size: members.len(),
                quality_score: quality(&fit.centroids[cluster], config),
                mean_recency: mean(0),
                mean_frequency: mean(1),
                mean_monetary: mean(2),
            }
        })
        .collect()
}

/// Index of the elbow: the point farthest below the chord joining the first
/// and last points of the (k, inertia) curve, both axes scaled to [0,1].
/// Ties go to the smaller k.
pub fn elbow_index(curve: &[(usize, f64)]) -> usize {
    if curve.len() < 3 {
        return 0;
    }
    let (k0, i0) = (curve[0].0 as f64, curve[0].1);
    let (k1, i1) = {
        let last = curve[curve.len() - 1];
        (last.0 as f64, last.1)
    };
    let k_span = (k1 - k0).max(f64::EPSILON);
    let i_span = i0 - i1;
    if i_span <= f64::EPSILON {
        return 0;
    }

    let mut best = (0usize, 0.0f64);
    for (idx, &(k, inertia)) in curve.iter().enumerate() {
        let x = (k as f64 - k0) / k_span;
        let y = (inertia - i1) / i_span;
        // Chord runs from (0,1) to (1,0): y = 1 - x.
        let gap = (1.0 - x) - y;
        if gap > best.1 + 1e-12 {
            best = (idx, gap);
        }
    }
    best.0
}

pub fn standardize(raw: &[Point]) -> Vec<Point> {
    if raw.is_empty() {
        return Vec::new();
    }
    let n = raw.len() as f64;
    let mut mean = [0.0; 3];
    let mut std = [0.0; 3];
    for d in 0..3 {
        mean[d] = raw.iter().map(|p| p[d]).sum::<f64>() / n;
        let var = raw.iter().map(|p| (p[d] - mean[d]).powi(2)).sum::<f64>() / n;
        std[d] = var.sqrt();
    }
    raw.iter()
        .map(|p| {
            let mut z = [0.0; 3];
            for d in 0..3 {
                z[d] = if std[d] > f64::EPSILON { (p[d] - mean[d]) / std[d] } else { 0.0 };
            }
            z
        })
        .collect()
}

fn count_distinct(points: &[Point]) -> usize {
    let mut keys: Vec<[u64; 3]> = points
        .iter()
        .map(|p| [p[0].to_bits(), p[1].to_bits(), p[2].to_bits()])
        .collect();
    keys.sort_unstable();
    keys.dedup();
    keys.len()
}

fn sq_dist(a: &Point, b: &Point) -> f64 {
    (0..3).map(|d| (a[d] - b[d]).powi(2)).sum()
}

fn nearest_centroid(p: &Point, centroids: &[Point]) -> (usize, f64) {
    let mut best = (0usize, f64::INFINITY);
    for (i, c) in centroids.iter().enumerate() {
        let d = sq_dist(p, c);
        if d < best.1 {
            best = (i, d);
        }
    }
    best
}

fn farthest_point(points: &[Point], assignments: &[usize], centroids: &[Point]) -> usize {
    let mut best = (0usize, -1.0f64);
    for (i, (p, &c)) in points.iter().zip(assignments).enumerate() {
        let d = sq_dist(p, &centroids[c]);
        if d > best.1 {
            best = (i, d);
        }
    }
    best.0
}

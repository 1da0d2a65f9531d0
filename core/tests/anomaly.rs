mod common;

use std::f64::consts::PI;

use common::{day, series};
use retail_insight_core::{
    anomaly::{AnomalyDetector, OutlierScorer},
    config::AnomalyConfig,
    error::PipelineResult,
    rng::{ModelRng, ModelSlot, RngBank},
};

fn rng(seed: u64) -> ModelRng {
    RngBank::new(seed).for_model(ModelSlot::Anomaly)
}

/// Weekly rhythm around 1000, exact repeats each week.
fn weekly(n: usize) -> Vec<f64> {
    (0..n)
        .map(|i| 1000.0 + 50.0 * (2.0 * PI * (i % 7) as f64 / 7.0).sin())
        .collect()
}

#[test]
fn ten_times_spike_is_the_only_flag() {
    let mut values = weekly(60);
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    values[40] = 10.0 * mean;

    let detector = AnomalyDetector::new(AnomalyConfig::default());
    let report = detector.detect(&series(&values), &mut rng(42)).expect("detect");

    assert_eq!(report.flags.len(), 60);
    let flagged: Vec<usize> = report
        .flags
        .iter()
        .enumerate()
        .filter(|(_, f)| f.is_anomaly)
        .map(|(i, _)| i)
        .collect();
    assert_eq!(flagged, vec![40]);
    assert_eq!(report.flags[40].period_start, day(41));
    assert!(report.flags[40].anomaly_score > report.flags[40].threshold_used);
}

#[test]
fn series_below_minimum_returns_no_flags() {
    let config = AnomalyConfig::default();
    let short = series(&weekly(config.min_periods - 1));
    let report = AnomalyDetector::new(config)
        .detect(&short, &mut rng(1))
        .expect("short series never errors");

    assert!(report.flags.is_empty());
    assert!(report.skipped.is_some());
    assert_eq!(report.anomaly_count(), 0);
}

#[test]
fn empty_series_returns_no_flags() {
    let report = AnomalyDetector::new(AnomalyConfig::default())
        .detect(&[], &mut rng(1))
        .expect("empty series");
    assert!(report.flags.is_empty());
}

#[test]
fn same_seed_same_scores() {
    let mut values = weekly(45);
    values[10] *= 4.0;
    values[30] *= 0.1;
    let periods = series(&values);
    let detector = AnomalyDetector::new(AnomalyConfig::default());

    let a = detector.detect(&periods, &mut rng(9)).expect("a");
    let b = detector.detect(&periods, &mut rng(9)).expect("b");
    assert_eq!(a, b);
}

#[test]
fn scores_lie_in_unit_interval() {
    let mut values = weekly(30);
    values[3] = 5000.0;
    let report = AnomalyDetector::new(AnomalyConfig::default())
        .detect(&series(&values), &mut rng(3))
        .expect("detect");
    for f in &report.flags {
        assert!(f.anomaly_score > 0.0 && f.anomaly_score <= 1.0, "{}", f.anomaly_score);
    }
}

/// Returns fixed scores, one per row.
struct Fixed(Vec<f64>);

impl OutlierScorer for Fixed {
    fn name(&self) -> &'static str { "fixed" }

    fn score(&self, rows: &[Vec<f64>], _rng: &mut ModelRng) -> PipelineResult<Vec<f64>> {
        Ok(self.0.iter().copied().take(rows.len()).collect())
    }
}

#[test]
fn min_score_floors_the_threshold() {
    let mut scores = vec![0.5; 20];
    scores[7] = 0.9;
    let detector = AnomalyDetector::with_scorer(AnomalyConfig::default(), Box::new(Fixed(scores)));
    let report = detector.detect(&series(&weekly(20)), &mut rng(1)).expect("detect");

    assert_eq!(report.anomaly_count(), 1);
    assert!(report.flags[7].is_anomaly);
    // p95 of the scores is 0.52, below the floor.
    assert!(report.flags.iter().all(|f| (f.threshold_used - 0.6).abs() < 1e-12));
}

#[test]
fn configured_percentile_is_respected() {
    let scores: Vec<f64> = (0..20).map(|i| 0.6 + 0.01 * (i + 1) as f64).collect();
    let config = AnomalyConfig { threshold_percentile: Some(90.0), ..AnomalyConfig::default() };
    let detector = AnomalyDetector::with_scorer(config, Box::new(Fixed(scores)));
    let report = detector.detect(&series(&weekly(20)), &mut rng(1)).expect("detect");

    let flagged: Vec<bool> = report.flags.iter().map(|f| f.is_anomaly).collect();
    assert_eq!(flagged.iter().filter(|&&f| f).count(), 2);
    assert!(flagged[18] && flagged[19]);
    assert!((report.flags[0].threshold_used - 0.781).abs() < 1e-9);
}

#[test]
fn contamination_sets_the_default_percentile() {
    let config = AnomalyConfig { contamination: 0.10, ..AnomalyConfig::default() };
    assert!((config.effective_percentile() - 90.0).abs() < 1e-9);
    let explicit = AnomalyConfig { threshold_percentile: Some(99.0), ..config };
    assert_eq!(explicit.effective_percentile(), 99.0);
}

/// Returns half as many scores as rows.
struct Short;

impl OutlierScorer for Short {
    fn name(&self) -> &'static str { "short" }

    fn score(&self, rows: &[Vec<f64>], _rng: &mut ModelRng) -> PipelineResult<Vec<f64>> {
        Ok(vec![0.5; rows.len() / 2])
    }
}

#[test]
fn scorer_must_score_every_period() {
    let detector = AnomalyDetector::with_scorer(AnomalyConfig::default(), Box::new(Short));
    match detector.detect(&series(&weekly(30)), &mut rng(1)) {
        Err(e) => assert!(e.to_string().contains("15 scores for 30 periods"), "{e}"),
        Ok(report) => panic!("expected an error, got {} flags", report.flags.len()),
    }
}

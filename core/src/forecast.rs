//! ForecastEngine — additive trend + seasonality over the revenue series.
//!
//! Forecast dates start one period after the last observed period_start,
//! i.e. at the last observed period_end, and never overlap history.
//! Short histories (under two full seasonal cycles) still produce records,
//! stamped `low_confidence` with a reduced confidence score.

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::{
    config::ForecastConfig,
    error::{PipelineError, PipelineResult},
    feature_engine::RevenuePeriod,
};

// ── Capability ───────────────────────────────────────────────────────────────

/// Output of fitting a model to history and extrapolating it.
#[derive(Debug, Clone)]
pub struct ForecastFit {
    pub predictions:  Vec<f64>,
    pub residual_std: f64,
    /// In-sample R², clamped to [0, 1].
    pub fit_quality:  f64,
}

pub trait Forecaster: Send + Sync {
    fn name(&self) -> &'static str;

    fn fit_predict(
        &self,
        history: &[f64],
        season_length: usize,
        horizon: usize,
    ) -> PipelineResult<ForecastFit>;
}

/// Least-squares linear trend plus mean seasonal offsets of the detrended
/// series, centred to sum to zero.
pub struct AdditiveDecomposition;

impl Forecaster for AdditiveDecomposition {
    fn name(&self) -> &'static str { "additive_decomposition" }

    fn fit_predict(
        &self,
        history: &[f64],
        season_length: usize,
        horizon: usize,
    ) -> PipelineResult<ForecastFit> {
        let n = history.len();
        if n == 0 {
            return Err(PipelineError::Other(anyhow::anyhow!("cannot fit an empty history")));
        }
        let (intercept, slope) = linear_trend(history);
        let trend = |t: usize| intercept + slope * t as f64;

        let use_season = season_length >= 2 && n >= season_length;
        let mut seasonal = vec![0.0; season_length.max(1)];
        if use_season {
            let mut sums = vec![0.0; season_length];
            let mut counts = vec![0usize; season_length];
            for (t, y) in history.iter().enumerate() {
                sums[t % season_length] += y - trend(t);
                counts[t % season_length] += 1;
            }
            for j in 0..season_length {
                seasonal[j] = sums[j] / counts[j].max(1) as f64;
            }
            let centre = seasonal.iter().sum::<f64>() / season_length as f64;
            for s in &mut seasonal {
                *s -= centre;
            }
        }
        let season_at = |t: usize| if use_season { seasonal[t % season_length] } else { 0.0 };

        let mean = history.iter().sum::<f64>() / n as f64;
        let mut ss_res = 0.0;
        let mut ss_tot = 0.0;
        for (t, y) in history.iter().enumerate() {
            ss_res += (y - trend(t) - season_at(t)).powi(2);
            ss_tot += (y - mean).powi(2);
        }
        let params = 2 + if use_season { season_length - 1 } else { 0 };
        let dof = n.saturating_sub(params).max(1) as f64;
        let residual_std = (ss_res / dof).sqrt();
        let fit_quality = if ss_tot <= f64::EPSILON {
            1.0
        } else {
            (1.0 - ss_res / ss_tot).clamp(0.0, 1.0)
        };

        let predictions = (1..=horizon)
            .map(|h| {
                let t = n - 1 + h;
                trend(t) + season_at(t)
            })
            .collect();

        Ok(ForecastFit { predictions, residual_std, fit_quality })
    }
}

fn linear_trend(y: &[f64]) -> (f64, f64) {
    let n = y.len() as f64;
    if y.len() < 2 {
        return (y.first().copied().unwrap_or(0.0), 0.0);
    }
    let t_mean = (n - 1.0) / 2.0;
    let y_mean = y.iter().sum::<f64>() / n;
    let mut cov = 0.0;
    let mut var = 0.0;
    for (t, v) in y.iter().enumerate() {
        let dt = t as f64 - t_mean;
        cov += dt * (v - y_mean);
        var += dt * dt;
    }
    let slope = cov / var;
    (y_mean - slope * t_mean, slope)
}

// ── Results ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastRecord {
    pub date:            NaiveDate,
    pub predicted_value: f64,
    pub lower_bound:     f64,
    pub upper_bound:     f64,
    pub confidence:      f64,
    pub low_confidence:  bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForecastRequest {
    pub horizon:     usize,
    pub period_days: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForecastResult {
    pub records:        Vec<ForecastRecord>,
    pub model:          String,
    pub period_days:    u32,
    pub history_len:    usize,
    pub low_confidence: bool,
    pub fit_quality:    f64,
    /// Set when no forecast could be produced at all.
    pub skipped:        Option<String>,
}

// ── Engine ───────────────────────────────────────────────────────────────────

pub struct ForecastEngine {
    config:     ForecastConfig,
    forecaster: Box<dyn Forecaster>,
}

impl ForecastEngine {
    pub fn new(config: ForecastConfig) -> Self {
        Self { config, forecaster: Box::new(AdditiveDecomposition) }
    }

    pub fn with_forecaster(config: ForecastConfig, forecaster: Box<dyn Forecaster>) -> Self {
        Self { config, forecaster }
    }

    pub fn default_request(&self) -> ForecastRequest {
        ForecastRequest {
            horizon:     self.config.horizon,
            period_days: self.config.period_days,
        }
    }

    pub fn forecast(
        &self,
        periods: &[RevenuePeriod],
        request: ForecastRequest,
    ) -> PipelineResult<ForecastResult> {
        let mut result = ForecastResult {
            model: self.forecaster.name().to_string(),
            period_days: request.period_days,
            ..ForecastResult::default()
        };

        let series = rebucket(periods, request.period_days)?;
        let Some(last) = series.last() else {
            let reason = format!(
                "no complete {}-day periods of history to forecast from",
                request.period_days
            );
            log::warn!("forecast: skipped: {reason}");
            result.skipped = Some(reason);
            return Ok(result);
        };

        let step = Duration::days(i64::from(request.period_days));
        let mut dates = Vec::new();
        let mut next = last.period_start;
        for _ in 0..request.horizon {
            next = next.checked_add_signed(step).ok_or_else(|| {
                PipelineError::InvalidConfig(format!(
                    "horizon of {} x {}-day periods runs past the last representable date",
                    request.horizon, request.period_days
                ))
            })?;
            dates.push(next);
        }

        let history: Vec<f64> = series.iter().map(|p| p.total_revenue).collect();
        let n = history.len();
        let season = self.config.season_length;
        let fit = self.forecaster.fit_predict(&history, season, request.horizon)?;

        let low_confidence = n < 2 * season;
        if low_confidence {
            log::warn!(
                "forecast: low confidence: {n} periods of history, two seasonal cycles need {}",
                2 * season
            );
        }

        let z = normal_quantile(0.5 + self.config.interval_level / 2.0);
        let base_confidence = self.config.interval_level
            * (0.5 + 0.5 * fit.fit_quality)
            * if low_confidence { self.config.low_confidence_factor } else { 1.0 };

        result.records = fit
            .predictions
            .iter()
            .zip(&dates)
            .enumerate()
            .map(|(i, (&raw, &date))| {
                let h = (i + 1) as f64;
                let spread = (1.0 + h / n as f64).sqrt();
                let half_width = z * fit.residual_std * spread;
                let predicted_value = raw.max(0.0);
                ForecastRecord {
                    date,
                    predicted_value,
                    lower_bound: (predicted_value - half_width).max(0.0),
                    upper_bound: predicted_value + half_width,
                    confidence: base_confidence / spread,
                    low_confidence,
                }
            })
            .collect();
        result.history_len = n;
        result.low_confidence = low_confidence;
        result.fit_quality = fit.fit_quality;

        log::info!(
            "forecast: {} records from {n} periods (model={}, r2={:.3})",
            result.records.len(),
            result.model,
            fit.fit_quality,
        );
        Ok(result)
    }
}

/// Merge consecutive periods into `period_days`-wide buckets, grouping from
/// the end so the last period_end is preserved. A leading partial bucket
/// is dropped.
pub fn rebucket(periods: &[RevenuePeriod], period_days: u32) -> PipelineResult<Vec<RevenuePeriod>> {
    let Some(first) = periods.first() else {
        return Ok(Vec::new());
    };
    let width = (first.period_end - first.period_start).num_days();
    let target = i64::from(period_days);
    if width <= 0 || target % width != 0 {
        return Err(PipelineError::InvalidConfig(format!(
            "forecast period of {period_days} days is not a multiple of the {width}-day series"
        )));
    }
    let ratio = (target / width) as usize;
    if ratio == 1 {
        return Ok(periods.to_vec());
    }

    let skip = periods.len() % ratio;
    Ok(periods[skip..]
        .chunks(ratio)
        .map(|group| RevenuePeriod {
            period_start:      group[0].period_start,
            period_end:        group[group.len() - 1].period_end,
            total_revenue:     group.iter().map(|p| p.total_revenue).sum(),
            transaction_count: group.iter().map(|p| p.transaction_count).sum(),
        })
        .collect())
}

/// Inverse standard normal CDF (Acklam's rational approximation).
pub fn normal_quantile(p: f64) -> f64 {
    const A: [f64; 6] = [
        -3.969_683_028_665_376e1, 2.209_460_984_245_205e2, -2.759_285_104_469_687e2,
        1.383_577_518_672_69e2, -3.066_479_806_614_716e1, 2.506_628_277_459_239,
    ];
    const B: [f64; 5] = [
        -5.447_609_879_822_406e1, 1.615_858_368_580_409e2, -1.556_989_798_598_866e2,
        6.680_131_188_771_972e1, -1.328_068_155_288_572e1,
    ];
    const C: [f64; 6] = [
        -7.784_894_002_430_293e-3, -3.223_964_580_411_365e-1, -2.400_758_277_161_838,
        -2.549_732_539_343_734, 4.374_664_141_464_968, 2.938_163_982_698_783,
    ];
    const D: [f64; 4] = [
        7.784_695_709_041_462e-3, 3.224_671_290_700_398e-1, 2.445_134_137_142_996,
        3.754_408_661_907_416,
    ];
    const P_LOW: f64 = 0.024_25;

    let p = p.clamp(1e-12, 1.0 - 1e-12);
    if p < P_LOW {
        let q = (-2.0 * p.ln()).sqrt();
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    } else if p <= 1.0 - P_LOW {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    } else {
        let q = (-2.0 * (1.0 - p).ln()).sqrt();
        -(((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    }
}

//! Read surface over persisted runs.
//!
//! RULES:
//! - Every query resolves to the latest run in state `complete`.
//! - Every answer is wrapped in `Served`, carrying that run's warnings, so a
//!   degraded result is never presented as a fully confident one.
//! - Queries never write.

use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::{
    error::{PipelineError, PipelineResult},
    feature_engine::ProductFeatureRecord,
    forecast::ForecastRecord,
    run::{PipelineRun, RunWarning},
    store::{ArtifactStore, RevenuePeriodRow, SegmentCount},
    types::RunId,
};

/// A query answer stamped with the manifest facts of the run it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Served<T> {
    pub run_id:   RunId,
    pub partial:  bool,
    pub warnings: Vec<RunWarning>,
    pub data:     T,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevenueSummary {
    pub total_revenue:      f64,
    pub transaction_count:  u64,
    pub distinct_customers: u64,
    pub average_ticket:     f64,
    /// Last period vs the one before it; None when undefined.
    pub growth_rate:        Option<f64>,
    pub period_count:       usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyRevenue {
    pub year:              i32,
    pub month:             u32,
    pub revenue:           f64,
    pub transaction_count: u64,
    pub average_ticket:    f64,
}

pub struct QueryService<'a> {
    store:  &'a ArtifactStore,
    /// Configured segment labels; each is reported even with no customers.
    labels: &'a [String],
}

impl<'a> QueryService<'a> {
    pub fn new(store: &'a ArtifactStore, labels: &'a [String]) -> Self {
        Self { store, labels }
    }

    // ── Audit ──────────────────────────────────────────────────

    pub fn latest_completed_run(&self) -> PipelineResult<PipelineRun> {
        let run_id = self
            .store
            .latest_completed_run_id()?
            .ok_or(PipelineError::NoCompletedRun)?;
        self.run_manifest(&run_id)
    }

    pub fn run_manifest(&self, run_id: &str) -> PipelineResult<PipelineRun> {
        self.store
            .load_run(run_id)?
            .ok_or_else(|| PipelineError::RunNotFound { run_id: run_id.to_string() })
    }

    // ── Revenue ────────────────────────────────────────────────

    /// Aggregate of the latest run's revenue periods, optionally limited to
    /// periods starting within `from..=to`. The distinct customer count is
    /// run-wide: customer features are not dated.
    pub fn revenue_summary(
        &self,
        range: Option<(NaiveDate, NaiveDate)>,
    ) -> PipelineResult<Served<RevenueSummary>> {
        self.serve(|store, run_id| {
            let (from, to) = match range {
                Some((from, to)) => (Some(from), Some(to)),
                None => (None, None),
            };
            let periods = store.revenue_periods(run_id, from, to)?;
            let total_revenue: f64 = periods.iter().map(|p| p.total_revenue).sum();
            let transaction_count: u64 = periods.iter().map(|p| p.transaction_count).sum();

            let growth_rate = match periods.as_slice() {
                [.., prev, last] if prev.total_revenue > 0.0 => {
                    Some((last.total_revenue - prev.total_revenue) / prev.total_revenue)
                }
                _ => None,
            };

            Ok(RevenueSummary {
                total_revenue,
                transaction_count,
                distinct_customers: store.customer_count(run_id)?,
                average_ticket: average(total_revenue, transaction_count),
                growth_rate,
                period_count: periods.len(),
            })
        })
    }

    pub fn monthly_revenue(&self) -> PipelineResult<Served<Vec<MonthlyRevenue>>> {
        self.serve(|store, run_id| {
            let mut months: BTreeMap<(i32, u32), (f64, u64)> = BTreeMap::new();
            for p in store.revenue_periods(run_id, None, None)? {
                let key = (p.period_start.year(), p.period_start.month());
                let entry = months.entry(key).or_insert((0.0, 0));
                entry.0 += p.total_revenue;
                entry.1 += p.transaction_count;
            }
            Ok(months
                .into_iter()
                .map(|((year, month), (revenue, count))| MonthlyRevenue {
                    year,
                    month,
                    revenue,
                    transaction_count: count,
                    average_ticket: average(revenue, count),
                })
                .collect())
        })
    }

    /// Revenue periods with their anomaly flags, `from..=to` inclusive.
    pub fn daily_revenue(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> PipelineResult<Served<Vec<RevenuePeriodRow>>> {
        self.serve(|store, run_id| store.revenue_periods(run_id, Some(from), Some(to)))
    }

    // ── Products ───────────────────────────────────────────────

    pub fn top_products(
        &self,
        limit: usize,
        category: Option<&str>,
    ) -> PipelineResult<Served<Vec<ProductFeatureRecord>>> {
        self.serve(|store, run_id| store.top_products(run_id, limit, category))
    }

    pub fn categories(&self) -> PipelineResult<Served<Vec<String>>> {
        self.serve(|store, run_id| store.categories(run_id))
    }

    // ── Segments ───────────────────────────────────────────────

    pub fn segment_summary(&self) -> PipelineResult<Served<Vec<SegmentCount>>> {
        self.serve(|store, run_id| store.segment_counts(run_id))
    }

    pub fn segment_counts(&self) -> PipelineResult<Served<BTreeMap<String, u64>>> {
        self.serve(|store, run_id| {
            let mut counts: BTreeMap<String, u64> =
                self.labels.iter().map(|label| (label.clone(), 0)).collect();
            for s in store.segment_counts(run_id)? {
                counts.insert(s.segment, s.customers);
            }
            Ok(counts)
        })
    }

    // ── Forecasts ──────────────────────────────────────────────

    pub fn forecasts(&self, horizon: Option<usize>) -> PipelineResult<Served<Vec<ForecastRecord>>> {
        self.serve(|store, run_id| store.forecasts(run_id, horizon))
    }

    fn serve<T>(
        &self,
        read: impl FnOnce(&ArtifactStore, &str) -> PipelineResult<T>,
    ) -> PipelineResult<Served<T>> {
        let run = self.latest_completed_run()?;
        let data = read(self.store, &run.run_id)?;
        Ok(Served {
            run_id:   run.run_id,
            partial:  run.partial,
            warnings: run.warnings,
            data,
        })
    }
}

fn average(revenue: f64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        revenue / count as f64
    }
}

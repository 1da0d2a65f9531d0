use super::{date_col, ArtifactStore};
use crate::{
    error::PipelineResult,
    feature_engine::{AbcClass, CustomerFeatureRecord, ProductFeatureRecord},
    forecast::ForecastRecord,
};
use chrono::NaiveDate;
use rusqlite::{params, types::Type};
use serde::{Deserialize, Serialize};

/// A revenue_periods row joined with its anomaly flag (when scored).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevenuePeriodRow {
    pub period_start:      NaiveDate,
    pub period_end:        NaiveDate,
    pub total_revenue:     f64,
    pub transaction_count: u64,
    pub anomaly_score:     Option<f64>,
    pub is_anomaly:        bool,
    pub threshold_used:    Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerFeatureRow {
    #[serde(flatten)]
    pub features: CustomerFeatureRecord,
    pub segment:  Option<String>,
    pub cluster:  Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentCount {
    pub segment:        String,
    pub customers:      u64,
    pub mean_monetary:  f64,
    pub mean_frequency: f64,
}

impl ArtifactStore {
    // ── Revenue periods ────────────────────────────────────────

    /// Periods of `run_id` ordered by start, optionally bounded to
    /// `from <= period_start <= to`.
    pub fn revenue_periods(
        &self,
        run_id: &str,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> PipelineResult<Vec<RevenuePeriodRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT period_start, period_end, total_revenue, transaction_count,
                    anomaly_score, is_anomaly, threshold_used
             FROM revenue_periods
             WHERE run_id = ?1
               AND (?2 IS NULL OR period_start >= ?2)
               AND (?3 IS NULL OR period_start <= ?3)
             ORDER BY period_start ASC",
        )?;
        let rows = stmt
            .query_map(
                params![
                    run_id,
                    from.map(|d| d.to_string()),
                    to.map(|d| d.to_string()),
                ],
                |row| {
                    Ok(RevenuePeriodRow {
                        period_start:      date_col(row, 0)?,
                        period_end:        date_col(row, 1)?,
                        total_revenue:     row.get(2)?,
                        transaction_count: row.get::<_, i64>(3)? as u64,
                        anomaly_score:     row.get(4)?,
                        is_anomaly:        row.get::<_, Option<bool>>(5)?.unwrap_or(false),
                        threshold_used:    row.get(6)?,
                    })
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Customers & segments ───────────────────────────────────

    pub fn customer_features(&self, run_id: &str) -> PipelineResult<Vec<CustomerFeatureRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT customer_id, recency_days, frequency_count, monetary_total,
                    monetary_avg, r_score, f_score, m_score, rfm_code, segment, cluster
             FROM customer_features
             WHERE run_id = ?1
             ORDER BY customer_id ASC",
        )?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok(CustomerFeatureRow {
                    features: CustomerFeatureRecord {
                        customer_id:     row.get(0)?,
                        recency_days:    row.get(1)?,
                        frequency_count: row.get::<_, i64>(2)? as u64,
                        monetary_total:  row.get(3)?,
                        monetary_avg:    row.get(4)?,
                        r_score:         row.get(5)?,
                        f_score:         row.get(6)?,
                        m_score:         row.get(7)?,
                        rfm_code:        row.get(8)?,
                    },
                    segment: row.get(9)?,
                    cluster: row.get::<_, Option<i64>>(10)?.map(|k| k as usize),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn customer_count(&self, run_id: &str) -> PipelineResult<u64> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM customer_features WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    /// Per-label aggregates. Customers persisted without a segment are
    /// left out.
    pub fn segment_counts(&self, run_id: &str) -> PipelineResult<Vec<SegmentCount>> {
        let mut stmt = self.conn.prepare(
            "SELECT segment, COUNT(*), AVG(monetary_total), AVG(frequency_count)
             FROM customer_features
             WHERE run_id = ?1 AND segment IS NOT NULL
             GROUP BY segment
             ORDER BY segment ASC",
        )?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok(SegmentCount {
                    segment:        row.get(0)?,
                    customers:      row.get::<_, i64>(1)? as u64,
                    mean_monetary:  row.get(2)?,
                    mean_frequency: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Products ───────────────────────────────────────────────

    pub fn top_products(
        &self,
        run_id: &str,
        limit: usize,
        category: Option<&str>,
    ) -> PipelineResult<Vec<ProductFeatureRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT product_id, category, revenue, quantity, transaction_count,
                    cumulative_share, abc_class
             FROM product_features
             WHERE run_id = ?1 AND (?2 IS NULL OR category = ?2)
             ORDER BY revenue_rank ASC
             LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![run_id, category, limit as i64], |row| {
                let class: String = row.get(6)?;
                let abc_class = AbcClass::parse(&class).ok_or_else(|| {
                    rusqlite::Error::FromSqlConversionFailure(
                        6,
                        Type::Text,
                        format!("unknown abc_class '{class}'").into(),
                    )
                })?;
                Ok(ProductFeatureRecord {
                    product_id:        row.get(0)?,
                    category:          row.get(1)?,
                    revenue:           row.get(2)?,
                    quantity:          row.get::<_, i64>(3)? as u64,
                    transaction_count: row.get::<_, i64>(4)? as u64,
                    cumulative_share:  row.get(5)?,
                    abc_class,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn categories(&self, run_id: &str) -> PipelineResult<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT category FROM product_features
             WHERE run_id = ?1 ORDER BY category ASC",
        )?;
        let rows = stmt
            .query_map(params![run_id], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(rows)
    }

    // ── Forecasts ──────────────────────────────────────────────

    /// Forecast rows in date order; `horizon` keeps only the first N.
    pub fn forecasts(
        &self,
        run_id: &str,
        horizon: Option<usize>,
    ) -> PipelineResult<Vec<ForecastRecord>> {
        // SQLite treats a negative LIMIT as unbounded.
        let limit = horizon.map(|h| h as i64).unwrap_or(-1);
        let mut stmt = self.conn.prepare(
            "SELECT forecast_date, predicted_value, lower_bound, upper_bound,
                    confidence, low_confidence
             FROM forecasts
             WHERE run_id = ?1
             ORDER BY forecast_date ASC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![run_id, limit], |row| {
                Ok(ForecastRecord {
                    date:            date_col(row, 0)?,
                    predicted_value: row.get(1)?,
                    lower_bound:     row.get(2)?,
                    upper_bound:     row.get(3)?,
                    confidence:      row.get(4)?,
                    low_confidence:  row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

//! Insert-only writers for the per-run artifact tables.
//! Called from `ArtifactStore::write_run` inside its transaction.

use std::collections::HashMap;

use chrono::NaiveDate;
use rusqlite::{params, Connection};

use crate::{
    anomaly::{AnomalyFlag, AnomalyReport},
    error::PipelineResult,
    feature_engine::{CustomerFeatureRecord, ProductFeatureRecord, RevenuePeriod},
    forecast::ForecastResult,
    segmentation::{SegmentAssignment, SegmentationResult},
};

// ── Customers ──────────────────────────────────────────────

pub(super) fn insert_customer_features(
    conn: &Connection,
    run_id: &str,
    customers: &[CustomerFeatureRecord],
    segmentation: Option<&SegmentationResult>,
) -> PipelineResult<()> {
    let by_customer: HashMap<&str, &SegmentAssignment> = segmentation
        .map(|s| {
            s.assignments
                .iter()
                .map(|a| (a.customer_id.as_str(), a))
                .collect()
        })
        .unwrap_or_default();

    let mut stmt = conn.prepare_cached(
        "INSERT INTO customer_features (
            run_id, customer_id, recency_days, frequency_count,
            monetary_total, monetary_avg, r_score, f_score, m_score,
            rfm_code, segment, cluster
        ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
    )?;
    for c in customers {
        let assignment = by_customer.get(c.customer_id.as_str());
        stmt.execute(params![
            run_id,
            c.customer_id,
            c.recency_days,
            c.frequency_count as i64,
            c.monetary_total,
            c.monetary_avg,
            c.r_score,
            c.f_score,
            c.m_score,
            c.rfm_code,
            assignment.map(|a| a.segment.as_str()),
            assignment.and_then(|a| a.cluster).map(|k| k as i64),
        ])?;
    }
    Ok(())
}

// ── Revenue periods ────────────────────────────────────────

pub(super) fn insert_revenue_periods(
    conn: &Connection,
    run_id: &str,
    periods: &[RevenuePeriod],
    anomalies: Option<&AnomalyReport>,
) -> PipelineResult<()> {
    let by_start: HashMap<NaiveDate, &AnomalyFlag> = anomalies
        .map(|r| r.flags.iter().map(|f| (f.period_start, f)).collect())
        .unwrap_or_default();

    let mut stmt = conn.prepare_cached(
        "INSERT INTO revenue_periods (
            run_id, period_start, period_end, total_revenue, transaction_count,
            anomaly_score, is_anomaly, threshold_used
        ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
    )?;
    for p in periods {
        let flag = by_start.get(&p.period_start);
        stmt.execute(params![
            run_id,
            p.period_start.to_string(),
            p.period_end.to_string(),
            p.total_revenue,
            p.transaction_count as i64,
            flag.map(|f| f.anomaly_score),
            flag.map(|f| f.is_anomaly),
            flag.map(|f| f.threshold_used),
        ])?;
    }
    Ok(())
}

// ── Products ───────────────────────────────────────────────

/// `products` arrive sorted by revenue descending; rank is 1-based position.
pub(super) fn insert_product_features(
    conn: &Connection,
    run_id: &str,
    products: &[ProductFeatureRecord],
) -> PipelineResult<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO product_features (
            run_id, product_id, category, revenue, quantity,
            transaction_count, cumulative_share, abc_class, revenue_rank
        ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
    )?;
    for (rank, p) in products.iter().enumerate() {
        stmt.execute(params![
            run_id,
            p.product_id,
            p.category,
            p.revenue,
            p.quantity as i64,
            p.transaction_count as i64,
            p.cumulative_share,
            p.abc_class.as_str(),
            (rank + 1) as i64,
        ])?;
    }
    Ok(())
}

// ── Forecasts ──────────────────────────────────────────────

pub(super) fn insert_forecasts(
    conn: &Connection,
    run_id: &str,
    generated_on: NaiveDate,
    forecast: &ForecastResult,
) -> PipelineResult<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO forecasts (
            run_id, generated_on, model, forecast_date, predicted_value,
            lower_bound, upper_bound, confidence, low_confidence
        ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
    )?;
    for r in &forecast.records {
        stmt.execute(params![
            run_id,
            generated_on.to_string(),
            forecast.model,
            r.date.to_string(),
            r.predicted_value,
            r.lower_bound,
            r.upper_bound,
            r.confidence,
            r.low_confidence,
        ])?;
    }
    Ok(())
}

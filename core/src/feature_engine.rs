//! FeatureEngine — per-customer RFM aggregates, per-period revenue and
//! per-product revenue classes from accepted transactions.
//!
//! Determinism: input is sorted by (timestamp, transaction_id) before any
//! summation and every grouping uses an ordered map, so the same input set
//! yields bit-identical output regardless of arrival order.

use std::collections::BTreeMap;

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::{
    config::FeatureConfig,
    transaction::Transaction,
    types::{CustomerId, ProductId},
};

// ── Public types ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerFeatureRecord {
    pub customer_id:     CustomerId,
    pub recency_days:    i64,
    pub frequency_count: u64,
    pub monetary_total:  f64,
    pub monetary_avg:    f64,
    // Quintile scores, 5 = best.
    pub r_score:         u8,
    pub f_score:         u8,
    pub m_score:         u8,
    pub rfm_code:        String,
}

/// One aggregation bucket. `period_end` is exclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevenuePeriod {
    pub period_start:      NaiveDate,
    pub period_end:        NaiveDate,
    pub total_revenue:     f64,
    pub transaction_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbcClass {
    A,
    B,
    C,
}

impl AbcClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
            Self::C => "C",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "A" => Some(Self::A),
            "B" => Some(Self::B),
            "C" => Some(Self::C),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductFeatureRecord {
    pub product_id:        ProductId,
    pub category:          String,
    pub revenue:           f64,
    pub quantity:          u64,
    pub transaction_count: u64,
    pub cumulative_share:  f64,
    pub abc_class:         AbcClass,
}

/// Immutable snapshot handed to every model in the Modeling stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureSet {
    pub as_of:           Option<NaiveDate>,
    pub period_days:     u32,
    pub customers:       Vec<CustomerFeatureRecord>,
    pub revenue_periods: Vec<RevenuePeriod>,
    pub products:        Vec<ProductFeatureRecord>,
}

// ── Engine ───────────────────────────────────────────────────────────────────

pub struct FeatureEngine {
    config: FeatureConfig,
}

#[derive(Default)]
struct CustomerAcc {
    last_date: Option<NaiveDate>,
    count:     u64,
    total:     f64,
}

impl FeatureEngine {
    pub fn new(config: FeatureConfig) -> Self {
        Self { config }
    }

    pub fn compute(&self, accepted: &[Transaction], as_of: NaiveDate) -> FeatureSet {
        let mut ordered: Vec<&Transaction> = accepted.iter().collect();
        ordered.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.transaction_id.cmp(&b.transaction_id))
        });

        let customers = self.customer_features(&ordered, as_of);
        let revenue_periods = self.revenue_periods(&ordered);
        let products = self.product_features(&ordered);

        log::info!(
            "features: {} customers, {} periods, {} products (as_of={as_of})",
            customers.len(),
            revenue_periods.len(),
            products.len(),
        );

        FeatureSet {
            as_of: Some(as_of),
            period_days: self.config.period_days,
            customers,
            revenue_periods,
            products,
        }
    }

    /// One record per distinct customer_id, sorted by customer_id.
    pub fn customer_features(
        &self,
        ordered: &[&Transaction],
        as_of: NaiveDate,
    ) -> Vec<CustomerFeatureRecord> {
        let mut acc: BTreeMap<&str, CustomerAcc> = BTreeMap::new();
        for txn in ordered {
            let entry = acc.entry(txn.customer_id.as_str()).or_default();
            let date = txn.date();
            entry.last_date = Some(entry.last_date.map_or(date, |d| d.max(date)));
            entry.count += 1;
            entry.total += txn.total_amount();
        }

        let mut records: Vec<CustomerFeatureRecord> = acc
            .into_iter()
            .map(|(customer_id, a)| {
                let last = a.last_date.unwrap_or(as_of);
                let recency_days = (as_of - last).num_days().max(0);
                CustomerFeatureRecord {
                    customer_id:     customer_id.to_string(),
                    recency_days,
                    frequency_count: a.count,
                    monetary_total:  a.total,
                    monetary_avg:    a.total / a.count as f64,
                    r_score:         0,
                    f_score:         0,
                    m_score:         0,
                    rfm_code:        String::new(),
                }
            })
            .collect();

        let recency: Vec<f64> = records.iter().map(|r| r.recency_days as f64).collect();
        let frequency: Vec<f64> = records.iter().map(|r| r.frequency_count as f64).collect();
        let monetary: Vec<f64> = records.iter().map(|r| r.monetary_total).collect();
        let r_q = quintiles(&recency);
        let f_q = quintiles(&frequency);
        let m_q = quintiles(&monetary);

        for (i, record) in records.iter_mut().enumerate() {
            // Lower recency is better.
            record.r_score = 6 - r_q[i];
            record.f_score = f_q[i];
            record.m_score = m_q[i];
            record.rfm_code = format!("{}{}{}", record.r_score, record.f_score, record.m_score);
        }
        records
    }

    /// Gap-free, half-open periods covering the observed date range.
    pub fn revenue_periods(&self, ordered: &[&Transaction]) -> Vec<RevenuePeriod> {
        let (Some(first), Some(last)) = (ordered.first(), ordered.last()) else {
            return Vec::new();
        };
        let start = first.date();
        let width = i64::from(self.config.period_days);
        let bucket_of = |date: NaiveDate| ((date - start).num_days() / width) as usize;

        let n_periods = bucket_of(last.date()) + 1;
        let mut periods: Vec<RevenuePeriod> = (0..n_periods)
            .map(|i| {
                let period_start = start + Duration::days(i as i64 * width);
                RevenuePeriod {
                    period_start,
                    period_end: period_start + Duration::days(width),
                    total_revenue: 0.0,
                    transaction_count: 0,
                }
            })
            .collect();

        for txn in ordered {
            let period = &mut periods[bucket_of(txn.date())];
            period.total_revenue += txn.total_amount();
            period.transaction_count += 1;
        }
        periods
    }

    /// Products by revenue (desc, ties by product_id) with ABC classes.
    pub fn product_features(&self, ordered: &[&Transaction]) -> Vec<ProductFeatureRecord> {
        let mut acc: BTreeMap<&str, ProductFeatureRecord> = BTreeMap::new();
        for txn in ordered {
            let entry = acc
                .entry(txn.product_id.as_str())
                .or_insert_with(|| ProductFeatureRecord {
                    product_id:        txn.product_id.clone(),
                    category:          txn.category.clone(),
                    revenue:           0.0,
                    quantity:          0,
                    transaction_count: 0,
                    cumulative_share:  0.0,
                    abc_class:         AbcClass::C,
                });
            entry.revenue += txn.total_amount();
            entry.quantity += u64::from(txn.quantity);
            entry.transaction_count += 1;
        }

        let mut products: Vec<ProductFeatureRecord> = acc.into_values().collect();
        products.sort_by(|a, b| {
            b.revenue
                .total_cmp(&a.revenue)
                .then_with(|| a.product_id.cmp(&b.product_id))
        });

        let grand_total: f64 = products.iter().map(|p| p.revenue).sum();
        let mut running = 0.0;
        for product in &mut products {
            running += product.revenue;
            product.cumulative_share = if grand_total > 0.0 { running / grand_total } else { 1.0 };
            product.abc_class = if product.cumulative_share <= self.config.abc_a_share {
                AbcClass::A
            } else if product.cumulative_share <= self.config.abc_b_share {
                AbcClass::B
            } else {
                AbcClass::C
            };
        }
        products
    }
}

/// Rank-based quintile (1–5) per value. Ties share a score.
fn quintiles(values: &[f64]) -> Vec<u8> {
    let n = values.len();
    if n == 0 {
        return Vec::new();
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    values
        .iter()
        .map(|v| {
            let below = sorted.partition_point(|s| s < v);
            (1 + (5 * below) / n).min(5) as u8
        })
        .collect()
}

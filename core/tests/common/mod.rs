//! Shared fixtures for integration tests.
#![allow(dead_code)]

use chrono::{Duration, NaiveDate, NaiveDateTime};
use retail_insight_core::{
    feature_engine::RevenuePeriod,
    transaction::{RawTransaction, Transaction},
    ArtifactStore, PipelineConfig, PipelineOrchestrator,
};

/// Day 1 of every fixture calendar.
pub fn day(n: i64) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 1).expect("valid date") + Duration::days(n - 1)
}

pub fn at(n: i64, hour: u32) -> NaiveDateTime {
    day(n).and_hms_opt(hour, 0, 0).expect("valid time")
}

pub fn raw(id: &str, customer: &str, day_n: i64, product: &str, qty: i64, price: f64) -> RawTransaction {
    RawTransaction {
        transaction_id: Some(id.to_string()),
        customer_id:    Some(customer.to_string()),
        timestamp:      Some(at(day_n, 10).format("%Y-%m-%d %H:%M:%S").to_string()),
        product_id:     Some(product.to_string()),
        category:       Some(category_of(product).to_string()),
        quantity:       Some(qty),
        unit_price:     Some(price),
        region:         Some("South".to_string()),
    }
}

pub fn txn(id: &str, customer: &str, day_n: i64, product: &str, qty: u32, price: f64) -> Transaction {
    Transaction {
        transaction_id: id.to_string(),
        customer_id:    customer.to_string(),
        timestamp:      at(day_n, 10),
        product_id:     product.to_string(),
        category:       category_of(product).to_string(),
        quantity:       qty,
        unit_price:     price,
        region:         "South".to_string(),
    }
}

fn category_of(product: &str) -> &'static str {
    match product.bytes().last().map(|b| b % 3) {
        Some(0) => "Electronics",
        Some(1) => "Books",
        _ => "Food",
    }
}

/// 100 transactions for 10 customers over 30 days.
/// C00 buys only on day 1; everyone else spreads over the month.
pub fn ten_customers_hundred_txns() -> Vec<Transaction> {
    (0..100)
        .map(|i| {
            let c = i % 10;
            let day_n = if c == 0 { 1 } else { 1 + ((i * 7 + c) % 30) as i64 };
            let qty = 1 + (i % 4) as u32;
            let price = 5.0 + (i % 13) as f64 * 2.5;
            txn(
                &format!("T{i:03}"),
                &format!("C{c:02}"),
                day_n,
                &format!("P{}", i % 6),
                qty,
                price,
            )
        })
        .collect()
}

/// `days` of raw history with a weekly rhythm and a spread of customer
/// behaviour: heavy, regular and one-off buyers.
pub fn retail_history(days: i64, customers: usize) -> Vec<RawTransaction> {
    let mut rows = Vec::new();
    let mut n = 0usize;
    for d in 1..=days {
        let weekday_boost = if d % 7 == 5 || d % 7 == 6 { 3 } else { 1 };
        for slot in 0..(4 * weekday_boost) {
            let c = (d as usize * 7 + slot * 3) % customers;
            // Low ids buy big and often; high ids buy small.
            let qty = 1 + (customers - c) as i64 / 8;
            let price = 4.0 + ((n * 37) % 50) as f64;
            rows.push(raw(
                &format!("R{n:05}"),
                &format!("C{c:03}"),
                d,
                &format!("P{}", (n * 11) % 17),
                qty,
                price,
            ));
            n += 1;
        }
    }
    rows
}

/// One revenue period per value, starting on day 1.
pub fn series(values: &[f64]) -> Vec<RevenuePeriod> {
    values
        .iter()
        .enumerate()
        .map(|(i, &v)| RevenuePeriod {
            period_start:      day(i as i64 + 1),
            period_end:        day(i as i64 + 2),
            total_revenue:     v,
            transaction_count: (v / 25.0).round().max(1.0) as u64,
        })
        .collect()
}

pub fn store() -> ArtifactStore {
    let store = ArtifactStore::in_memory().expect("in-memory store");
    store.migrate().expect("migration");
    store
}

pub fn orchestrator(config: PipelineConfig) -> PipelineOrchestrator {
    PipelineOrchestrator::new(config, store()).expect("orchestrator")
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

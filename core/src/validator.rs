//! Validator — the single ingestion boundary.
//!
//! Every raw row is checked exactly once here. Rows that pass become
//! immutable `Transaction`s; rows that fail are kept with their reason so
//! the run manifest can report a per-rule breakdown.
//!
//! Rules, checked in order (first failure wins):
//!   1. required fields present
//!   2. timestamp parses
//!   3. quantity > 0
//!   4. unit_price finite and >= 0
//!   5. timestamp within the configured date range
//!   6. category / region in the configured allow-lists
//!   7. transaction_id not seen earlier in the batch

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::{
    config::ValidationConfig,
    error::{PipelineError, PipelineResult},
    transaction::{parse_timestamp, RawTransaction, RejectionReason, Transaction, ValidatedTransaction},
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub total:          usize,
    pub accepted:       usize,
    pub rejected:       usize,
    pub rejection_rate: f64,
    pub by_rule:        BTreeMap<String, usize>,
}

/// Validated rows split into the two halves the pipeline cares about.
#[derive(Debug, Clone, Default)]
pub struct ValidatedBatch {
    pub accepted: Vec<Transaction>,
    pub rejected: Vec<ValidatedTransaction>,
    pub report:   ValidationReport,
}

pub struct Validator {
    config: ValidationConfig,
}

impl Validator {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    /// Validate every row, in input order. Never fails.
    pub fn validate_all(&self, raws: &[RawTransaction]) -> Vec<ValidatedTransaction> {
        let mut seen_ids: HashSet<&str> = HashSet::with_capacity(raws.len());
        raws.iter()
            .enumerate()
            .map(|(row, raw)| match self.check_row(raw, &mut seen_ids) {
                Ok(txn) => ValidatedTransaction::Accepted(txn),
                Err(reason) => ValidatedTransaction::Rejected {
                    row,
                    transaction_id: raw.transaction_id.clone(),
                    reason,
                },
            })
            .collect()
    }

    /// Validate and partition. Fails with `DataQuality` when the rejection
    /// rate exceeds the configured ceiling.
    pub fn run(&self, raws: &[RawTransaction]) -> PipelineResult<ValidatedBatch> {
        let batch = self.partition(raws);
        self.check_ceiling(&batch.report)?;
        Ok(batch)
    }

    /// Validate and partition without enforcing the ceiling.
    pub fn partition(&self, raws: &[RawTransaction]) -> ValidatedBatch {
        let mut batch = ValidatedBatch::default();
        for outcome in self.validate_all(raws) {
            match outcome {
                ValidatedTransaction::Accepted(txn) => batch.accepted.push(txn),
                rejected => {
                    if let Some(reason) = rejected.rejection() {
                        *batch.report.by_rule.entry(reason.rule().to_string()).or_insert(0) += 1;
                    }
                    batch.rejected.push(rejected);
                }
            }
        }

        let total = raws.len();
        batch.report.total = total;
        batch.report.accepted = batch.accepted.len();
        batch.report.rejected = batch.rejected.len();
        batch.report.rejection_rate = if total == 0 {
            0.0
        } else {
            batch.rejected.len() as f64 / total as f64
        };

        if batch.report.rejected > 0 {
            log::warn!(
                "validator: rejected {}/{} rows ({:.1}%) breakdown={:?}",
                batch.report.rejected,
                total,
                batch.report.rejection_rate * 100.0,
                batch.report.by_rule,
            );
        } else {
            log::info!("validator: accepted all {total} rows");
        }

        batch
    }

    pub fn check_ceiling(&self, report: &ValidationReport) -> PipelineResult<()> {
        if report.rejection_rate > self.config.rejection_ceiling {
            return Err(PipelineError::DataQuality {
                rejected: report.rejected,
                total:    report.total,
                rate:     report.rejection_rate,
                ceiling:  self.config.rejection_ceiling,
            });
        }
        Ok(())
    }

    fn check_row<'a>(
        &self,
        raw: &'a RawTransaction,
        seen_ids: &mut HashSet<&'a str>,
    ) -> Result<Transaction, RejectionReason> {
        let transaction_id = required(&raw.transaction_id, "transaction_id")?;
        let customer_id = required(&raw.customer_id, "customer_id")?;
        let timestamp_text = required(&raw.timestamp, "timestamp")?;
        let product_id = required(&raw.product_id, "product_id")?;
        let category = required(&raw.category, "category")?;
        let region = required(&raw.region, "region")?;
        let quantity = raw
            .quantity
            .ok_or_else(|| RejectionReason::MissingField("quantity".into()))?;
        let unit_price = raw
            .unit_price
            .ok_or_else(|| RejectionReason::MissingField("unit_price".into()))?;

        let timestamp = parse_timestamp(timestamp_text)
            .ok_or(RejectionReason::UnparseableTimestamp)?;

        if quantity <= 0 {
            return Err(RejectionReason::NonPositiveQuantity);
        }
        let quantity = u32::try_from(quantity).map_err(|_| RejectionReason::QuantityOutOfRange)?;

        if !unit_price.is_finite() {
            return Err(RejectionReason::NonFiniteUnitPrice);
        }
        if unit_price < 0.0 {
            return Err(RejectionReason::NegativeUnitPrice);
        }

        let date = timestamp.date();
        if self.config.valid_from.is_some_and(|from| date < from)
            || self.config.valid_to.is_some_and(|to| date > to)
        {
            return Err(RejectionReason::OutOfDateRange);
        }

        if !allowed(&self.config.categories, category) {
            return Err(RejectionReason::UnknownCategory);
        }
        if !allowed(&self.config.regions, region) {
            return Err(RejectionReason::UnknownRegion);
        }

        if !seen_ids.insert(transaction_id) {
            return Err(RejectionReason::DuplicateTransactionId);
        }

        Ok(Transaction {
            transaction_id: transaction_id.to_string(),
            customer_id:    customer_id.to_string(),
            timestamp,
            product_id:     product_id.to_string(),
            category:       category.to_string(),
            quantity,
            unit_price,
            region:         region.to_string(),
        })
    }
}

fn required<'a>(field: &'a Option<String>, name: &str) -> Result<&'a str, RejectionReason> {
    match field.as_deref().map(str::trim) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(RejectionReason::MissingField(name.to_string())),
    }
}

fn allowed(list: &[String], value: &str) -> bool {
    list.is_empty() || list.iter().any(|v| v == value)
}

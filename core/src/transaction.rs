//! Transaction records at the ingestion boundary.
//!
//! RawTransaction is whatever the loading collaborator hands us, already
//! normalised to the transaction field names but with every field optional.
//! Transaction is the typed, immutable record that survives validation.
//! Nothing downstream of the Validator ever sees a RawTransaction.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::types::{CustomerId, ProductId};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawTransaction {
    pub transaction_id: Option<String>,
    pub customer_id:    Option<String>,
    pub timestamp:      Option<String>,
    pub product_id:     Option<String>,
    pub category:       Option<String>,
    pub quantity:       Option<i64>,
    pub unit_price:     Option<f64>,
    pub region:         Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub transaction_id: String,
    pub customer_id:    CustomerId,
    pub timestamp:      NaiveDateTime,
    pub product_id:     ProductId,
    pub category:       String,
    pub quantity:       u32,
    pub unit_price:     f64,
    pub region:         String,
}

impl Transaction {
    pub fn total_amount(&self) -> f64 {
        f64::from(self.quantity) * self.unit_price
    }

    pub fn date(&self) -> NaiveDate {
        self.timestamp.date()
    }
}

/// Why a raw row was not admitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", content = "field", rename_all = "snake_case")]
pub enum RejectionReason {
    MissingField(String),
    UnparseableTimestamp,
    NonPositiveQuantity,
    QuantityOutOfRange,
    NegativeUnitPrice,
    NonFiniteUnitPrice,
    OutOfDateRange,
    UnknownCategory,
    UnknownRegion,
    DuplicateTransactionId,
}

impl RejectionReason {
    /// Stable rule name used in reports and the event log.
    pub fn rule(&self) -> &'static str {
        match self {
            Self::MissingField(_)        => "missing_field",
            Self::UnparseableTimestamp   => "unparseable_timestamp",
            Self::NonPositiveQuantity    => "non_positive_quantity",
            Self::QuantityOutOfRange     => "quantity_out_of_range",
            Self::NegativeUnitPrice      => "negative_unit_price",
            Self::NonFiniteUnitPrice     => "non_finite_unit_price",
            Self::OutOfDateRange         => "out_of_date_range",
            Self::UnknownCategory        => "unknown_category",
            Self::UnknownRegion          => "unknown_region",
            Self::DuplicateTransactionId => "duplicate_transaction_id",
        }
    }
}

/// Outcome of validating one raw row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ValidatedTransaction {
    Accepted(Transaction),
    Rejected {
        row:            usize,
        transaction_id: Option<String>,
        reason:         RejectionReason,
    },
}

impl ValidatedTransaction {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }

    pub fn rejection(&self) -> Option<&RejectionReason> {
        match self {
            Self::Accepted(_) => None,
            Self::Rejected { reason, .. } => Some(reason),
        }
    }
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS`, `YYYY-MM-DDTHH:MM:SS` and bare dates.
pub fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.naive_utc());
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

mod common;

use common::{day, raw};
use retail_insight_core::{
    config::ValidationConfig,
    transaction::{RejectionReason, ValidatedTransaction},
    validator::Validator,
    PipelineError,
};

fn validator() -> Validator {
    Validator::new(ValidationConfig::default())
}

#[test]
fn clean_rows_are_all_accepted() {
    let rows: Vec<_> = (0..5)
        .map(|i| raw(&format!("T{i}"), "C1", 1 + i, "P1", 2, 9.5))
        .collect();
    let batch = validator().run(&rows).expect("valid batch");

    assert_eq!(batch.accepted.len(), 5);
    assert!(batch.rejected.is_empty());
    assert_eq!(batch.report.rejection_rate, 0.0);
    assert_eq!(batch.accepted[2].total_amount(), 19.0);
    assert_eq!(batch.accepted[2].date(), day(3));
}

#[test]
fn each_rule_rejects_with_its_reason() {
    let mut missing = raw("T1", "C1", 1, "P1", 1, 1.0);
    missing.customer_id = None;
    let mut blank = raw("T2", "C1", 1, "P1", 1, 1.0);
    blank.product_id = Some("   ".into());
    let mut bad_ts = raw("T3", "C1", 1, "P1", 1, 1.0);
    bad_ts.timestamp = Some("yesterday".into());
    let zero_qty = raw("T4", "C1", 1, "P1", 0, 1.0);
    let negative_price = raw("T5", "C1", 1, "P1", 1, -2.0);
    let nan_price = raw("T6", "C1", 1, "P1", 1, f64::NAN);
    let duplicate = raw("T1", "C2", 2, "P2", 1, 1.0);
    let fine = raw("T7", "C1", 1, "P1", 1, 1.0);
    let duplicate_of_fine = raw("T7", "C3", 3, "P3", 1, 1.0);

    let outcomes = validator().validate_all(&[
        missing,
        blank,
        bad_ts,
        zero_qty,
        negative_price,
        nan_price,
        duplicate,
        fine,
        duplicate_of_fine,
    ]);
    let reasons: Vec<Option<RejectionReason>> =
        outcomes.iter().map(|o| o.rejection().cloned()).collect();

    assert_eq!(
        reasons,
        vec![
            Some(RejectionReason::MissingField("customer_id".into())),
            Some(RejectionReason::MissingField("product_id".into())),
            Some(RejectionReason::UnparseableTimestamp),
            Some(RejectionReason::NonPositiveQuantity),
            Some(RejectionReason::NegativeUnitPrice),
            Some(RejectionReason::NonFiniteUnitPrice),
            // T1 was rejected earlier, so this is its first accepted use.
            None,
            None,
            Some(RejectionReason::DuplicateTransactionId),
        ]
    );
    assert!(outcomes[7].is_valid());
    match &outcomes[8] {
        ValidatedTransaction::Rejected { row, transaction_id, .. } => {
            assert_eq!(*row, 8);
            assert_eq!(transaction_id.as_deref(), Some("T7"));
        }
        other => panic!("expected rejection, got {other:?}"),
    }
}

#[test]
fn date_range_and_allow_lists_apply() {
    let config = ValidationConfig {
        valid_from: Some(day(5)),
        valid_to: Some(day(10)),
        categories: vec!["Food".into(), "Books".into()],
        regions: vec!["South".into()],
        ..ValidationConfig::default()
    };
    let mut north = raw("T4", "C1", 6, "P1", 1, 1.0);
    north.region = Some("North".into());
    let rows = vec![
        raw("T1", "C1", 4, "P1", 1, 1.0),  // before range
        raw("T2", "C1", 11, "P1", 1, 1.0), // after range
        raw("T3", "C1", 6, "P0", 1, 1.0),  // P0 is Electronics
        north,
        raw("T5", "C1", 10, "P1", 1, 1.0), // inclusive upper bound
    ];
    let outcomes = Validator::new(config).validate_all(&rows);

    assert_eq!(outcomes[0].rejection(), Some(&RejectionReason::OutOfDateRange));
    assert_eq!(outcomes[1].rejection(), Some(&RejectionReason::OutOfDateRange));
    assert_eq!(outcomes[2].rejection(), Some(&RejectionReason::UnknownCategory));
    assert_eq!(outcomes[3].rejection(), Some(&RejectionReason::UnknownRegion));
    assert!(outcomes[4].is_valid());
}

#[test]
fn report_counts_rejections_per_rule() {
    let rows = vec![
        raw("T1", "C1", 1, "P1", 0, 1.0),
        raw("T2", "C1", 1, "P1", -3, 1.0),
        raw("T3", "C1", 1, "P1", 1, -1.0),
        raw("T4", "C1", 1, "P1", 1, 1.0),
    ];
    let batch = validator().partition(&rows);

    assert_eq!(batch.report.total, 4);
    assert_eq!(batch.report.accepted, 1);
    assert_eq!(batch.report.rejected, 3);
    assert_eq!(batch.report.by_rule.get("non_positive_quantity"), Some(&2));
    assert_eq!(batch.report.by_rule.get("negative_unit_price"), Some(&1));
    assert!((batch.report.rejection_rate - 0.75).abs() < 1e-12);
}

#[test]
fn oversized_quantity_has_its_own_rule() {
    let rows = vec![
        raw("T1", "C1", 1, "P1", i64::from(u32::MAX) + 1, 1.0),
        raw("T2", "C1", 1, "P1", i64::from(u32::MAX), 1.0),
    ];
    let batch = validator().partition(&rows);

    assert_eq!(batch.report.by_rule.get("quantity_out_of_range"), Some(&1));
    assert_eq!(batch.report.by_rule.get("non_positive_quantity"), None);
    assert_eq!(batch.accepted.len(), 1);
    assert_eq!(batch.accepted[0].quantity, u32::MAX);
}

#[test]
fn rejection_rate_above_ceiling_is_data_quality_error() {
    // 6 of 10 rejected against the default 50% ceiling.
    let rows: Vec<_> = (0..10)
        .map(|i| {
            let qty = if i < 6 { 0 } else { 1 };
            raw(&format!("T{i}"), "C1", 1, "P1", qty, 3.0)
        })
        .collect();

    match validator().run(&rows) {
        Err(PipelineError::DataQuality { rejected, total, rate, ceiling }) => {
            assert_eq!(rejected, 6);
            assert_eq!(total, 10);
            assert!((rate - 0.6).abs() < 1e-12);
            assert!((ceiling - 0.5).abs() < 1e-12);
        }
        other => panic!("expected DataQuality, got {other:?}"),
    }
}

#[test]
fn rejection_rate_at_ceiling_is_allowed() {
    let rows: Vec<_> = (0..10)
        .map(|i| {
            let qty = if i < 5 { 0 } else { 1 };
            raw(&format!("T{i}"), "C1", 1, "P1", qty, 3.0)
        })
        .collect();
    let batch = validator().run(&rows).expect("exactly at ceiling");
    assert_eq!(batch.accepted.len(), 5);
}

#[test]
fn empty_input_is_not_a_quality_failure() {
    let batch = validator().run(&[]).expect("empty batch");
    assert_eq!(batch.report.total, 0);
    assert_eq!(batch.report.rejection_rate, 0.0);
}

use std::path::PathBuf;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde_json::json;

use tillmatch_recon::config::{ChunkRequest, DateRange, PipelineConfig};
use tillmatch_recon::model::{
    ChunkReport, ExceptionCategory, GroupOutcome, JobStatus, MatchingStatus, RawRecord,
    ReconciliationResult, ReconciliationSubType, ReconciliationType, StageRole,
};
use tillmatch_recon::tracker::plan_chunks;
use tillmatch_recon::{
    process_chunk, run_chunk, JobStore, JobTracker, MemoryJobStore, MemoryLedger,
    MemoryResultSink, ReconContext, ReconError,
};

fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

fn load_config(name: &str) -> PipelineConfig {
    let toml = std::fs::read_to_string(fixtures_dir().join(name)).unwrap();
    PipelineConfig::from_toml(&toml).unwrap()
}

fn load_ledger(config: &PipelineConfig) -> MemoryLedger {
    MemoryLedger::from_csv_dir(&fixtures_dir(), config.sources.keys().map(String::as_str)).unwrap()
}

fn d(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

fn card_request(start: &str, end: &str) -> ChunkRequest {
    ChunkRequest {
        tenant_id: "m-1".into(),
        range: DateRange::parse(start, end).unwrap(),
        reconciliation_type: ReconciliationType::SalesAmount,
        sub_type: ReconciliationSubType::CreditCard,
        channel: Some("credit_card".into()),
    }
}

fn po_request(end: &str) -> ChunkRequest {
    ChunkRequest {
        tenant_id: "m-1".into(),
        range: DateRange::parse("2026-03-01", end).unwrap(),
        reconciliation_type: ReconciliationType::ThreeWayMatch,
        sub_type: ReconciliationSubType::PurchaseOrder,
        channel: None,
    }
}

fn published<'a>(report: &'a ChunkReport, group: &str) -> &'a ReconciliationResult {
    report
        .groups
        .iter()
        .find_map(|g| match g {
            GroupOutcome::Published { result } if result.group_key == group => Some(result),
            _ => None,
        })
        .unwrap_or_else(|| panic!("no published result for {group}"))
}

// -------------------------------------------------------------------------
// Sales / settlement chain
// -------------------------------------------------------------------------

#[test]
fn card_sales_chain_classifies_each_branch() {
    let config = load_config("card-sales.recon.toml");
    let ledger = load_ledger(&config);
    let sink = MemoryResultSink::new();
    let ctx = ReconContext {
        config: &config,
        ledger: &ledger,
        results: &sink,
        publisher: &sink,
    };

    let report = run_chunk(&ctx, &card_request("2026-01-15", "2026-01-15")).unwrap();
    // BR04 is cash only; the m-2 record belongs to another tenant.
    assert_eq!(report.summary.total_groups, 4);
    assert_eq!(report.summary.published, 4);

    let br01 = published(&report, "BR01");
    assert_eq!(br01.matching_status, MatchingStatus::Matched);
    assert_eq!(br01.exception_category, Some(ExceptionCategory::NoException));
    // Cancelled receipt R-1003 is excluded, not zeroed.
    assert_eq!(br01.stage_amounts[&StageRole::Sales], d("200.00"));
    assert_eq!(br01.record_counts[&StageRole::Sales], 2);
    assert_eq!(br01.record_counts[&StageRole::Payment], 2);
    assert_eq!(
        br01.unique_key,
        "BR01_2026-01-15_credit_card_salesAmount_creditCard"
    );

    let br02 = published(&report, "BR02");
    assert_eq!(br02.matching_status, MatchingStatus::Mismatched);
    assert_eq!(br02.exception_category, Some(ExceptionCategory::AmountDiscrepancy));
    assert_eq!(br02.variance_amount, d("7.00"));
    assert_eq!(br02.comparisons.len(), 2);
    assert!(br02
        .exception_description
        .contains("sales->payment amount: Expected: 310, Found: 305"));
    assert!(br02
        .exception_description
        .contains("payment->bank amount: Expected: 305, Found: 298"));

    let br03 = published(&report, "BR03");
    assert_eq!(br03.exception_category, Some(ExceptionCategory::MissingReference));
    assert_eq!(br03.variance_amount, d("90.00"));
    assert!(!br03.stage_amounts.contains_key(&StageRole::Payment));

    let br05 = published(&report, "BR05");
    assert_eq!(br05.exception_category, Some(ExceptionCategory::DuplicateDetected));
    assert_eq!(br05.variance_amount, d("0.00"));

    assert_eq!(report.summary.category_counts["noException"], 1);
    assert_eq!(sink.len(), 4);
}

#[test]
fn redelivered_chunk_publishes_nothing_new() {
    let config = load_config("card-sales.recon.toml");
    let ledger = load_ledger(&config);
    let sink = MemoryResultSink::new();
    let ctx = ReconContext {
        config: &config,
        ledger: &ledger,
        results: &sink,
        publisher: &sink,
    };
    let request = card_request("2026-01-15", "2026-01-15");

    run_chunk(&ctx, &request).unwrap();
    let before = sink.messages();
    let again = run_chunk(&ctx, &request).unwrap();

    assert_eq!(again.summary.total_groups, 4);
    assert_eq!(again.summary.dropped_duplicates, 4);
    assert_eq!(again.summary.published, 0);
    assert_eq!(sink.len(), 4);
    let after = sink.messages();
    for (a, b) in before.iter().zip(after.iter()) {
        assert_eq!(
            a.reconciliation_data.created_at,
            b.reconciliation_data.created_at
        );
    }
}

#[test]
fn failing_group_does_not_stop_the_rest() {
    let config = load_config("card-sales.recon.toml");
    let mut ledger = load_ledger(&config);
    // BR00 sorts first and its settlement sum overflows.
    ledger.insert(
        "edc",
        vec![
            RawRecord::from(json!({"tenant_id": "m-1", "merchant_branch": "BR00", "settled_at": "2026-01-15T20:00:00", "gross": "79228162514264337593543950335", "settlement_id": "S-X1"})),
            RawRecord::from(json!({"tenant_id": "m-1", "merchant_branch": "BR00", "settled_at": "2026-01-15T20:01:00", "gross": "79228162514264337593543950335", "settlement_id": "S-X2"})),
        ],
    );
    let sink = MemoryResultSink::new();
    sink.reject("BR02_2026-01-15_credit_card_salesAmount_creditCard");
    let ctx = ReconContext {
        config: &config,
        ledger: &ledger,
        results: &sink,
        publisher: &sink,
    };

    let report = run_chunk(&ctx, &card_request("2026-01-15", "2026-01-15")).unwrap();
    assert_eq!(report.summary.total_groups, 5);
    assert_eq!(report.summary.failed, 1);
    assert_eq!(report.summary.publish_failures, 1);
    assert_eq!(report.summary.published, 3);

    match &report.groups[0] {
        GroupOutcome::Failed {
            error,
            placeholder_published,
            ..
        } => {
            assert!(error.contains("amount overflow"));
            assert!(*placeholder_published);
        }
        other => panic!("expected failed group, got {other:?}"),
    }
    let placeholder = sink
        .get("BR00_2026-01-15_credit_card_salesAmount_creditCard")
        .unwrap();
    assert_eq!(
        placeholder.reconciliation_data.result.matching_status,
        MatchingStatus::Failed
    );
    assert!(matches!(
        report.groups[2],
        GroupOutcome::PublishFailed { .. }
    ));
    published(&report, "BR03");
    published(&report, "BR05");
}

#[test]
fn unsupported_pair_returns_empty_report() {
    let config = load_config("card-sales.recon.toml");
    let ledger = load_ledger(&config);
    let sink = MemoryResultSink::new();
    let ctx = ReconContext {
        config: &config,
        ledger: &ledger,
        results: &sink,
        publisher: &sink,
    };
    let mut request = card_request("2026-01-15", "2026-01-15");
    request.reconciliation_type = ReconciliationType::SettlementAmount;
    request.sub_type = ReconciliationSubType::FoodMarketplace;

    let report = run_chunk(&ctx, &request).unwrap();
    assert!(!report.supported);
    assert_eq!(report.summary.total_groups, 0);
    assert!(sink.is_empty());
}

#[test]
fn unreachable_bank_fails_the_chunk() {
    let config = load_config("card-sales.recon.toml");
    let ledger = load_ledger(&config);
    ledger.fail_next("bank", 3);
    let sink = MemoryResultSink::new();
    let ctx = ReconContext {
        config: &config,
        ledger: &ledger,
        results: &sink,
        publisher: &sink,
    };

    let err = run_chunk(&ctx, &card_request("2026-01-15", "2026-01-15")).unwrap_err();
    match err {
        ReconError::SourceUnavailable {
            source_name,
            attempts,
            ..
        } => {
            assert_eq!(source_name, "bank");
            assert_eq!(attempts, 3);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(sink.is_empty());
}

#[test]
fn job_completes_once_every_chunk_reports() {
    let config = load_config("card-sales.recon.toml");
    let ledger = load_ledger(&config);
    let sink = MemoryResultSink::new();
    let ctx = ReconContext {
        config: &config,
        ledger: &ledger,
        results: &sink,
        publisher: &sink,
    };

    let job_range = DateRange::parse("2026-01-15", "2026-01-16").unwrap();
    let chunks = plan_chunks(&job_range, 1);
    assert_eq!(chunks.len(), 2);

    let jobs = MemoryJobStore::new();
    jobs.create_job("job-jan", chunks.len() as u64);

    let reports: Vec<ChunkReport> = std::thread::scope(|s| {
        let handles: Vec<_> = chunks
            .iter()
            .map(|range| {
                let ctx = &ctx;
                let jobs = &jobs;
                let request = ChunkRequest {
                    range: *range,
                    ..card_request("2026-01-15", "2026-01-15")
                };
                s.spawn(move || {
                    let tracker = JobTracker::new(jobs);
                    let chunk = process_chunk(ctx, &tracker, "job-jan", &request);
                    assert!(chunk.tracking_error.is_none());
                    chunk.outcome.unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let groups: usize = reports.iter().map(|r| r.summary.total_groups).sum();
    assert_eq!(groups, 5);
    let job = jobs.get_job("job-jan").unwrap();
    assert_eq!(job.completed_chunks, 2);
    assert_eq!(job.failed_chunks, 0);
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(jobs.completion_transitions("job-jan"), 1);
    assert!(sink
        .get("BR01_2026-01-16_credit_card_salesAmount_creditCard")
        .is_some());
}

// -------------------------------------------------------------------------
// Purchase order chain
// -------------------------------------------------------------------------

#[test]
fn split_invoice_partial_then_matched() {
    let config = load_config("three-way.recon.toml");
    let ledger = load_ledger(&config);
    let sink = MemoryResultSink::new();
    let ctx = ReconContext {
        config: &config,
        ledger: &ledger,
        results: &sink,
        publisher: &sink,
    };

    // Day 5: GRN-1 and INV-1 in, 40 units outstanding.
    let day5 = run_chunk(&ctx, &po_request("2026-03-05")).unwrap();
    let po100 = published(&day5, "PO-100");
    assert_eq!(
        po100.exception_category,
        Some(ExceptionCategory::PartialDeliveryOrSplit)
    );
    assert_eq!(po100.matching_status, MatchingStatus::PartialMatched);
    assert_eq!(po100.variance_amount, d("400.00"));
    assert_eq!(po100.stage_quantities[&StageRole::Grn], 60);
    assert_eq!(
        po100.unique_key,
        "PO-100_2026-03-05_threeWayMatch_purchaseOrder"
    );

    let po200 = published(&day5, "PO-200");
    assert_eq!(po200.exception_category, Some(ExceptionCategory::PriceDiscrepancy));
    assert_eq!(po200.variance_amount, d("-100.00"));

    let po300 = published(&day5, "PO-300");
    assert_eq!(po300.exception_category, Some(ExceptionCategory::MissingReference));
    assert_eq!(po300.variance_amount, d("50.00"));

    // Day 10: GRN-2 and INV-2 complete the order.
    let day10 = run_chunk(&ctx, &po_request("2026-03-10")).unwrap();
    let po100 = published(&day10, "PO-100");
    assert_eq!(po100.exception_category, Some(ExceptionCategory::NoException));
    assert_eq!(po100.matching_status, MatchingStatus::Matched);
    assert_eq!(po100.variance_amount, d("0.00"));
    assert_eq!(po100.record_counts[&StageRole::Grn], 2);
    assert_eq!(po100.record_counts[&StageRole::Invoice], 2);
    assert_eq!(
        po100.unique_key,
        "PO-100_2026-03-10_threeWayMatch_purchaseOrder"
    );

    // Nothing new arrived for the other orders, so their keys are unchanged.
    assert_eq!(day10.summary.dropped_duplicates, 2);
    assert_eq!(sink.len(), 4);
}

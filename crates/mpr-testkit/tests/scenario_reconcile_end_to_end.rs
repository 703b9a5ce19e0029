//! Scenario: full reconciliation runs against in-process fakes
//!
//! # Invariants under test
//!
//! 1. Every record found => missing set empty, retrieved == records, no report lines.
//! 2. One record answered "not found" => exactly one report line for it, with
//!    `age = first_seen - now`.
//! 3. Empty snapshot => no jobs, progress loop exits at once, empty report,
//!    missing fraction stays finite.
//! 4. The connection is opened once and closed once per run.
//! 5. A JSON mempool fixture flows through the same path.
//!
//! All tests are pure in-process; no network required.

use std::sync::Arc;
use std::time::Duration;

use mpr_reconcile::{run_reconciliation, RecordId, RunOptions};
use mpr_testkit::{load_snapshot_json, snapshot_of, FakeAnswer, FakeSnapshotSource, FakeVerifier};

// ---------------------------------------------------------------------------
// 1. All found
// ---------------------------------------------------------------------------

#[tokio::test]
async fn single_record_found_yields_empty_report() {
    let source = FakeSnapshotSource::returning(snapshot_of(&[("tx1", 1_700_000_000)]));
    let client = Arc::new(FakeVerifier::new());

    let summary = run_reconciliation(&source, client.clone(), &RunOptions::default())
        .await
        .expect("run must complete");

    assert_eq!(summary.snapshot_len, 1);
    assert_eq!(summary.counts.retrieved, 1);
    assert_eq!(summary.counts.missing, 0);
    assert!(summary.report.missing.is_empty());
    assert!(summary.report.is_clean());
    assert_eq!(source.fetches(), 1);
}

// ---------------------------------------------------------------------------
// 2. One missing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn not_found_record_is_reported_with_age() {
    let t_tx2 = 1_700_000_500;
    let source = FakeSnapshotSource::returning(snapshot_of(&[
        ("tx1", 1_700_000_000),
        ("tx2", t_tx2),
    ]));
    let client = Arc::new(FakeVerifier::new().answer("tx2", FakeAnswer::NotFound));

    let before = chrono::Utc::now().timestamp();
    let summary = run_reconciliation(&source, client.clone(), &RunOptions::default())
        .await
        .expect("run must complete");
    let after = chrono::Utc::now().timestamp();

    assert_eq!(summary.counts.retrieved, 1);
    assert_eq!(summary.counts.missing, 1);
    assert_eq!(summary.report.missing.len(), 1);

    let line = &summary.report.missing[0];
    assert_eq!(line.record_id, RecordId::from("tx2"));
    assert!(
        line.age_secs <= t_tx2 - before && line.age_secs >= t_tx2 - after,
        "age {} outside [{}, {}]",
        line.age_secs,
        t_tx2 - after,
        t_tx2 - before
    );
    assert_eq!(line.age_secs, t_tx2 - summary.report.generated_at);
    assert!(line.to_string().starts_with(&format!("{} tx2 ", line.age_secs)));
}

// ---------------------------------------------------------------------------
// 3. Empty snapshot
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn empty_snapshot_finishes_without_jobs_or_progress() {
    let source = FakeSnapshotSource::returning(snapshot_of(&[]));
    let client = Arc::new(FakeVerifier::new());

    let started = tokio::time::Instant::now();
    let summary = run_reconciliation(&source, client.clone(), &RunOptions::default())
        .await
        .expect("run must complete");

    assert_eq!(summary.counts.attempted, 0);
    assert_eq!(summary.progress_lines, 0);
    assert!(summary.report.is_clean());
    assert_eq!(summary.counts.missing_fraction(), 0.0);
    assert!(client.calls().is_empty());
    // No progress interval was waited out.
    assert!(started.elapsed() < Duration::from_secs(1));
}

// ---------------------------------------------------------------------------
// 4. Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn connection_opened_and_closed_once() {
    let source = FakeSnapshotSource::returning(snapshot_of(&[("a", 1), ("b", 2), ("c", 3)]));
    let client = Arc::new(FakeVerifier::new());

    run_reconciliation(&source, client.clone(), &RunOptions::default())
        .await
        .expect("run must complete");

    assert_eq!(client.connect_calls(), 1);
    assert_eq!(client.close_calls(), 1);
    assert!(!client.is_connected());
}

// ---------------------------------------------------------------------------
// 5. Fixture
// ---------------------------------------------------------------------------

#[tokio::test]
async fn mempool_fixture_reports_missing_oldest_first() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/mempool_verbose.json");
    let snapshot = load_snapshot_json(path).expect("fixture must load");
    assert_eq!(snapshot.len(), 3);

    let newer = "7f3e2d1c0b9a8f7e6d5c4b3a29181706f5e4d3c2b1a09f8e7d6c5b4a39281706";
    let older = "c4d5e6f708192a3b4c5d6e7f8091a2b3c4d5e6f708192a3b4c5d6e7f8091a2b3";
    let client = Arc::new(
        FakeVerifier::new()
            .answer(newer, FakeAnswer::NotFound)
            .answer(older, FakeAnswer::NotFound),
    );
    let source = FakeSnapshotSource::returning(snapshot);

    let summary = run_reconciliation(&source, client.clone(), &RunOptions::default())
        .await
        .expect("run must complete");

    let ids: Vec<&str> = summary
        .report
        .missing
        .iter()
        .map(|l| l.record_id.as_str())
        .collect();
    assert_eq!(ids, vec![older, newer]);

    let first = summary.report.missing[0].to_string();
    assert!(first.contains("\"base\":0.00000220"), "got {first}");
}

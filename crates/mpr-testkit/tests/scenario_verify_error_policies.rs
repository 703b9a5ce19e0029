//! Scenario: non-"not found" failures and setup failures
//!
//! # Invariants under test
//!
//! 1. Tolerate: a failed call is neither retrieved nor missing; it shows up as
//!    an unverified line and the batch finishes.
//! 2. Abort: the first failure cancels every waiting job, in-flight jobs drain,
//!    the connection is still closed, and no report is produced. Once the
//!    batch is aborted no further job is admitted, even while the driver is
//!    still submitting on a multi-threaded runtime.
//! 3. Snapshot fetch failure => the client is never connected.
//! 4. Connect failure => no verification call and no close.
//! 5. A call that never answers is classified as timed out when a timeout is set.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mpr_reconcile::{
    reconcile_snapshot, run_reconciliation, FailureKind, Presence, RecordId, ReconcileError,
    RunOptions, SnapshotError, VerificationClient, VerifyError, VerifyErrorPolicy,
};
use mpr_testkit::{
    numbered_snapshot, snapshot_of, FakeAnswer, FakeSnapshotSource, FakeVerifier,
};

fn transport(msg: &str) -> VerifyError {
    VerifyError::Transport(msg.to_string())
}

// ---------------------------------------------------------------------------
// 1. Tolerate
// ---------------------------------------------------------------------------

#[tokio::test]
async fn tolerate_reports_failed_calls_as_unverified() {
    let snapshot = snapshot_of(&[("tx1", 100), ("tx2", 200), ("tx3", 300)]);
    let client = Arc::new(
        FakeVerifier::new()
            .answer("tx2", FakeAnswer::Fail(transport("connection reset")))
            .answer("tx3", FakeAnswer::NotFound),
    );

    let summary = reconcile_snapshot(&snapshot, client.clone(), &RunOptions::default(), |_| {})
        .await
        .expect("tolerate must finish the batch");

    assert_eq!(summary.counts.attempted, 3);
    assert_eq!(summary.counts.retrieved, 1);
    assert_eq!(summary.counts.missing, 1);
    assert_eq!(summary.counts.failed, 1);

    assert_eq!(summary.report.missing.len(), 1);
    assert_eq!(summary.report.missing[0].record_id.as_str(), "tx3");
    assert_eq!(summary.report.unverified.len(), 1);
    assert_eq!(
        summary.report.unverified[0].to_string(),
        "unverified tx2 transport error: connection reset"
    );
    assert!(!summary.report.is_clean());
}

// ---------------------------------------------------------------------------
// 2. Abort
// ---------------------------------------------------------------------------

#[tokio::test]
async fn abort_cancels_waiting_jobs_and_skips_report() {
    let snapshot = numbered_snapshot(10, 1_700_000_000);
    let client = Arc::new(
        FakeVerifier::new().answer("tx0002", FakeAnswer::Fail(transport("broken pipe"))),
    );
    let opts = RunOptions {
        concurrency_limit: NonZeroUsize::new(1).unwrap(),
        on_verify_error: VerifyErrorPolicy::Abort,
        ..RunOptions::default()
    };

    let err = reconcile_snapshot(&snapshot, client.clone(), &opts, |_| {})
        .await
        .expect_err("abort policy must fail the run");

    match err {
        ReconcileError::Aborted { reason, cancelled } => {
            assert_eq!(cancelled, 7);
            assert_eq!(reason, "tx0002: transport error: broken pipe");
        }
        other => panic!("expected Aborted, got {other:?}"),
    }
    assert_eq!(client.call_order(), vec!["tx0000", "tx0001", "tx0002"]);
    assert_eq!(client.close_calls(), 1);
}

/// `tx0000` fails at once; every other call takes 20ms, so no slot frees up
/// on its own while the driver is still submitting.
#[derive(Default)]
struct FirstCallFails {
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl VerificationClient for FirstCallFails {
    fn name(&self) -> &'static str {
        "first-call-fails"
    }

    async fn connect(&self) -> Result<(), VerifyError> {
        Ok(())
    }

    async fn verify(&self, record_id: &RecordId) -> Result<Presence, VerifyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if record_id.as_str() == "tx0000" {
            return Err(transport("broken pipe"));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(Presence::Found)
    }

    async fn close(&self) -> Result<(), VerifyError> {
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn abort_admits_nothing_while_submission_is_still_running() {
    let limit = 4;
    let snapshot = numbered_snapshot(2_000, 1_700_000_000);
    let client = Arc::new(FirstCallFails::default());
    let opts = RunOptions {
        concurrency_limit: NonZeroUsize::new(limit).unwrap(),
        on_verify_error: VerifyErrorPolicy::Abort,
        ..RunOptions::default()
    };

    let err = reconcile_snapshot(&snapshot, client.clone(), &opts, |_| {})
        .await
        .expect_err("abort policy must fail the run");

    assert!(matches!(err, ReconcileError::Aborted { .. }), "{err:?}");
    // Only jobs holding a slot when the batch aborted may have called out.
    let calls = client.calls.load(Ordering::SeqCst);
    assert!(calls <= limit, "{calls} calls issued with a limit of {limit}");
}

// ---------------------------------------------------------------------------
// 3 + 4. Setup failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn snapshot_failure_never_connects() {
    let source = FakeSnapshotSource::failing(SnapshotError::Rpc {
        code: Some(-28),
        message: "Loading block index...".to_string(),
    });
    let client = Arc::new(FakeVerifier::new());

    let err = run_reconciliation(&source, client.clone(), &RunOptions::default())
        .await
        .expect_err("snapshot failure is fatal");

    assert!(matches!(err, ReconcileError::Snapshot(SnapshotError::Rpc { .. })));
    assert!(err.to_string().contains("code=-28"));
    assert_eq!(client.connect_calls(), 0);
    assert_eq!(client.close_calls(), 0);
}

#[tokio::test]
async fn connect_failure_issues_no_calls() {
    let source = FakeSnapshotSource::returning(snapshot_of(&[("tx1", 1)]));
    let client = Arc::new(FakeVerifier::new().fail_connect(transport("connection refused")));

    let err = run_reconciliation(&source, client.clone(), &RunOptions::default())
        .await
        .expect_err("connect failure is fatal");

    assert_eq!(err, ReconcileError::Connect(transport("connection refused")));
    assert!(client.calls().is_empty());
    assert_eq!(client.close_calls(), 0);
}

// ---------------------------------------------------------------------------
// 5. Timeout
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn hung_call_times_out_and_is_unverified() {
    let snapshot = snapshot_of(&[("fast", 10), ("stuck", 20)]);
    let client = Arc::new(FakeVerifier::new().answer("stuck", FakeAnswer::Hang));
    let opts = RunOptions {
        verify_timeout: Some(Duration::from_secs(3)),
        ..RunOptions::default()
    };

    let summary = reconcile_snapshot(&snapshot, client.clone(), &opts, |_| {})
        .await
        .expect("timeouts are tolerated by default");

    assert_eq!(summary.counts.retrieved, 1);
    assert_eq!(summary.counts.failed, 1);
    assert_eq!(
        summary.report.unverified[0].to_string(),
        "unverified stuck timed out after 3000ms"
    );
    assert_eq!(client.close_calls(), 1);
    assert_eq!(
        FailureKind::TimedOut(Duration::from_secs(3)).to_string(),
        "timed out after 3000ms"
    );
}

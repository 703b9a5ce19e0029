//! Run driver.
//!
//! fetch snapshot -> connect -> one job per record -> progress until idle ->
//! close -> report.
//!
//! Setup failures (snapshot fetch, connect) end the run before any
//! verification starts. An aborted batch still drains its in-flight jobs and
//! closes the connection, but produces no report.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tracing::{info, warn};

use crate::coordinator::{Coordinator, ReconcileCounts, ReconciliationState, VerifyErrorPolicy};
use crate::progress::{log_sample, ProgressReporter, ProgressSample};
use crate::report::{build_report, DiscrepancyReport};
use crate::scheduler::{TaskScheduler, DEFAULT_CONCURRENCY_LIMIT};
use crate::{RecordId, Snapshot, SnapshotError, SnapshotSource, VerificationClient, VerifyError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReconcileError {
    /// The authoritative snapshot could not be fetched.
    Snapshot(SnapshotError),
    /// The verification client could not connect.
    Connect(VerifyError),
    /// A verification failure stopped the batch under the abort policy.
    Aborted { reason: String, cancelled: u64 },
    /// A missing id was not a snapshot key.
    UnknownRecord(RecordId),
}

impl fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileError::Snapshot(e) => write!(f, "snapshot fetch failed: {e}"),
            ReconcileError::Connect(e) => write!(f, "verification client connect failed: {e}"),
            ReconcileError::Aborted { reason, cancelled } => write!(
                f,
                "reconciliation aborted ({cancelled} queued job(s) cancelled): {reason}"
            ),
            ReconcileError::UnknownRecord(id) => {
                write!(f, "missing record '{id}' is not in the snapshot")
            }
        }
    }
}

impl std::error::Error for ReconcileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReconcileError::Snapshot(e) => Some(e),
            ReconcileError::Connect(e) => Some(e),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Options / summary
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunOptions {
    pub concurrency_limit: NonZeroUsize,
    pub progress_interval: Duration,
    pub verify_timeout: Option<Duration>,
    pub on_verify_error: VerifyErrorPolicy,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            concurrency_limit: NonZeroUsize::new(DEFAULT_CONCURRENCY_LIMIT)
                .unwrap_or(NonZeroUsize::MIN),
            progress_interval: ProgressReporter::DEFAULT_INTERVAL,
            verify_timeout: None,
            on_verify_error: VerifyErrorPolicy::Tolerate,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RunSummary {
    pub snapshot_len: usize,
    pub counts: ReconcileCounts,
    pub progress_lines: usize,
    pub elapsed: Duration,
    pub report: DiscrepancyReport,
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Full run: fetch the snapshot from `source`, then [`reconcile_snapshot`].
/// Progress lines go to `tracing`.
pub async fn run_reconciliation(
    source: &dyn SnapshotSource,
    client: Arc<dyn VerificationClient>,
    opts: &RunOptions,
) -> Result<RunSummary, ReconcileError> {
    info!(source = source.name(), "fetching snapshot");
    let started = Instant::now();
    let snapshot = source
        .fetch_snapshot()
        .await
        .map_err(ReconcileError::Snapshot)?;
    info!(
        source = source.name(),
        records = snapshot.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "snapshot fetched"
    );

    reconcile_snapshot(&snapshot, client, opts, log_sample).await
}

/// Verify every record of an already fetched snapshot.
///
/// `on_progress` receives one sample per progress interval.
pub async fn reconcile_snapshot<F>(
    snapshot: &Snapshot,
    client: Arc<dyn VerificationClient>,
    opts: &RunOptions,
    on_progress: F,
) -> Result<RunSummary, ReconcileError>
where
    F: FnMut(&ProgressSample),
{
    let started = Instant::now();

    client.connect().await.map_err(ReconcileError::Connect)?;
    info!(client = client.name(), "verification client connected");

    let state = Arc::new(ReconciliationState::new());
    let scheduler = TaskScheduler::new(opts.concurrency_limit, Handle::current());
    let mut coordinator = Coordinator::new(Arc::clone(&client), Arc::clone(&state))
        .with_policy(opts.on_verify_error)
        .with_timeout(opts.verify_timeout);
    if opts.on_verify_error == VerifyErrorPolicy::Abort {
        // The scheduler closes before the abort is recorded, so no job is
        // admitted once the batch is known to be aborted.
        let sched = scheduler.clone();
        coordinator = coordinator.on_abort(Arc::new(move || {
            sched.close();
        }));
    }

    info!(
        records = snapshot.len(),
        limit = scheduler.limit(),
        policy = opts.on_verify_error.as_str(),
        "verifying records against {}",
        client.name()
    );

    for id in snapshot.ids() {
        if state.is_aborted() {
            break;
        }
        scheduler.submit_boxed(coordinator.job(id.clone()));
    }

    let progress_lines = ProgressReporter::new(opts.progress_interval)
        .run(&scheduler, &state, on_progress)
        .await;

    if let Err(e) = client.close().await {
        warn!(client = client.name(), error = %e, "verification client close failed");
    } else {
        info!(client = client.name(), "verification client closed");
    }

    let counts = state.counts();
    if let Some(reason) = state.abort_reason() {
        return Err(ReconcileError::Aborted {
            reason,
            cancelled: scheduler.counts().cancelled,
        });
    }

    let now = chrono::Utc::now().timestamp();
    let report = build_report(snapshot, &state.missing_ids(), &state.failures(), now)?;

    info!(
        retrieved = counts.retrieved,
        missing = counts.missing,
        failed = counts.failed,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "reconciliation complete"
    );

    Ok(RunSummary {
        snapshot_len: snapshot.len(),
        counts,
        progress_lines,
        elapsed: started.elapsed(),
        report,
    })
}

//! Reconciliation coordinator: one verification call per record, classified
//! into the shared [`ReconciliationState`].
//!
//! Classification:
//! - [`Presence::Found`] => `retrieved += 1`
//! - [`Presence::NotFound`] => record joins the missing set
//! - [`VerifyError`] or timeout => record joins the failed map; under
//!   [`VerifyErrorPolicy::Abort`] the abort hook runs first (the driver uses
//!   it to close the scheduler), then the state is tripped
//!
//! Every classification path returns normally, so the scheduler's bookkeeping
//! always runs after a job.
//!
//! `attempted` is bumped when a job is created (submission time), which keeps
//! `attempted == retrieved + missing + failed + running + waiting` true at
//! every scheduler transition.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::scheduler::Job;
use crate::{FailureKind, Presence, RecordId, VerificationClient};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Error policy
// ---------------------------------------------------------------------------

/// What to do when a verification call fails for a reason other than a
/// protocol-level "not found".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyErrorPolicy {
    /// Record the id as unverified and keep going.
    #[default]
    Tolerate,
    /// Record the id, then stop the batch: waiting jobs are cancelled and the
    /// run fails without a report.
    Abort,
}

impl VerifyErrorPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerifyErrorPolicy::Tolerate => "tolerate",
            VerifyErrorPolicy::Abort => "abort",
        }
    }
}

impl FromStr for VerifyErrorPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tolerate" => Ok(VerifyErrorPolicy::Tolerate),
            "abort" => Ok(VerifyErrorPolicy::Abort),
            other => Err(format!(
                "invalid verify error policy '{other}'. expected one of: tolerate | abort"
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Counter snapshot for progress lines and the final summary.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileCounts {
    pub attempted: u64,
    pub retrieved: u64,
    pub missing: u64,
    pub failed: u64,
}

impl ReconcileCounts {
    /// `missing / max(retrieved, 1)`. Zero when nothing has been retrieved
    /// and nothing is missing.
    pub fn missing_fraction(&self) -> f64 {
        self.missing as f64 / self.retrieved.max(1) as f64
    }

    /// Attempts that have been classified one way or another.
    pub fn settled(&self) -> u64 {
        self.retrieved + self.missing + self.failed
    }
}

/// Write-only accumulator shared by every job of one run.
///
/// Counters are atomics and the sets sit behind short mutex sections, so the
/// state is safe on a multi-threaded runtime. Nothing here is held across an
/// `.await`.
#[derive(Debug, Default)]
pub struct ReconciliationState {
    attempted: AtomicU64,
    retrieved: AtomicU64,
    missing: Mutex<BTreeSet<RecordId>>,
    failed: Mutex<BTreeMap<RecordId, FailureKind>>,
    abort_reason: Mutex<Option<String>>,
}

impl ReconciliationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_attempt(&self) {
        self.attempted.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_found(&self) {
        self.retrieved.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_missing(&self, id: RecordId) {
        lock(&self.missing).insert(id);
    }

    pub fn record_failure(&self, id: RecordId, kind: FailureKind) {
        lock(&self.failed).insert(id, kind);
    }

    /// Mark the run as aborted. Only the first reason is kept; returns `true`
    /// when this call tripped the state.
    pub fn trip_abort(&self, reason: String) -> bool {
        let mut slot = lock(&self.abort_reason);
        if slot.is_some() {
            return false;
        }
        *slot = Some(reason);
        true
    }

    pub fn abort_reason(&self) -> Option<String> {
        lock(&self.abort_reason).clone()
    }

    pub fn is_aborted(&self) -> bool {
        lock(&self.abort_reason).is_some()
    }

    pub fn counts(&self) -> ReconcileCounts {
        ReconcileCounts {
            attempted: self.attempted.load(Ordering::SeqCst),
            retrieved: self.retrieved.load(Ordering::SeqCst),
            missing: lock(&self.missing).len() as u64,
            failed: lock(&self.failed).len() as u64,
        }
    }

    pub fn missing_ids(&self) -> BTreeSet<RecordId> {
        lock(&self.missing).clone()
    }

    pub fn failures(&self) -> BTreeMap<RecordId, FailureKind> {
        lock(&self.failed).clone()
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Runs on the failure that aborts the batch. Failures racing on other
/// threads may each call it, so it must be idempotent.
pub type AbortHook = Arc<dyn Fn() + Send + Sync>;

/// Wraps the verification client and classifies each call into the state.
#[derive(Clone)]
pub struct Coordinator {
    client: Arc<dyn VerificationClient>,
    state: Arc<ReconciliationState>,
    policy: VerifyErrorPolicy,
    timeout: Option<Duration>,
    on_abort: Option<AbortHook>,
}

impl Coordinator {
    pub fn new(client: Arc<dyn VerificationClient>, state: Arc<ReconciliationState>) -> Self {
        Self {
            client,
            state,
            policy: VerifyErrorPolicy::default(),
            timeout: None,
            on_abort: None,
        }
    }

    pub fn with_policy(mut self, policy: VerifyErrorPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Bound each verification call. `None` waits forever.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Called before the state is tripped, so nothing admitted after the hook
    /// returns can observe a non-aborted batch.
    pub fn on_abort(mut self, hook: AbortHook) -> Self {
        self.on_abort = Some(hook);
        self
    }

    pub fn state(&self) -> &Arc<ReconciliationState> {
        &self.state
    }

    pub fn policy(&self) -> VerifyErrorPolicy {
        self.policy
    }

    /// Count an attempt, issue one verification call, classify the outcome.
    ///
    /// Calling this twice for the same id counts it twice.
    pub async fn verify_record(&self, record_id: RecordId) {
        self.state.record_attempt();
        self.classify(record_id).await;
    }

    /// Count an attempt now and return the job that performs the call.
    ///
    /// Use this when handing work to the scheduler so that queued jobs are
    /// already reflected in `attempted`.
    pub fn job(&self, record_id: RecordId) -> Job {
        self.state.record_attempt();
        let this = self.clone();
        Box::pin(async move { this.classify(record_id).await })
    }

    async fn classify(&self, record_id: RecordId) {
        let outcome = match self.timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, self.client.verify(&record_id)).await {
                    Ok(res) => res.map_err(FailureKind::Error),
                    Err(_) => Err(FailureKind::TimedOut(limit)),
                }
            }
            None => self
                .client
                .verify(&record_id)
                .await
                .map_err(FailureKind::Error),
        };

        match outcome {
            Ok(Presence::Found) => self.state.record_found(),
            Ok(Presence::NotFound { code, message }) => {
                debug!(record_id = %record_id, ?code, %message, "record not found");
                self.state.record_missing(record_id);
            }
            Err(kind) => {
                warn!(
                    record_id = %record_id,
                    client = self.client.name(),
                    error = %kind,
                    policy = self.policy.as_str(),
                    "verification failed"
                );
                let reason = format!("{record_id}: {kind}");
                self.state.record_failure(record_id, kind);
                if self.policy == VerifyErrorPolicy::Abort {
                    if !self.state.is_aborted() {
                        if let Some(hook) = &self.on_abort {
                            hook();
                        }
                    }
                    self.state.trip_abort(reason);
                }
            }
        }
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("client", &self.client.name())
            .field("policy", &self.policy)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VerifyError;
    use std::collections::HashMap;

    /// Answers from a fixed table; ids not in the table hang forever.
    struct TableClient {
        answers: HashMap<String, Result<Presence, VerifyError>>,
    }

    impl TableClient {
        fn new(rows: &[(&str, Result<Presence, VerifyError>)]) -> Arc<Self> {
            Arc::new(Self {
                answers: rows
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.clone()))
                    .collect(),
            })
        }
    }

    #[async_trait::async_trait]
    impl VerificationClient for TableClient {
        fn name(&self) -> &'static str {
            "table"
        }

        async fn connect(&self) -> Result<(), VerifyError> {
            Ok(())
        }

        async fn verify(&self, record_id: &RecordId) -> Result<Presence, VerifyError> {
            match self.answers.get(record_id.as_str()) {
                Some(a) => a.clone(),
                None => std::future::pending().await,
            }
        }

        async fn close(&self) -> Result<(), VerifyError> {
            Ok(())
        }
    }

    fn not_found() -> Result<Presence, VerifyError> {
        Ok(Presence::NotFound {
            code: Some(2),
            message: "No such mempool or blockchain transaction".to_string(),
        })
    }

    #[tokio::test]
    async fn found_and_not_found_are_classified() {
        let client = TableClient::new(&[("tx1", Ok(Presence::Found)), ("tx2", not_found())]);
        let state = Arc::new(ReconciliationState::new());
        let coord = Coordinator::new(client, Arc::clone(&state));

        coord.verify_record(RecordId::from("tx1")).await;
        coord.verify_record(RecordId::from("tx2")).await;

        let c = state.counts();
        assert_eq!(c.attempted, 2);
        assert_eq!(c.retrieved, 1);
        assert_eq!(c.missing, 1);
        assert_eq!(c.failed, 0);
        assert!(state.missing_ids().contains(&RecordId::from("tx2")));
    }

    #[tokio::test]
    async fn transport_error_is_recorded_as_failure_under_tolerate() {
        let client = TableClient::new(&[(
            "tx1",
            Err(VerifyError::Transport("connection reset".to_string())),
        )]);
        let state = Arc::new(ReconciliationState::new());
        let coord = Coordinator::new(client, Arc::clone(&state));

        coord.verify_record(RecordId::from("tx1")).await;

        let c = state.counts();
        assert_eq!((c.attempted, c.retrieved, c.missing, c.failed), (1, 0, 0, 1));
        assert!(!state.is_aborted());
        assert_eq!(
            state.failures().get(&RecordId::from("tx1")),
            Some(&FailureKind::Error(VerifyError::Transport(
                "connection reset".to_string()
            )))
        );
    }

    #[tokio::test]
    async fn abort_policy_trips_state_once() {
        let client = TableClient::new(&[
            ("tx1", Err(VerifyError::Decode("garbage".to_string()))),
            ("tx2", Err(VerifyError::Transport("eof".to_string()))),
        ]);
        let state = Arc::new(ReconciliationState::new());
        let coord =
            Coordinator::new(client, Arc::clone(&state)).with_policy(VerifyErrorPolicy::Abort);

        coord.verify_record(RecordId::from("tx1")).await;
        coord.verify_record(RecordId::from("tx2")).await;

        let reason = state.abort_reason().expect("abort must be tripped");
        assert!(reason.starts_with("tx1:"), "first failure wins, got {reason}");
        assert_eq!(state.counts().failed, 2);
    }

    #[tokio::test]
    async fn abort_hook_runs_before_the_state_trips() {
        let client = TableClient::new(&[
            ("tx1", Err(VerifyError::Transport("eof".to_string()))),
            ("tx2", Err(VerifyError::Transport("eof".to_string()))),
        ]);
        let state = Arc::new(ReconciliationState::new());
        let seen_aborted = Arc::new(Mutex::new(Vec::new()));
        let hook: AbortHook = {
            let state = Arc::clone(&state);
            let seen = Arc::clone(&seen_aborted);
            Arc::new(move || seen.lock().unwrap().push(state.is_aborted()))
        };
        let coord = Coordinator::new(client, Arc::clone(&state))
            .with_policy(VerifyErrorPolicy::Abort)
            .on_abort(hook);

        coord.verify_record(RecordId::from("tx1")).await;
        coord.verify_record(RecordId::from("tx2")).await;

        assert_eq!(*seen_aborted.lock().unwrap(), vec![false]);
        assert!(state.is_aborted());
    }

    #[tokio::test]
    async fn tolerate_never_calls_the_abort_hook() {
        let client = TableClient::new(&[(
            "tx1",
            Err(VerifyError::Transport("eof".to_string())),
        )]);
        let state = Arc::new(ReconciliationState::new());
        let calls = Arc::new(AtomicU64::new(0));
        let hook: AbortHook = {
            let calls = Arc::clone(&calls);
            Arc::new(move || {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        };
        let coord = Coordinator::new(client, Arc::clone(&state)).on_abort(hook);

        coord.verify_record(RecordId::from("tx1")).await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(state.counts().failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_call_times_out_into_failure() {
        let client = TableClient::new(&[]);
        let state = Arc::new(ReconciliationState::new());
        let coord = Coordinator::new(client, Arc::clone(&state))
            .with_timeout(Some(Duration::from_secs(30)));

        coord.verify_record(RecordId::from("hangs")).await;

        assert_eq!(
            state.failures().get(&RecordId::from("hangs")),
            Some(&FailureKind::TimedOut(Duration::from_secs(30)))
        );
    }

    #[tokio::test]
    async fn job_counts_attempt_before_it_runs() {
        let client = TableClient::new(&[("tx1", Ok(Presence::Found))]);
        let state = Arc::new(ReconciliationState::new());
        let coord = Coordinator::new(client, Arc::clone(&state));

        let job = coord.job(RecordId::from("tx1"));
        assert_eq!(state.counts().attempted, 1);
        assert_eq!(state.counts().retrieved, 0);

        job.await;
        assert_eq!(state.counts().retrieved, 1);
    }

    #[test]
    fn missing_fraction_never_divides_by_zero() {
        let c = ReconcileCounts::default();
        assert_eq!(c.missing_fraction(), 0.0);

        let c = ReconcileCounts {
            attempted: 3,
            retrieved: 0,
            missing: 3,
            failed: 0,
        };
        assert_eq!(c.missing_fraction(), 3.0);

        let c = ReconcileCounts {
            attempted: 5,
            retrieved: 4,
            missing: 1,
            failed: 0,
        };
        assert_eq!(c.missing_fraction(), 0.25);
    }

    #[test]
    fn policy_parse() {
        assert_eq!("abort".parse::<VerifyErrorPolicy>(), Ok(VerifyErrorPolicy::Abort));
        assert_eq!(
            " Tolerate ".parse::<VerifyErrorPolicy>(),
            Ok(VerifyErrorPolicy::Tolerate)
        );
        assert!("retry".parse::<VerifyErrorPolicy>().is_err());
    }
}

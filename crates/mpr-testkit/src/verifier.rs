//! Scripted in-process verification client.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use mpr_reconcile::{Presence, RecordId, VerificationClient, VerifyError};
use tokio::time::Instant;

/// What the fake answers for one record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FakeAnswer {
    Found,
    NotFound,
    Fail(VerifyError),
    /// Never answers.
    Hang,
}

/// One observed `verify` call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifyCall {
    pub record_id: RecordId,
    /// Time since the fake was built (tokio clock, so paused tests are exact).
    pub at: Duration,
}

/// Verification client with per-record scripted answers, fixed latency and
/// call bookkeeping (order, timing, peak concurrency, lifecycle counts).
#[derive(Debug)]
pub struct FakeVerifier {
    answers: HashMap<RecordId, FakeAnswer>,
    default_answer: FakeAnswer,
    latency: Duration,
    connect_error: Option<VerifyError>,
    epoch: Instant,

    connected: AtomicBool,
    connect_calls: AtomicUsize,
    close_calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    calls: Mutex<Vec<VerifyCall>>,
}

impl Default for FakeVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeVerifier {
    /// Answers `Found` for everything, instantly.
    pub fn new() -> Self {
        Self {
            answers: HashMap::new(),
            default_answer: FakeAnswer::Found,
            latency: Duration::ZERO,
            connect_error: None,
            epoch: Instant::now(),
            connected: AtomicBool::new(false),
            connect_calls: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn answer(mut self, id: &str, answer: FakeAnswer) -> Self {
        self.answers.insert(RecordId::from(id), answer);
        self
    }

    pub fn default_answer(mut self, answer: FakeAnswer) -> Self {
        self.default_answer = answer;
        self
    }

    /// Every call takes `latency` before answering.
    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn fail_connect(mut self, err: VerifyError) -> Self {
        self.connect_error = Some(err);
        self
    }

    pub fn calls(&self) -> Vec<VerifyCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Record ids in the order their calls started.
    pub fn call_order(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .map(|c| c.record_id.as_str().to_string())
            .collect()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Decrements the in-flight gauge even when the call future is dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl VerificationClient for FakeVerifier {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn connect(&self) -> Result<(), VerifyError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = &self.connect_error {
            return Err(err.clone());
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn verify(&self, record_id: &RecordId) -> Result<Presence, VerifyError> {
        if !self.is_connected() {
            return Err(VerifyError::NotConnected);
        }

        self.calls.lock().unwrap().push(VerifyCall {
            record_id: record_id.clone(),
            at: self.epoch.elapsed(),
        });
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _gauge = InFlight(&self.in_flight);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let answer = self
            .answers
            .get(record_id)
            .unwrap_or(&self.default_answer)
            .clone();
        match answer {
            FakeAnswer::Found => Ok(Presence::Found),
            FakeAnswer::NotFound => Ok(Presence::NotFound {
                code: Some(2),
                message: format!("No such mempool or blockchain transaction. {record_id}"),
            }),
            FakeAnswer::Fail(err) => Err(err),
            FakeAnswer::Hang => std::future::pending().await,
        }
    }

    async fn close(&self) -> Result<(), VerifyError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

//! Bounded-concurrency task scheduler.
//!
//! # Contract
//!
//! - [`TaskScheduler::submit`] never blocks. A job starts immediately when
//!   fewer than `limit` jobs are running, otherwise it joins the tail of the
//!   waiting queue.
//! - When a running job finishes (normally or by panicking) its slot is
//!   released and the head of the waiting queue is started. Waiting jobs start
//!   in strict submission order.
//! - The scheduler has no terminal "done" event. Batch completion is
//!   `running == 0 && waiting == 0`, observable through [`TaskScheduler::counts`]
//!   or the watch channel returned by [`TaskScheduler::subscribe`], which is
//!   updated on every transition.
//!
//! # Invariants
//!
//! - `running <= limit` at every observable point.
//! - After [`TaskScheduler::close`] nothing new is admitted: later submits are
//!   counted as cancelled and never run.
//! - A job is in exactly one of {waiting, running, completed/cancelled}.
//! - Bookkeeping is synchronous and never held across an `.await`.
//!
//! Jobs are expected to turn their own failures into a normal return before
//! handing control back (the reconciliation coordinator does this). Slot
//! release is still tied to a drop guard, so a panicking job cannot leak a
//! running-set entry.

use std::collections::{BTreeSet, VecDeque};
use std::future::Future;
use std::num::NonZeroUsize;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;
use tokio::sync::watch;

/// Default number of jobs allowed in flight.
pub const DEFAULT_CONCURRENCY_LIMIT: usize = 1000;

/// A unit of work the scheduler can run.
pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Point-in-time view of the scheduler. Best effort: no ordering guarantee
/// relative to submits racing on other threads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SchedulerCounts {
    pub running: usize,
    pub waiting: usize,
    /// Jobs ever submitted.
    pub submitted: u64,
    /// Jobs that ran to completion (including panics).
    pub completed: u64,
    /// Jobs dropped before or while running (`cancel_waiting`, `close`,
    /// submits refused after `close`, runtime shutdown).
    pub cancelled: u64,
}

impl SchedulerCounts {
    pub fn is_idle(&self) -> bool {
        self.running == 0 && self.waiting == 0
    }
}

struct Queued {
    seq: u64,
    job: Job,
}

struct SchedulerState {
    running: BTreeSet<u64>,
    waiting: VecDeque<Queued>,
    next_seq: u64,
    completed: u64,
    cancelled: u64,
    closed: bool,
}

impl SchedulerState {
    fn counts(&self) -> SchedulerCounts {
        SchedulerCounts {
            running: self.running.len(),
            waiting: self.waiting.len(),
            submitted: self.next_seq,
            completed: self.completed,
            cancelled: self.cancelled,
        }
    }
}

struct Shared {
    limit: NonZeroUsize,
    state: Mutex<SchedulerState>,
    counts_tx: watch::Sender<SchedulerCounts>,
    handle: Handle,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish while the state lock is held so observers see transitions in order.
    fn publish(&self, st: &SchedulerState) {
        self.counts_tx.send_replace(st.counts());
    }

    fn start(self: &Arc<Self>, queued: Queued) {
        let mut slot = Slot {
            shared: Arc::clone(self),
            seq: queued.seq,
            finished: false,
        };
        let job = queued.job;
        self.handle.spawn(async move {
            job.await;
            slot.finished = true;
        });
    }

    fn release(self: &Arc<Self>, seq: u64, admit_next: bool) {
        let next = {
            let mut st = self.lock();
            st.running.remove(&seq);
            let next = if admit_next {
                st.completed += 1;
                st.waiting.pop_front()
            } else {
                st.cancelled += 1;
                None
            };
            if let Some(q) = &next {
                st.running.insert(q.seq);
            }
            self.publish(&st);
            next
        };

        if let Some(q) = next {
            self.start(q);
        }
    }
}

/// Owns one running-set entry; releases it when the job's task ends.
struct Slot {
    shared: Arc<Shared>,
    seq: u64,
    finished: bool,
}

impl Drop for Slot {
    fn drop(&mut self) {
        // A task dropped without finishing or panicking was cancelled by the
        // runtime (shutdown). Release the slot but admit nothing new.
        let admit_next = self.finished || std::thread::panicking();
        self.shared.release(self.seq, admit_next);
    }
}

/// Runs submitted jobs with at most `limit` in flight; the rest wait FIFO.
///
/// Cheap to clone; clones share one running set and one waiting queue.
#[derive(Clone)]
pub struct TaskScheduler {
    shared: Arc<Shared>,
}

impl TaskScheduler {
    /// Build a scheduler that spawns its jobs on `handle`.
    pub fn new(limit: NonZeroUsize, handle: Handle) -> Self {
        let st = SchedulerState {
            running: BTreeSet::new(),
            waiting: VecDeque::new(),
            next_seq: 0,
            completed: 0,
            cancelled: 0,
            closed: false,
        };
        let (counts_tx, _rx) = watch::channel(st.counts());
        Self {
            shared: Arc::new(Shared {
                limit,
                state: Mutex::new(st),
                counts_tx,
                handle,
            }),
        }
    }

    pub fn limit(&self) -> usize {
        self.shared.limit.get()
    }

    /// Start `job` now if a slot is free, otherwise queue it. Never blocks.
    pub fn submit<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.submit_boxed(Box::pin(job));
    }

    /// Start `job` now if a slot is free, otherwise queue it. A closed
    /// scheduler drops the job and counts it as cancelled.
    pub fn submit_boxed(&self, job: Job) {
        let start_now = {
            let mut st = self.shared.lock();
            let seq = st.next_seq;
            st.next_seq += 1;
            if st.closed {
                st.cancelled += 1;
                self.shared.publish(&st);
                drop(st);
                drop(job);
                return;
            }
            let queued = Queued { seq, job };
            let start_now = if st.running.len() < self.shared.limit.get() {
                st.running.insert(seq);
                Some(queued)
            } else {
                st.waiting.push_back(queued);
                None
            };
            self.shared.publish(&st);
            start_now
        };

        if let Some(q) = start_now {
            self.shared.start(q);
        }
    }

    /// Drop every job that has not started yet. Running jobs are untouched.
    ///
    /// Returns how many jobs were dropped.
    pub fn cancel_waiting(&self) -> usize {
        let dropped: Vec<Queued> = {
            let mut st = self.shared.lock();
            let dropped: Vec<Queued> = st.waiting.drain(..).collect();
            st.cancelled += dropped.len() as u64;
            self.shared.publish(&st);
            dropped
        };
        // Job futures are dropped outside the lock.
        dropped.len()
    }

    /// Stop admitting work: drop every waiting job and refuse later submits.
    /// Running jobs are untouched and still release their slots.
    ///
    /// Returns how many waiting jobs were dropped. Idempotent.
    pub fn close(&self) -> usize {
        let dropped: Vec<Queued> = {
            let mut st = self.shared.lock();
            st.closed = true;
            let dropped: Vec<Queued> = st.waiting.drain(..).collect();
            st.cancelled += dropped.len() as u64;
            self.shared.publish(&st);
            dropped
        };
        dropped.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    pub fn running_count(&self) -> usize {
        self.shared.lock().running.len()
    }

    pub fn waiting_count(&self) -> usize {
        self.shared.lock().waiting.len()
    }

    pub fn counts(&self) -> SchedulerCounts {
        self.shared.lock().counts()
    }

    pub fn is_idle(&self) -> bool {
        self.counts().is_idle()
    }

    /// Receiver that observes a fresh [`SchedulerCounts`] after every transition.
    pub fn subscribe(&self) -> watch::Receiver<SchedulerCounts> {
        self.shared.counts_tx.subscribe()
    }
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("limit", &self.shared.limit)
            .field("counts", &self.counts())
            .finish()
    }
}

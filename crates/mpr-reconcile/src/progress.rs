//! Progress reporter: one line per interval while the scheduler is busy.
//!
//! The reporter never decides completion itself. It watches the scheduler and
//! returns as soon as nothing is running or waiting.

use std::fmt;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::info;

use crate::coordinator::{ReconcileCounts, ReconciliationState};
use crate::scheduler::{SchedulerCounts, TaskScheduler};

/// One progress line.
#[derive(Clone, Debug, PartialEq)]
pub struct ProgressSample {
    pub retrieved: u64,
    pub running: usize,
    pub waiting: usize,
    pub missing: u64,
    pub failed: u64,
    pub missing_fraction: f64,
}

impl ProgressSample {
    pub fn capture(counts: &ReconcileCounts, sched: &SchedulerCounts) -> Self {
        Self {
            retrieved: counts.retrieved,
            running: sched.running,
            waiting: sched.waiting,
            missing: counts.missing,
            failed: counts.failed,
            missing_fraction: counts.missing_fraction(),
        }
    }
}

impl fmt::Display for ProgressSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "retrieved={} pending={} missing={} failed={} ({:.8})",
            self.retrieved, self.waiting, self.missing, self.failed, self.missing_fraction
        )
    }
}

/// Log a sample through `tracing` at info level.
pub fn log_sample(sample: &ProgressSample) {
    info!(
        retrieved = sample.retrieved,
        running = sample.running,
        waiting = sample.waiting,
        missing = sample.missing,
        failed = sample.failed,
        missing_fraction = sample.missing_fraction,
        "{sample}"
    );
}

#[derive(Clone, Debug)]
pub struct ProgressReporter {
    interval: Duration,
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new(Self::DEFAULT_INTERVAL)
    }
}

impl ProgressReporter {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Emit a sample every interval until the scheduler is idle.
    ///
    /// The first sample comes one full interval after the call. Returns the
    /// number of samples emitted; an already idle scheduler returns `0`
    /// without waiting.
    pub async fn run<F>(
        &self,
        scheduler: &TaskScheduler,
        state: &ReconciliationState,
        mut emit: F,
    ) -> usize
    where
        F: FnMut(&ProgressSample),
    {
        let mut counts_rx = scheduler.subscribe();
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut emitted = 0;
        loop {
            if counts_rx.borrow_and_update().is_idle() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    let sample = ProgressSample::capture(&state.counts(), &scheduler.counts());
                    emit(&sample);
                    emitted += 1;
                }
                changed = counts_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        emitted
    }
}

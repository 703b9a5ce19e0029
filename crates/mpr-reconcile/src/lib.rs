//! mpr-reconcile
//!
//! Bounded-concurrency reconciliation engine.
//!
//! Architectural decisions:
//! - The authoritative snapshot is fetched once, before any verification
//! - One verification job per snapshot record, at most `limit` in flight
//! - Waiting jobs start in strict submission order
//! - Only a protocol-level "not found" answer marks a record missing
//! - Any other failure is classified explicitly, never dropped on the floor
//! - Missing records are reported oldest first
//!
//! No concrete network clients live here. Collaborators plug in through
//! [`SnapshotSource`] and [`VerificationClient`].

pub mod coordinator;
pub mod engine;
pub mod progress;
pub mod report;
pub mod scheduler;
mod types;

pub use coordinator::{
    AbortHook, Coordinator, ReconcileCounts, ReconciliationState, VerifyErrorPolicy,
};
pub use engine::{reconcile_snapshot, run_reconciliation, ReconcileError, RunOptions, RunSummary};
pub use progress::{log_sample, ProgressReporter, ProgressSample};
pub use report::{build_report, render_metadata, DiscrepancyLine, DiscrepancyReport, UnverifiedLine};
pub use scheduler::{Job, SchedulerCounts, TaskScheduler, DEFAULT_CONCURRENCY_LIMIT};
pub use types::*;

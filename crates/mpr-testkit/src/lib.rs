//! Shared fakes and fixtures for reconciliation scenario tests.
//!
//! Nothing here talks to a network. Production crates must not depend on this
//! crate outside `[dev-dependencies]`.

use std::fs;

use anyhow::{Context, Result};
use mpr_reconcile::{RecordMeta, Snapshot};

mod snapshot_source;
mod verifier;

pub use snapshot_source::FakeSnapshotSource;
pub use verifier::{FakeAnswer, FakeVerifier, VerifyCall};

/// Snapshot with one record per `(id, first_seen)` pair.
pub fn snapshot_of(rows: &[(&str, i64)]) -> Snapshot {
    let mut snap = Snapshot::empty();
    for (id, first_seen) in rows {
        snap.insert(*id, RecordMeta::at(*first_seen));
    }
    snap
}

/// `n` records named `tx0000`, `tx0001`, ... all first seen at `first_seen`.
pub fn numbered_snapshot(n: usize, first_seen: i64) -> Snapshot {
    let mut snap = Snapshot::empty();
    for i in 0..n {
        snap.insert(format!("tx{i:04}"), RecordMeta::at(first_seen));
    }
    snap
}

/// Load a `getrawmempool true` result object from a JSON fixture file.
pub fn load_snapshot_json(path: &str) -> Result<Snapshot> {
    let s = fs::read_to_string(path).with_context(|| format!("read snapshot: {path}"))?;
    let v: serde_json::Value = serde_json::from_str(&s).context("parse snapshot json")?;
    let snap = mpr_bitcoind::parse_verbose_mempool(v, 0).context("normalize snapshot json")?;
    Ok(snap)
}

use std::sync::atomic::{AtomicUsize, Ordering};

use mpr_reconcile::{Snapshot, SnapshotError, SnapshotSource};

/// Snapshot source that returns a canned result and counts fetches.
#[derive(Debug)]
pub struct FakeSnapshotSource {
    result: Result<Snapshot, SnapshotError>,
    fetches: AtomicUsize,
}

impl FakeSnapshotSource {
    pub fn returning(snapshot: Snapshot) -> Self {
        Self {
            result: Ok(snapshot),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn failing(err: SnapshotError) -> Self {
        Self {
            result: Err(err),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl SnapshotSource for FakeSnapshotSource {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn fetch_snapshot(&self) -> Result<Snapshot, SnapshotError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.result.clone()
    }
}

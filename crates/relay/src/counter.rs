use std::sync::atomic::{AtomicI64, Ordering};

/// Running count of impressions that have been accepted by ingestion but whose
/// flush has not resolved yet.
///
/// Shared between producers and workers behind an `Arc`. All operations are a
/// single atomic instruction, so they never block and additions from any
/// number of tasks commute.
#[derive(Debug, Default)]
pub struct FillCounter {
    size: AtomicI64,
}

impl FillCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `n` records. Negative values are corrective decrements.
    pub fn addition(&self, n: i64) {
        self.size.fetch_add(n, Ordering::AcqRel);
    }

    pub fn greater_than(&self, n: i64) -> bool {
        self.size.load(Ordering::Acquire) > n
    }

    pub fn reset(&self) {
        self.size.store(0, Ordering::Release);
    }

    pub fn value(&self) -> i64 {
        self.size.load(Ordering::Acquire)
    }
}

//! Clock abstraction.
//!
//! The id sequencer reads wall-clock time through [`Environment`] so tests can
//! drive it with [`ManualEnv`] instead of the system clock.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

/// Source of wall-clock time.
pub trait Environment: Clone + Send + Sync + 'static {
    /// Milliseconds since the Unix epoch.
    ///
    /// May go backwards (NTP adjustments); callers that need monotonic
    /// output must guard against it.
    fn wall_clock_millis(&self) -> u64;
}

/// Manually driven clock for tests.
///
/// Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualEnv {
    millis: Arc<AtomicU64>,
}

impl ManualEnv {
    /// Clock starting at `millis`.
    pub fn new(millis: u64) -> Self {
        Self { millis: Arc::new(AtomicU64::new(millis)) }
    }

    /// Set the current time (may move backwards).
    pub fn set(&self, millis: u64) {
        self.millis.store(millis, Ordering::SeqCst);
    }

    /// Move the clock forward.
    pub fn advance(&self, millis: u64) {
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Environment for ManualEnv {
    fn wall_clock_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}

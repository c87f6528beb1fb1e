//! Atomic counters for runtime observability.
//!
//! All counters use relaxed ordering: they are advisory, never used to
//! order anything.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Hot-path counts kept privately by each thread, so per-access
/// bookkeeping never touches shared cache lines. Folded into
/// [`RuntimeMetrics`] at thread exit and on demand.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AccessCounters {
    pub checked: u64,
    pub ignored: u64,
    pub out_of_range: u64,
    pub races_detected: u64,
    pub func_entries: u64,
}

/// Operation counters of one runtime instance. The access counters only
/// reflect what threads have folded in so far.
pub struct RuntimeMetrics {
    /// Granule pieces compared against shadow history.
    pub accesses_checked: AtomicU64,
    /// Accesses skipped by an ignore flag or while inside the runtime.
    pub accesses_ignored: AtomicU64,
    /// Granule pieces outside the application window.
    pub out_of_range: AtomicU64,
    /// Conflicting record pairs found, reported or not.
    pub races_detected: AtomicU64,
    /// Races delivered to the sink after deduplication.
    pub races_reported: AtomicU64,
    pub func_entries: AtomicU64,
    pub mutex_acquires: AtomicU64,
    pub mutex_releases: AtomicU64,
    pub threads_created: AtomicU64,
    pub threads_joined: AtomicU64,
    /// Misuse warnings emitted.
    pub warnings: AtomicU64,
}

impl RuntimeMetrics {
    /// Create a new zeroed metrics instance.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            accesses_checked: AtomicU64::new(0),
            accesses_ignored: AtomicU64::new(0),
            out_of_range: AtomicU64::new(0),
            races_detected: AtomicU64::new(0),
            races_reported: AtomicU64::new(0),
            func_entries: AtomicU64::new(0),
            mutex_acquires: AtomicU64::new(0),
            mutex_releases: AtomicU64::new(0),
            threads_created: AtomicU64::new(0),
            threads_joined: AtomicU64::new(0),
            warnings: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Fold a thread's private counts in and reset them.
    pub fn absorb(&self, counts: &mut AccessCounters) {
        let pairs = [
            (&self.accesses_checked, counts.checked),
            (&self.accesses_ignored, counts.ignored),
            (&self.out_of_range, counts.out_of_range),
            (&self.races_detected, counts.races_detected),
            (&self.func_entries, counts.func_entries),
        ];
        for (counter, n) in pairs {
            if n != 0 {
                Self::add(counter, n);
            }
        }
        *counts = AccessCounters::default();
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            accesses_checked: Self::get(&self.accesses_checked),
            accesses_ignored: Self::get(&self.accesses_ignored),
            out_of_range: Self::get(&self.out_of_range),
            races_detected: Self::get(&self.races_detected),
            races_reported: Self::get(&self.races_reported),
            func_entries: Self::get(&self.func_entries),
            mutex_acquires: Self::get(&self.mutex_acquires),
            mutex_releases: Self::get(&self.mutex_releases),
            threads_created: Self::get(&self.threads_created),
            threads_joined: Self::get(&self.threads_joined),
            warnings: Self::get(&self.warnings),
        }
    }
}

impl Default for RuntimeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub accesses_checked: u64,
    pub accesses_ignored: u64,
    pub out_of_range: u64,
    pub races_detected: u64,
    pub races_reported: u64,
    pub func_entries: u64,
    pub mutex_acquires: u64,
    pub mutex_releases: u64,
    pub threads_created: u64,
    pub threads_joined: u64,
    pub warnings: u64,
}

//! Fixed-capacity vector clocks.
//!
//! Entry `i` is the highest epoch of thread `i` that the owner has causally
//! observed. Capacity is [`MAX_THREADS`]: the platform limit on concurrently
//! live threads. Merge and comparison cost is constant (one pass over the
//! array) regardless of how many threads are live.

use std::fmt;

/// Thread identity. Unique among live threads, reused after retirement.
pub type Tid = u16;

/// Per-thread logical time.
pub type Epoch = u64;

/// Maximum number of concurrently live threads.
pub const MAX_THREADS: usize = 128;

/// Width of an epoch in a shadow record.
pub const EPOCH_BITS: u32 = 40;

/// Largest representable epoch. Reaching it is fatal.
pub const MAX_EPOCH: Epoch = (1 << EPOCH_BITS) - 1;

#[derive(Clone, PartialEq, Eq)]
pub struct VectorClock {
    clk: [Epoch; MAX_THREADS],
}

impl VectorClock {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            clk: [0; MAX_THREADS],
        }
    }

    #[inline]
    #[must_use]
    pub fn get(&self, tid: Tid) -> Epoch {
        self.clk[usize::from(tid)]
    }

    #[inline]
    pub fn set(&mut self, tid: Tid, epoch: Epoch) {
        self.clk[usize::from(tid)] = epoch;
    }

    /// Pointwise maximum with `other`.
    #[inline]
    pub fn merge(&mut self, other: &VectorClock) {
        for (mine, theirs) in self.clk.iter_mut().zip(other.clk.iter()) {
            if *theirs > *mine {
                *mine = *theirs;
            }
        }
    }

    /// True when every entry of `self` is `<=` the matching entry of `other`.
    #[must_use]
    pub fn le(&self, other: &VectorClock) -> bool {
        self.clk.iter().zip(other.clk.iter()).all(|(a, b)| a <= b)
    }

    /// Strict happens-before: `self <= other` and `self != other`.
    #[must_use]
    pub fn happens_before(&self, other: &VectorClock) -> bool {
        self.le(other) && self != other
    }

    /// Neither clock is ordered before the other.
    #[must_use]
    pub fn concurrent(&self, other: &VectorClock) -> bool {
        !self.le(other) && !other.le(self)
    }

    /// Zero every entry.
    pub fn reset(&mut self) {
        self.clk = [0; MAX_THREADS];
    }

    pub fn as_slice(&self) -> &[Epoch] {
        &self.clk
    }
}

impl Default for VectorClock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for VectorClock {
    // Print only the populated prefix; a full clock is 128 zeros.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let used = self
            .clk
            .iter()
            .rposition(|&e| e != 0)
            .map_or(0, |last| last + 1);
        f.debug_list().entries(&self.clk[..used]).finish()
    }
}

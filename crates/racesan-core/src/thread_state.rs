//! Per-thread detector state.
//!
//! One [`ThreadState`] exists per live instrumented thread and is owned
//! exclusively by it (the ABI layer keeps it in TLS). Nothing here is shared,
//! so no field needs synchronization.

use crate::error::RuntimeError;
use crate::metrics::AccessCounters;
use crate::vector_clock::{Epoch, MAX_EPOCH, Tid, VectorClock};

/// Capacity of the shadow call stack.
pub const MAX_STACK_DEPTH: usize = 64;

/// Bounded record of the pcs of active instrumented frames.
///
/// Frames pushed past capacity are counted but not stored, so entry/exit
/// pairs stay balanced at any depth.
#[derive(Clone)]
pub struct ShadowStack {
    frames: [usize; MAX_STACK_DEPTH],
    depth: usize,
}

impl ShadowStack {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            frames: [0; MAX_STACK_DEPTH],
            depth: 0,
        }
    }

    pub fn push(&mut self, pc: usize) {
        if self.depth < MAX_STACK_DEPTH {
            self.frames[self.depth] = pc;
        }
        self.depth += 1;
    }

    /// Pop the innermost frame. Returns false if the stack was empty.
    pub fn pop(&mut self) -> bool {
        if self.depth == 0 {
            return false;
        }
        self.depth -= 1;
        true
    }

    /// Logical depth, including frames that did not fit.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Stored frames, outermost first.
    #[must_use]
    pub fn frames(&self) -> &[usize] {
        &self.frames[..self.depth.min(MAX_STACK_DEPTH)]
    }
}

impl Default for ShadowStack {
    fn default() -> Self {
        Self::new()
    }
}

/// State of one instrumented thread.
///
/// Invariant: `clock[tid] == epoch`.
pub struct ThreadState {
    tid: Tid,
    epoch: Epoch,
    start_epoch: Epoch,
    clock: VectorClock,
    ignore_reads: u32,
    ignore_writes: u32,
    rand: u64,
    stack: ShadowStack,
    counters: AccessCounters,
}

impl ThreadState {
    /// State for thread `tid` starting at `start_epoch`, having already
    /// observed everything in `clock`.
    #[must_use]
    pub fn new(tid: Tid, start_epoch: Epoch, clock: VectorClock) -> Self {
        let mut clock = clock;
        clock.set(tid, start_epoch);
        Self {
            tid,
            epoch: start_epoch,
            start_epoch,
            clock,
            ignore_reads: 0,
            ignore_writes: 0,
            rand: seed_for(tid, start_epoch),
            stack: ShadowStack::new(),
            counters: AccessCounters::default(),
        }
    }

    #[inline]
    #[must_use]
    pub fn tid(&self) -> Tid {
        self.tid
    }

    #[inline]
    #[must_use]
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    #[must_use]
    pub fn start_epoch(&self) -> Epoch {
        self.start_epoch
    }

    #[inline]
    #[must_use]
    pub fn clock(&self) -> &VectorClock {
        &self.clock
    }

    /// Advance the epoch by one.
    pub fn tick(&mut self) -> Result<Epoch, RuntimeError> {
        if self.epoch >= MAX_EPOCH {
            return Err(RuntimeError::EpochOverflow { tid: self.tid });
        }
        self.epoch += 1;
        self.clock.set(self.tid, self.epoch);
        Ok(self.epoch)
    }

    /// Absorb everything `other` has observed.
    pub fn acquire(&mut self, other: &VectorClock) {
        self.clock.merge(other);
        crate::racesan_check!(self.clock.get(self.tid) == self.epoch);
    }

    pub fn ignore_reads_begin(&mut self) {
        self.ignore_reads += 1;
    }

    /// Returns false on an unbalanced end.
    pub fn ignore_reads_end(&mut self) -> bool {
        match self.ignore_reads.checked_sub(1) {
            Some(d) => {
                self.ignore_reads = d;
                true
            }
            None => false,
        }
    }

    pub fn ignore_writes_begin(&mut self) {
        self.ignore_writes += 1;
    }

    /// Returns false on an unbalanced end.
    pub fn ignore_writes_end(&mut self) -> bool {
        match self.ignore_writes.checked_sub(1) {
            Some(d) => {
                self.ignore_writes = d;
                true
            }
            None => false,
        }
    }

    #[inline]
    #[must_use]
    pub fn ignores(&self, is_write: bool) -> bool {
        if is_write {
            self.ignore_writes != 0
        } else {
            self.ignore_reads != 0
        }
    }

    /// Next value of the per-thread xorshift generator.
    pub fn next_rand(&mut self) -> u64 {
        let mut x = self.rand;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rand = x;
        x
    }

    pub fn stack(&self) -> &ShadowStack {
        &self.stack
    }

    pub(crate) fn stack_mut(&mut self) -> &mut ShadowStack {
        &mut self.stack
    }

    /// Counts not yet folded into the runtime metrics.
    #[must_use]
    pub fn counters(&self) -> AccessCounters {
        self.counters
    }

    pub(crate) fn counters_mut(&mut self) -> &mut AccessCounters {
        &mut self.counters
    }

    /// Final clock and epoch, consumed at thread exit.
    #[must_use]
    pub fn into_final(self) -> (Tid, Epoch, VectorClock) {
        (self.tid, self.epoch, self.clock)
    }
}

impl std::fmt::Debug for ThreadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadState")
            .field("tid", &self.tid)
            .field("epoch", &self.epoch)
            .field("clock", &self.clock)
            .field("ignore_reads", &self.ignore_reads)
            .field("ignore_writes", &self.ignore_writes)
            .field("stack_depth", &self.stack.depth())
            .finish_non_exhaustive()
    }
}

// splitmix64 finalizer; xorshift must never be seeded with zero.
fn seed_for(tid: Tid, epoch: Epoch) -> u64 {
    let mut z = ((u64::from(tid) << 40) | epoch).wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^= z >> 31;
    if z == 0 { 0x2545_f491_4f6c_dd1d } else { z }
}

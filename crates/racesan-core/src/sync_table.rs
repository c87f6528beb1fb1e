//! Shadow state of monitored mutexes, keyed by mutex address.
//!
//! Each entry carries the clock published by the latest release. Acquire
//! looks the entry up under the shared side of the table lock; release,
//! first-time acquire and destroy take the exclusive side.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::RuntimeError;
use crate::sync::SpinRwLock;
use crate::thread_state::ThreadState;
use crate::vector_clock::{Tid, VectorClock};

const NO_OWNER: u32 = 0;

/// Shadow of one mutex.
#[derive(Debug)]
pub struct SyncVar {
    /// What a later acquirer becomes ordered after.
    pub clock: VectorClock,
    // Holder bookkeeping, updated under the shared table lock.
    owner: AtomicU32,
    readers: AtomicU32,
}

impl SyncVar {
    fn new() -> Self {
        Self {
            clock: VectorClock::new(),
            owner: AtomicU32::new(NO_OWNER),
            readers: AtomicU32::new(0),
        }
    }

    fn note_acquire(&self, tid: Tid, exclusive: bool) {
        if exclusive {
            self.owner.store(u32::from(tid) + 1, Ordering::Relaxed);
        } else {
            self.readers.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Exclusive owner, if any.
    #[must_use]
    pub fn owner(&self) -> Option<Tid> {
        match self.owner.load(Ordering::Relaxed) {
            NO_OWNER => None,
            n => Some((n - 1) as Tid),
        }
    }

    #[must_use]
    pub fn readers(&self) -> u32 {
        self.readers.load(Ordering::Relaxed)
    }
}

/// All mutex shadows.
pub struct SyncTable {
    vars: SpinRwLock<HashMap<usize, SyncVar>>,
}

impl SyncTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            vars: SpinRwLock::new(HashMap::new()),
        }
    }

    /// Record an acquire of mutex `id` by `thr` and fold the mutex's
    /// release clock into the thread's clock.
    pub fn acquire(&self, id: usize, thr: &mut ThreadState, exclusive: bool) {
        {
            let vars = self.vars.read();
            if let Some(var) = vars.get(&id) {
                var.note_acquire(thr.tid(), exclusive);
                thr.acquire(&var.clock);
                return;
            }
        }
        // First sighting: nothing was ever released, so there is nothing to
        // merge. Create the entry so the matching release is recognized.
        let mut vars = self.vars.write();
        let var = vars.entry(id).or_insert_with(SyncVar::new);
        var.note_acquire(thr.tid(), exclusive);
        thr.acquire(&var.clock);
    }

    /// Publish `clock` on mutex `id`: replace the stored clock on exclusive
    /// release, merge into it on shared release.
    pub fn release(
        &self,
        id: usize,
        tid: Tid,
        exclusive: bool,
        clock: &VectorClock,
    ) -> Result<(), RuntimeError> {
        let mut vars = self.vars.write();
        let Some(var) = vars.get_mut(&id) else {
            return Err(RuntimeError::UnmatchedRelease { id, tid });
        };
        if exclusive {
            if var.owner() != Some(tid) {
                return Err(RuntimeError::UnmatchedRelease { id, tid });
            }
            var.owner.store(NO_OWNER, Ordering::Relaxed);
            var.clock.clone_from(clock);
        } else {
            if var.readers() == 0 {
                return Err(RuntimeError::UnmatchedRelease { id, tid });
            }
            var.readers.fetch_sub(1, Ordering::Relaxed);
            var.clock.merge(clock);
        }
        Ok(())
    }

    /// Forget mutex `id`. Returns whether it was known.
    pub fn destroy(&self, id: usize) -> bool {
        self.vars.write().remove(&id).is_some()
    }

    /// Copy of the clock stored for `id`.
    #[must_use]
    pub fn clock_of(&self, id: usize) -> Option<VectorClock> {
        self.vars.read().get(&id).map(|v| v.clock.clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.vars.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SyncTable {
    fn default() -> Self {
        Self::new()
    }
}

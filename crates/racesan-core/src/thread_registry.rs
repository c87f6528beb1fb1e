//! Registry of thread contexts and the identity reuse pool.
//!
//! Each identity owns one [`ThreadContext`] for the life of the process. The
//! context outlives its holders: it remembers the final epoch of the last
//! retired holder so the next one can start strictly after it. Every record
//! the old holder left in shadow memory then carries an epoch below the new
//! holder's clock entry, and any clock that has learned about the new holder
//! covers all of them.
//!
//! Retired identities go to the back of a FIFO pool and are handed out again
//! oldest-first, before any fresh identity is minted. Allocation, retirement
//! and status changes happen under the internal lock; none of it is on the
//! access hot path.

use std::collections::VecDeque;

use serde::Serialize;

use crate::error::RuntimeError;
use crate::sync::SpinRwLock;
use crate::vector_clock::{Epoch, MAX_THREADS, Tid, VectorClock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ThreadStatus {
    /// Identity is free (never used or retired).
    Uncreated,
    /// Allocated by the parent; the thread has not started yet.
    Created,
    Running,
    /// Exited; waiting to be joined unless detached.
    Finished,
}

/// Registry entry for one identity.
#[derive(Debug, Clone)]
pub struct ThreadContext {
    pub tid: Tid,
    pub status: ThreadStatus,
    pub detached: bool,
    /// First epoch of the current holder.
    pub start_epoch: Epoch,
    /// Final epoch of the latest holder to finish.
    pub final_epoch: Epoch,
    /// Parent's clock at create, then the thread's final clock at finish.
    pub sync: VectorClock,
}

impl ThreadContext {
    fn new(tid: Tid) -> Self {
        Self {
            tid,
            status: ThreadStatus::Uncreated,
            detached: false,
            start_epoch: 0,
            final_epoch: 0,
            sync: VectorClock::new(),
        }
    }

    fn expect(&self, expected: ThreadStatus) -> Result<(), RuntimeError> {
        if self.status == expected {
            Ok(())
        } else {
            Err(RuntimeError::BadThreadState {
                tid: self.tid,
                found: self.status,
                expected,
            })
        }
    }
}

struct RegistryInner {
    contexts: Vec<ThreadContext>,
    free: VecDeque<Tid>,
    live: usize,
    total_created: u64,
}

impl RegistryInner {
    fn allocate(&mut self) -> Result<Tid, RuntimeError> {
        if let Some(tid) = self.free.pop_front() {
            return Ok(tid);
        }
        if self.contexts.len() == MAX_THREADS {
            return Err(RuntimeError::ThreadLimit { limit: MAX_THREADS });
        }
        let tid = self.contexts.len() as Tid;
        self.contexts.push(ThreadContext::new(tid));
        Ok(tid)
    }

    fn context_mut(&mut self, tid: Tid) -> Result<&mut ThreadContext, RuntimeError> {
        self.contexts
            .get_mut(usize::from(tid))
            .ok_or(RuntimeError::UnknownThread { tid })
    }

    fn retire(&mut self, tid: Tid) {
        let ctx = &mut self.contexts[usize::from(tid)];
        ctx.status = ThreadStatus::Uncreated;
        ctx.detached = false;
        ctx.sync.reset();
        self.free.push_back(tid);
        self.live -= 1;
    }
}

/// All thread contexts, behind the internal lock.
pub struct ThreadRegistry {
    inner: SpinRwLock<RegistryInner>,
}

impl ThreadRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: SpinRwLock::new(RegistryInner {
                contexts: Vec::with_capacity(MAX_THREADS),
                free: VecDeque::with_capacity(MAX_THREADS),
                live: 0,
                total_created: 0,
            }),
        }
    }

    /// Allocate an identity for a new thread and publish `parent_clock` as
    /// what the child starts out having observed. Returns the identity and
    /// the epoch the child will start at.
    pub fn create(&self, parent_clock: &VectorClock) -> Result<(Tid, Epoch), RuntimeError> {
        let mut inner = self.inner.write();
        let tid = inner.allocate()?;
        inner.live += 1;
        inner.total_created += 1;
        let ctx = &mut inner.contexts[usize::from(tid)];
        ctx.status = ThreadStatus::Created;
        ctx.detached = false;
        ctx.start_epoch = ctx.final_epoch + 1;
        ctx.sync.clone_from(parent_clock);
        Ok((tid, ctx.start_epoch))
    }

    /// Move a created thread to running. Returns its starting epoch and the
    /// clock published by its parent.
    pub fn start(&self, tid: Tid) -> Result<(Epoch, VectorClock), RuntimeError> {
        let mut inner = self.inner.write();
        let ctx = inner.context_mut(tid)?;
        ctx.expect(ThreadStatus::Created)?;
        ctx.status = ThreadStatus::Running;
        Ok((ctx.start_epoch, ctx.sync.clone()))
    }

    /// Allocate and start in one step, for threads nobody created through the
    /// hooks (the main thread).
    pub fn register_running(&self) -> Result<(Tid, Epoch), RuntimeError> {
        let (tid, epoch) = self.create(&VectorClock::new())?;
        self.start(tid)?;
        Ok((tid, epoch))
    }

    /// Publish a running thread's final clock. A detached thread is retired
    /// on the spot.
    pub fn finish(&self, tid: Tid, epoch: Epoch, clock: &VectorClock) -> Result<(), RuntimeError> {
        let mut inner = self.inner.write();
        let ctx = inner.context_mut(tid)?;
        ctx.expect(ThreadStatus::Running)?;
        ctx.status = ThreadStatus::Finished;
        ctx.final_epoch = epoch;
        ctx.sync.clone_from(clock);
        if ctx.detached {
            inner.retire(tid);
        }
        Ok(())
    }

    /// Take a finished thread's final clock and retire its identity.
    pub fn join(&self, tid: Tid) -> Result<VectorClock, RuntimeError> {
        let mut inner = self.inner.write();
        let ctx = inner.context_mut(tid)?;
        ctx.expect(ThreadStatus::Finished)?;
        let clock = ctx.sync.clone();
        inner.retire(tid);
        Ok(clock)
    }

    /// Retire `tid` now if it already finished, otherwise when it does.
    pub fn detach(&self, tid: Tid) -> Result<(), RuntimeError> {
        let mut inner = self.inner.write();
        let ctx = inner.context_mut(tid)?;
        match (ctx.status, ctx.detached) {
            (ThreadStatus::Finished, _) => {
                inner.retire(tid);
                Ok(())
            }
            (ThreadStatus::Created | ThreadStatus::Running, false) => {
                ctx.detached = true;
                Ok(())
            }
            (ThreadStatus::Created | ThreadStatus::Running, true) => {
                Err(RuntimeError::AlreadyDetached { tid })
            }
            (found, _) => Err(RuntimeError::BadThreadState {
                tid,
                found,
                expected: ThreadStatus::Running,
            }),
        }
    }

    #[must_use]
    pub fn status(&self, tid: Tid) -> ThreadStatus {
        self.inner
            .read()
            .contexts
            .get(usize::from(tid))
            .map_or(ThreadStatus::Uncreated, |ctx| ctx.status)
    }

    /// Snapshot of one context.
    #[must_use]
    pub fn context(&self, tid: Tid) -> Option<ThreadContext> {
        self.inner.read().contexts.get(usize::from(tid)).cloned()
    }

    /// Identities currently allocated (created and not yet retired).
    #[must_use]
    pub fn live_threads(&self) -> usize {
        self.inner.read().live
    }

    #[must_use]
    pub fn total_created(&self) -> u64 {
        self.inner.read().total_created
    }
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

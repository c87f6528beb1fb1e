//! Runtime-internal reader/writer spin lock.
//!
//! Protects metadata shared across threads (thread registry, mutex shadow
//! table, report dedup set). It never parks on a futex or any other OS
//! primitive: the runtime observes the program's own synchronization, and
//! blocking on it from inside the runtime would reenter what we observe.
//!
//! Lock word: bit 0 = writer held, bits 1.. = reader count.
//!
//! Policy is reader-preferring: a new reader enters whenever no writer holds
//! the lock, even if a writer is spinning. Writers can starve under
//! continuous read traffic. Recursive exclusive locking deadlocks.
//!
//! The raw lock plugs into `lock_api`, so callers get the usual RAII guards
//! that release on every exit path, unwinding included.

#![allow(unsafe_code)]

use std::hint;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::lock_api::{self, GuardSend, RawRwLock};

use crate::platform;

const WRITER: usize = 1;
const READER: usize = 2;

/// Busy-wait iterations between processor yields.
const ACTIVE_SPIN: u32 = 64;

/// Spin-based raw reader/writer lock.
pub struct RawSpinRwLock {
    state: AtomicUsize,
}

impl RawSpinRwLock {
    /// Current raw lock word (for diagnostics and tests).
    #[must_use]
    pub fn raw_state(&self) -> usize {
        self.state.load(Ordering::Relaxed)
    }
}

/// Spin, then yield, until `attempt` succeeds.
#[inline]
fn spin_until(mut attempt: impl FnMut() -> bool) {
    loop {
        for _ in 0..ACTIVE_SPIN {
            if attempt() {
                return;
            }
            hint::spin_loop();
        }
        platform::yield_processor();
    }
}

// SAFETY: exclusive holders are mutually excluded by the WRITER bit CAS;
// readers only enter while the WRITER bit is clear and the writer only enters
// when the whole word is zero. Acquire/Release orderings publish protected
// data between holders.
unsafe impl RawRwLock for RawSpinRwLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        state: AtomicUsize::new(0),
    };

    type GuardMarker = GuardSend;

    fn lock_shared(&self) {
        if self.try_lock_shared() {
            return;
        }
        spin_until(|| self.try_lock_shared());
    }

    fn try_lock_shared(&self) -> bool {
        let prev = self.state.fetch_add(READER, Ordering::Acquire);
        if prev & WRITER == 0 {
            return true;
        }
        self.state.fetch_sub(READER, Ordering::Relaxed);
        false
    }

    unsafe fn unlock_shared(&self) {
        let prev = self.state.fetch_sub(READER, Ordering::Release);
        debug_assert!(prev >= READER, "unlock_shared without a reader");
    }

    fn lock_exclusive(&self) {
        if self.try_lock_exclusive() {
            return;
        }
        spin_until(|| {
            self.state.load(Ordering::Relaxed) == 0 && self.try_lock_exclusive()
        });
    }

    fn try_lock_exclusive(&self) -> bool {
        self.state
            .compare_exchange(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    unsafe fn unlock_exclusive(&self) {
        let prev = self.state.fetch_and(!WRITER, Ordering::Release);
        debug_assert!(prev & WRITER != 0, "unlock_exclusive without the writer");
    }

    fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) != 0
    }

    fn is_locked_exclusive(&self) -> bool {
        self.state.load(Ordering::Relaxed) & WRITER != 0
    }
}

/// Internal reader/writer lock around `T`.
pub type SpinRwLock<T> = lock_api::RwLock<RawSpinRwLock, T>;
/// Scoped exclusive holder; released on drop.
pub type SpinWriteGuard<'a, T> = lock_api::RwLockWriteGuard<'a, RawSpinRwLock, T>;
/// Scoped shared holder; released on drop.
pub type SpinReadGuard<'a, T> = lock_api::RwLockReadGuard<'a, RawSpinRwLock, T>;

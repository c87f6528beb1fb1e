//! Bridge from hook entrypoints to the engine.
//!
//! Every hook needs two things: the process-wide [`Runtime`] and the calling
//! thread's [`ThreadState`]. The runtime is initialized lazily by the first
//! hook. Thread state lives in a thread-local slot that `thread_start`
//! fills and `thread_finish` empties; the first thread to reach any hook is
//! adopted as the main thread.

use std::cell::RefCell;
use std::ffi::c_int;
use std::sync::atomic::{AtomicBool, Ordering};

use racesan_core::{Runtime, RuntimeError, ThreadState, Tid, init};

thread_local! {
    static CURRENT: RefCell<Option<Box<ThreadState>>> = const { RefCell::new(None) };
}

static MAIN_ADOPTED: AtomicBool = AtomicBool::new(false);

/// The global runtime, initializing it on first use. `None` while another
/// thread (or this one, reentrantly) is still initializing.
#[inline]
pub(crate) fn runtime() -> Option<&'static Runtime> {
    init::initialize()
}

/// Run `f` with the runtime and the calling thread's state.
///
/// Returns `None` without calling `f` when the runtime is not ready, when the
/// thread was never announced, while thread-local storage is being torn down,
/// or when a hook reenters from inside another hook on the same thread.
pub(crate) fn with_thread<R>(f: impl FnOnce(&'static Runtime, &mut ThreadState) -> R) -> Option<R> {
    let rt = runtime()?;
    CURRENT
        .try_with(|slot| {
            let mut slot = slot.try_borrow_mut().ok()?;
            if slot.is_none() {
                *slot = Some(Box::new(adopt_unannounced(rt)?));
            }
            slot.as_deref_mut().map(|thr| f(rt, thr))
        })
        .ok()
        .flatten()
}

/// Install the state of a freshly started thread.
pub(crate) fn install(thr: ThreadState) {
    let tid = thr.tid();
    let _ = CURRENT.try_with(|slot| {
        if let Ok(mut slot) = slot.try_borrow_mut() {
            if let Some(old) = slot.replace(Box::new(thr)) {
                racesan_core::dprintf!("racesan: T{tid} started over live state of T{}", old.tid());
            }
        }
    });
}

/// Remove the calling thread's state, if any.
pub(crate) fn take() -> Option<ThreadState> {
    CURRENT
        .try_with(|slot| slot.try_borrow_mut().ok()?.take().map(|b| *b))
        .ok()
        .flatten()
}

/// Only the first thread may show up without `thread_start`: it is the main
/// thread. Later strangers are ignored since their creator is unknown.
fn adopt_unannounced(rt: &Runtime) -> Option<ThreadState> {
    if MAIN_ADOPTED
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
        .is_ok()
    {
        return rt.settle(rt.bootstrap_main_thread());
    }
    racesan_core::dprintf!("racesan: hook on a thread that was never started, ignored");
    None
}

/// Thread id as passed across the C boundary.
pub(crate) fn to_tid(raw: c_int) -> Result<Tid, RuntimeError> {
    Tid::try_from(raw).map_err(|_| RuntimeError::InvalidThreadId { raw: i64::from(raw) })
}

//! One-time initialization of the process-wide runtime.
//!
//! A plain atomic state machine (UNINIT -> INITIALIZING -> READY) guards the
//! global instance instead of `OnceLock`: `OnceLock` parks waiters on a
//! futex, and a hook arriving on the initializing thread itself would then
//! deadlock. Here any caller that sees INITIALIZING gets `None` and the hook
//! does nothing.

#![allow(unsafe_code)]

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

use crate::config::RuntimeConfig;
use crate::error;
use crate::in_rtl::ScopedInRtl;
use crate::platform::output;
use crate::report::{ReportSink, StderrSink};
use crate::rtl::Runtime;

const STATE_UNINIT: u8 = 0;
const STATE_INITIALIZING: u8 = 1;
const STATE_READY: u8 = 2;

static STATE: AtomicU8 = AtomicU8::new(STATE_UNINIT);
static RUNTIME: AtomicPtr<Runtime> = AtomicPtr::new(ptr::null_mut());

/// The global runtime, once initialization has completed.
#[inline]
#[must_use]
pub fn runtime() -> Option<&'static Runtime> {
    if STATE.load(Ordering::Acquire) != STATE_READY {
        return None;
    }
    let p = RUNTIME.load(Ordering::Acquire);
    // SAFETY: READY is published after RUNTIME holds a leaked Box that is
    // never freed or replaced.
    Some(unsafe { &*p })
}

#[must_use]
pub fn is_initialized() -> bool {
    STATE.load(Ordering::Acquire) == STATE_READY
}

/// Initialize from the environment, reporting races on stderr.
pub fn initialize() -> Option<&'static Runtime> {
    initialize_with(RuntimeConfig::from_env, || Box::new(StderrSink))
}

/// Initialize with an explicit configuration and sink. Idempotent: later
/// calls return the existing runtime and ignore their arguments. Returns
/// `None` while another call is still initializing. Any failure is fatal.
pub fn initialize_with(
    config: impl FnOnce() -> RuntimeConfig,
    sink: impl FnOnce() -> Box<dyn ReportSink>,
) -> Option<&'static Runtime> {
    if let Some(rt) = runtime() {
        return Some(rt);
    }
    if STATE
        .compare_exchange(
            STATE_UNINIT,
            STATE_INITIALIZING,
            Ordering::SeqCst,
            Ordering::Relaxed,
        )
        .is_err()
    {
        // Lost the race or reentered. READY may have landed meanwhile.
        return runtime();
    }

    let _in_rtl = ScopedInRtl::new();
    let config = config();
    output::set_verbosity(config.verbosity);
    let rt = Runtime::with_sink(config, sink()).unwrap_or_else(|e| error::fatal(e));
    if rt.config().verbosity >= 1 {
        let l = rt.layout();
        crate::printf!(
            "racesan: {:?} shadow [{:#x}, {:#x}) for app [{:#x}, {:#x})",
            rt.config().shadow,
            l.shadow_beg,
            l.shadow_end,
            l.app_beg,
            l.app_end
        );
    }
    let p = Box::into_raw(Box::new(rt));
    RUNTIME.store(p, Ordering::Release);
    STATE.store(STATE_READY, Ordering::Release);
    runtime()
}

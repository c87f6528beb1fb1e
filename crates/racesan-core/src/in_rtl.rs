//! Internal-call accounting.
//!
//! Any runtime routine that can itself trigger monitored work (diagnostics,
//! syscalls, address-space reservation) runs under a [`ScopedInRtl`] guard.
//! While the per-thread depth is nonzero the engine skips race checking for
//! that thread, and `errno` is restored on exit so the program never sees the
//! runtime's own failures.

#![allow(unsafe_code)]

use std::cell::Cell;
use std::ffi::c_int;
use std::marker::PhantomData;

thread_local! {
    // `const` init: no lazy registration and no destructor, so the counter is
    // reachable even while the thread's TLS is being torn down.
    static IN_RTL: Cell<u32> = const { Cell::new(0) };
}

/// Current nesting depth of runtime-internal calls on this thread.
#[inline]
#[must_use]
pub fn depth() -> u32 {
    IN_RTL.try_with(Cell::get).unwrap_or(1)
}

/// True while the calling thread is executing runtime-internal code.
#[inline]
#[must_use]
pub fn in_rtl() -> bool {
    depth() != 0
}

/// Scoped marker for runtime-internal work.
///
/// Not `Send`: the guard must be dropped on the thread that created it.
pub struct ScopedInRtl {
    saved_errno: c_int,
    _not_send: PhantomData<*const ()>,
}

impl ScopedInRtl {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let _ = IN_RTL.try_with(|d| d.set(d.get() + 1));
        Self {
            saved_errno: errno(),
            _not_send: PhantomData,
        }
    }
}

impl Default for ScopedInRtl {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ScopedInRtl {
    #[inline]
    fn drop(&mut self) {
        set_errno(self.saved_errno);
        let _ = IN_RTL.try_with(|d| d.set(d.get().saturating_sub(1)));
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
#[inline]
fn errno_location() -> *mut c_int {
    // SAFETY: libc returns the calling thread's errno slot; always valid.
    unsafe { libc::__errno_location() }
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
#[inline]
fn errno_location() -> *mut c_int {
    // SAFETY: libc returns the calling thread's errno slot; always valid.
    unsafe { libc::__error() }
}

/// Read the calling thread's `errno`.
#[inline]
#[must_use]
pub fn errno() -> c_int {
    // SAFETY: pointer comes from `errno_location` and is thread-local.
    unsafe { *errno_location() }
}

/// Overwrite the calling thread's `errno`.
#[inline]
pub fn set_errno(value: c_int) {
    // SAFETY: pointer comes from `errno_location` and is thread-local.
    unsafe { *errno_location() = value };
}

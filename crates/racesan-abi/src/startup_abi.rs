//! Process start and exit hooks.

use std::ffi::c_int;

use crate::macros::hook_fn;
use crate::runtime_bridge;

hook_fn! {
    /// Initialize the runtime and adopt the calling thread as the main
    /// thread. Optional: the first hook of any kind does the same.
    fn __racesan_init() {
        runtime_bridge::with_thread(|_, _| ());
    }
}

hook_fn! {
    /// Print the summary and return the exit status the program should use:
    /// 66 if any race was reported, 0 otherwise. The calling thread's access
    /// counts are folded in first; threads still running keep theirs.
    fn __racesan_fini() -> c_int {
        runtime_bridge::with_thread(|rt, thr| rt.flush_counters(thr));
        runtime_bridge::runtime().map_or(0, |rt| rt.finalize())
    }
}

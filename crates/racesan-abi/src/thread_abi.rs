//! Thread lifecycle hooks.
//!
//! The creating thread calls `__racesan_thread_create` before it spawns and
//! hands the returned id to the child, which calls `__racesan_thread_start`
//! first thing and `__racesan_thread_finish` last thing. A joiner calls
//! `__racesan_thread_join` after the OS join returns.

use std::ffi::c_int;

use crate::macros::hook_fn;
use crate::runtime_bridge::{self, to_tid, with_thread};

hook_fn! {
    /// Allocate an identity for a thread about to be spawned. Returns -1 if
    /// the calling thread is not tracked.
    fn __racesan_thread_create() -> c_int {
        with_thread(|rt, parent| rt.settle(rt.thread_create(parent)))
            .flatten()
            .map_or(-1, c_int::from)
    }
}

hook_fn! {
    fn __racesan_thread_start(tid: c_int) {
        let Some(rt) = runtime_bridge::runtime() else {
            return;
        };
        let Some(tid) = rt.settle(to_tid(tid)) else {
            return;
        };
        if let Some(thr) = rt.settle(rt.thread_start(tid)) {
            runtime_bridge::install(thr);
        }
    }
}

hook_fn! {
    fn __racesan_thread_finish() {
        let Some(rt) = runtime_bridge::runtime() else {
            return;
        };
        if let Some(thr) = runtime_bridge::take() {
            rt.settle(rt.thread_finish(thr));
        }
    }
}

hook_fn! {
    fn __racesan_thread_join(tid: c_int) {
        with_thread(|rt, thr| {
            let tid = rt.settle(to_tid(tid))?;
            rt.settle(rt.thread_join(thr, tid))
        });
    }
}

hook_fn! {
    fn __racesan_thread_detach(tid: c_int) {
        with_thread(|rt, thr| {
            let tid = rt.settle(to_tid(tid))?;
            rt.settle(rt.thread_detach(thr, tid))
        });
    }
}

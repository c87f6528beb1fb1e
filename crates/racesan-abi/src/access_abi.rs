//! Memory access, function boundary and ignore-annotation hooks.
//!
//! These run on every instrumented load, store, call and return, so they do
//! no work beyond finding the thread state and calling into the engine.

use crate::macros::hook_fn;
use crate::runtime_bridge::with_thread;

hook_fn! {
    /// Access of `size` bytes at `addr`, of any size or alignment.
    fn __racesan_memory_access(pc: usize, addr: usize, size: usize, is_write: bool) {
        with_thread(|rt, thr| rt.on_memory_access(thr, pc, addr, size, is_write));
    }
}

macro_rules! sized_access {
    ($($name:ident => $size:literal, $is_write:literal;)*) => {
        $(
            hook_fn! {
                fn $name(pc: usize, addr: usize) {
                    with_thread(|rt, thr| rt.on_memory_access(thr, pc, addr, $size, $is_write));
                }
            }
        )*
    };
}

sized_access! {
    __racesan_read1 => 1, false;
    __racesan_read2 => 2, false;
    __racesan_read4 => 4, false;
    __racesan_read8 => 8, false;
    __racesan_write1 => 1, true;
    __racesan_write2 => 2, true;
    __racesan_write4 => 4, true;
    __racesan_write8 => 8, true;
}

hook_fn! {
    fn __racesan_func_entry(pc: usize) {
        with_thread(|rt, thr| rt.settle(rt.on_function_entry(thr, pc)));
    }
}

hook_fn! {
    fn __racesan_func_exit() {
        with_thread(|rt, thr| rt.settle(rt.on_function_exit(thr)));
    }
}

hook_fn! {
    /// Stop checking reads on this thread until the matching end. Nests.
    fn __racesan_ignore_reads_begin() {
        with_thread(|rt, thr| rt.ignore_reads_begin(thr));
    }
}

hook_fn! {
    fn __racesan_ignore_reads_end() {
        with_thread(|rt, thr| rt.settle(rt.ignore_reads_end(thr)));
    }
}

hook_fn! {
    /// Stop checking writes on this thread until the matching end. Nests.
    fn __racesan_ignore_writes_begin() {
        with_thread(|rt, thr| rt.ignore_writes_begin(thr));
    }
}

hook_fn! {
    fn __racesan_ignore_writes_end() {
        with_thread(|rt, thr| rt.settle(rt.ignore_writes_end(thr)));
    }
}

//! Mutex hooks. `id` is any address-sized value naming the lock, normally
//! the lock's own address.

use crate::macros::hook_fn;
use crate::runtime_bridge::{self, with_thread};

hook_fn! {
    /// Call after the lock is taken.
    fn __racesan_mutex_acquire(id: usize, exclusive: bool) {
        with_thread(|rt, thr| rt.on_mutex_acquire(thr, id, exclusive));
    }
}

hook_fn! {
    /// Call before the lock is released.
    fn __racesan_mutex_release(id: usize, exclusive: bool) {
        with_thread(|rt, thr| rt.settle(rt.on_mutex_release(thr, id, exclusive)));
    }
}

hook_fn! {
    fn __racesan_mutex_destroy(id: usize) {
        if let Some(rt) = runtime_bridge::runtime() {
            rt.on_mutex_destroy(id);
        }
    }
}

//! Misuse through the hooks warns and carries on; strangers are ignored.

use std::thread;

use racesan_abi::access_abi::{
    __racesan_func_exit, __racesan_ignore_reads_end, __racesan_ignore_writes_begin,
    __racesan_ignore_writes_end, __racesan_write8,
};
use racesan_abi::startup_abi::{__racesan_fini, __racesan_init};
use racesan_abi::sync_abi::{__racesan_mutex_destroy, __racesan_mutex_release};
use racesan_abi::thread_abi::{
    __racesan_thread_create, __racesan_thread_detach, __racesan_thread_finish,
    __racesan_thread_join, __racesan_thread_start,
};
use racesan_core::platform::PAGE_SIZE;
use racesan_core::{CollectingSink, RuntimeConfig, ThreadStatus, Tid, init};

const APP: usize = 0x7e00_0000_0000;
const M: usize = 0x5555_0000_3000;

#[test]
fn misuse_is_warned_and_ignored() {
    let rt = init::initialize_with(
        || RuntimeConfig::relocatable(APP, APP + 4 * PAGE_SIZE),
        || Box::new(CollectingSink::new()),
    )
    .expect("runtime");
    __racesan_init();

    __racesan_mutex_release(M, true);
    __racesan_thread_join(999);
    __racesan_thread_join(-1);
    __racesan_thread_start(70_000);
    __racesan_func_exit();
    __racesan_ignore_reads_end();
    assert_eq!(rt.metrics().snapshot().warnings, 6);

    // Suppressed writes are not checked.
    __racesan_ignore_writes_begin();
    __racesan_write8(0x10, APP);
    __racesan_ignore_writes_end();
    // fini folds this thread's access counts into the metrics.
    assert_eq!(__racesan_fini(), 0);
    let snap = rt.metrics().snapshot();
    assert_eq!(snap.accesses_checked, 0);
    assert_eq!(snap.accesses_ignored, 1);

    // Detach before the thread runs; it retires itself on finish.
    let tid = __racesan_thread_create();
    assert!(tid > 0);
    __racesan_thread_detach(tid);
    __racesan_thread_detach(tid);
    assert_eq!(rt.metrics().snapshot().warnings, 7);
    thread::spawn(move || {
        __racesan_thread_start(tid);
        __racesan_write8(0x20, APP + 8);
        __racesan_thread_finish();
        // Finished threads are no longer tracked.
        __racesan_write8(0x30, APP + 16);
    })
    .join()
    .unwrap();
    assert_eq!(rt.threads().status(tid as Tid), ThreadStatus::Uncreated);

    // A thread nobody announced is not the main thread and is skipped.
    assert_eq!(__racesan_fini(), 0);
    let before = rt.metrics().snapshot();
    assert_eq!(before.accesses_checked, 1);
    thread::spawn(|| __racesan_write8(0x40, APP + 24)).join().unwrap();
    assert_eq!(__racesan_fini(), 0);
    assert_eq!(rt.metrics().snapshot(), before);

    __racesan_mutex_destroy(M);
    assert_eq!(rt.metrics().snapshot().races_reported, 0);
    assert_eq!(__racesan_fini(), 0);
}

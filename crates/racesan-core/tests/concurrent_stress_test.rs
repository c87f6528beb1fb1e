//! Real OS threads driving one runtime, the way instrumented code does.

use std::sync::{Arc, Mutex};
use std::thread;

use racesan_core::platform::PAGE_SIZE;
use racesan_core::{CollectingSink, Runtime, RuntimeConfig, ThreadStatus, Tid};

const APP: usize = 0x7e00_0000_0000;
const COUNTER: usize = APP + 0x40;
const LOCK_ID: usize = 0x6000_0000_0000;
const WORKERS: usize = 8;
const ITERS: usize = 2_000;

fn runtime() -> (Arc<Runtime>, Arc<CollectingSink>) {
    let sink = Arc::new(CollectingSink::new());
    let rt = Runtime::with_sink(
        RuntimeConfig::relocatable(APP, APP + 64 * PAGE_SIZE),
        Box::new(Arc::clone(&sink)),
    )
    .expect("runtime");
    (Arc::new(rt), sink)
}

#[test]
fn mutex_protected_counter_reports_nothing() {
    let (rt, sink) = runtime();
    let mut main = rt.bootstrap_main_thread().unwrap();
    let real_lock = Arc::new(Mutex::new(0u64));

    let tids: Vec<Tid> = (0..WORKERS)
        .map(|_| rt.thread_create(&mut main).unwrap())
        .collect();
    let handles: Vec<_> = tids
        .iter()
        .map(|&tid| {
            let rt = Arc::clone(&rt);
            let real_lock = Arc::clone(&real_lock);
            thread::spawn(move || {
                let mut thr = rt.thread_start(tid).unwrap();
                for i in 0..ITERS {
                    rt.on_function_entry(&mut thr, 0x1000).unwrap();
                    let mut guard = real_lock.lock().unwrap();
                    rt.on_mutex_acquire(&mut thr, LOCK_ID, true);
                    rt.on_memory_access(&mut thr, 0x1010, COUNTER, 8, false);
                    rt.on_memory_access(&mut thr, 0x1020, COUNTER, 8, true);
                    *guard += 1;
                    rt.on_mutex_release(&mut thr, LOCK_ID, true).unwrap();
                    drop(guard);
                    // Thread-private slot, never shared.
                    let own = APP + 0x1000 + usize::from(tid) * 64;
                    rt.on_memory_access(&mut thr, 0x1030, own, 8, i % 2 == 0);
                    rt.on_function_exit(&mut thr).unwrap();
                }
                rt.thread_finish(thr).unwrap();
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    for &tid in &tids {
        rt.thread_join(&mut main, tid).unwrap();
    }

    // After joining everyone, main may touch the counter freely.
    rt.on_memory_access(&mut main, 0x2000, COUNTER, 8, true);

    assert_eq!(*real_lock.lock().unwrap(), (WORKERS * ITERS) as u64);
    assert!(sink.is_empty(), "{:?}", sink.reports().first());
    let snap = rt.metrics().snapshot();
    assert_eq!(snap.races_detected, 0);
    assert_eq!(snap.mutex_releases, (WORKERS * ITERS) as u64);
    assert_eq!(rt.threads().live_threads(), 1);
}

#[test]
fn unsynchronized_writers_are_caught() {
    let (rt, sink) = runtime();
    let mut main = rt.bootstrap_main_thread().unwrap();
    let tids: Vec<Tid> = (0..2).map(|_| rt.thread_create(&mut main).unwrap()).collect();

    let handles: Vec<_> = tids
        .iter()
        .enumerate()
        .map(|(i, &tid)| {
            let rt = Arc::clone(&rt);
            thread::spawn(move || {
                let mut thr = rt.thread_start(tid).unwrap();
                for _ in 0..ITERS {
                    rt.on_memory_access(&mut thr, 0x3000 + i, COUNTER, 8, true);
                }
                rt.thread_finish(thr).unwrap();
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    // Whichever thread wrote second saw the other's record.
    let reports = sink.take();
    assert_eq!(reports.len(), 1);
    let mut pcs = [reports[0].current.pc, reports[0].previous.pc];
    pcs.sort_unstable();
    assert_eq!(pcs, [0x3000, 0x3001]);
    assert!(rt.metrics().snapshot().races_detected >= 1);
}

#[test]
fn detached_threads_recycle_identities() {
    let (rt, sink) = runtime();
    let mut main = rt.bootstrap_main_thread().unwrap();

    for round in 0..4 {
        let tids: Vec<Tid> = (0..WORKERS)
            .map(|_| rt.thread_create(&mut main).unwrap())
            .collect();
        let handles: Vec<_> = tids
            .iter()
            .map(|&tid| {
                let rt = Arc::clone(&rt);
                thread::spawn(move || {
                    let mut thr = rt.thread_start(tid).unwrap();
                    let own = APP + 0x2000 + usize::from(tid) * 64;
                    rt.on_memory_access(&mut thr, 0x4000, own, 8, true);
                    rt.thread_finish(thr).unwrap();
                })
            })
            .collect();
        for (&tid, h) in tids.iter().zip(handles) {
            rt.thread_detach(&main, tid).unwrap();
            h.join().unwrap();
        }
        for &tid in &tids {
            assert_eq!(rt.threads().status(tid), ThreadStatus::Uncreated, "round {round}");
        }
    }
    // Identities were reused, so the registry never grew past one batch.
    assert_eq!(rt.threads().live_threads(), 1);
    assert_eq!(rt.threads().total_created(), 1 + 4 * WORKERS as u64);
    assert!(rt.threads().context(WORKERS as Tid + 1).is_none());
    assert!(sink.is_empty());
}

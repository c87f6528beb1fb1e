//! Synchronization benchmarks: mutex hooks and thread lifecycle.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use racesan_core::platform::PAGE_SIZE;
use racesan_core::{CollectingSink, Runtime, RuntimeConfig, VectorClock};

const APP: usize = 0x7e00_0000_0000;

fn runtime() -> Runtime {
    Runtime::with_sink(
        RuntimeConfig::relocatable(APP, APP + 16 * PAGE_SIZE),
        Box::new(CollectingSink::new()),
    )
    .expect("runtime")
}

fn bench_mutex(c: &mut Criterion) {
    let rt = runtime();
    let mut main = rt.bootstrap_main_thread().expect("main");
    let mut group = c.benchmark_group("mutex");

    group.bench_function("exclusive_acquire_release", |b| {
        b.iter(|| {
            rt.on_mutex_acquire(&mut main, black_box(0x1000), true);
            rt.on_mutex_release(&mut main, 0x1000, true).expect("release");
        });
    });
    group.bench_function("shared_acquire_release", |b| {
        b.iter(|| {
            rt.on_mutex_acquire(&mut main, black_box(0x2000), false);
            rt.on_mutex_release(&mut main, 0x2000, false).expect("release");
        });
    });
    group.finish();
}

fn bench_thread_cycle(c: &mut Criterion) {
    let rt = runtime();
    let mut main = rt.bootstrap_main_thread().expect("main");
    c.bench_function("create_start_finish_join", |b| {
        b.iter(|| {
            let tid = rt.thread_create(&mut main).expect("create");
            let child = rt.thread_start(tid).expect("start");
            rt.thread_finish(child).expect("finish");
            rt.thread_join(&mut main, tid).expect("join");
        });
    });
}

fn bench_clock_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("vector_clock");
    for &populated in &[2usize, 16, 128] {
        let mut other = VectorClock::new();
        for t in 0..populated {
            other.set(t as u16, t as u64 + 1);
        }
        group.bench_with_input(BenchmarkId::new("merge", populated), &other, |b, other| {
            let mut mine = VectorClock::new();
            b.iter(|| mine.merge(black_box(other)));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_mutex, bench_thread_cycle, bench_clock_merge);
criterion_main!(benches);

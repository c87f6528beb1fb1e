//! Hot-path benchmarks: the per-access cost of the race check.
//!
//! Each runtime uses a relocatable shadow over a synthetic application
//! window, so nothing here touches the fixed layout.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use racesan_core::platform::PAGE_SIZE;
use racesan_core::{Runtime, RuntimeConfig, ThreadState};

const APP: usize = 0x7e00_0000_0000;
const WINDOW: usize = 256 * PAGE_SIZE;

fn runtime() -> Runtime {
    Runtime::with_sink(
        RuntimeConfig::relocatable(APP, APP + WINDOW),
        Box::new(racesan_core::CollectingSink::new()),
    )
    .expect("runtime")
}

fn two_threads(rt: &Runtime) -> (ThreadState, ThreadState) {
    let mut main = rt.bootstrap_main_thread().expect("main");
    let tid = rt.thread_create(&mut main).expect("create");
    let child = rt.thread_start(tid).expect("start");
    (main, child)
}

fn bench_same_address(c: &mut Criterion) {
    let rt = runtime();
    let (mut main, _) = two_threads(&rt);
    let mut group = c.benchmark_group("same_address");
    group.throughput(Throughput::Elements(1));

    for (label, is_write) in [("read8", false), ("write8", true)] {
        group.bench_function(label, |b| {
            b.iter(|| rt.on_memory_access(&mut main, 0x10, black_box(APP), 8, is_write));
        });
    }
    group.finish();
}

fn bench_sweep(c: &mut Criterion) {
    let rt = runtime();
    let (mut main, _) = two_threads(&rt);
    let mut group = c.benchmark_group("sweep");

    for &size in &[1usize, 4, 8, 16] {
        let granules = WINDOW / 8;
        group.throughput(Throughput::Elements(granules as u64));
        group.bench_with_input(BenchmarkId::new("write", size), &size, |b, &sz| {
            b.iter(|| {
                let mut addr = APP;
                while addr + sz <= APP + WINDOW {
                    rt.on_memory_access(&mut main, 0x20, addr, sz, true);
                    addr += 8;
                }
            });
        });
    }
    group.finish();
}

fn bench_shared_reads(c: &mut Criterion) {
    // Two threads reading one granule: every check scans the other's record.
    let rt = runtime();
    let (mut main, mut child) = two_threads(&rt);
    let mut group = c.benchmark_group("shared_reads");
    group.throughput(Throughput::Elements(2));
    group.bench_function("read8_pair", |b| {
        b.iter(|| {
            rt.on_memory_access(&mut main, 0x30, APP + 64, 8, false);
            rt.on_memory_access(&mut child, 0x31, APP + 64, 8, false);
        });
    });
    group.finish();
}

fn bench_function_boundaries(c: &mut Criterion) {
    let rt = runtime();
    let (mut main, _) = two_threads(&rt);
    c.bench_function("func_entry_exit", |b| {
        b.iter(|| {
            rt.on_function_entry(&mut main, black_box(0x40)).expect("entry");
            rt.on_function_exit(&mut main).expect("exit");
        });
    });
}

criterion_group!(
    benches,
    bench_same_address,
    bench_sweep,
    bench_shared_reads,
    bench_function_boundaries
);
criterion_main!(benches);

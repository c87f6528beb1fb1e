//! The race-check engine.
//!
//! Every hook runs synchronously on the calling thread against that
//! thread's own [`ThreadState`]. The per-access check takes only the spin
//! lock of the shadow cell it inspects; the internal reader/writer lock is
//! taken for thread identity changes, the mutex table and report
//! deduplication.

use std::hint;

use crate::config::{RuntimeConfig, ShadowMode};
use crate::error::{self, RuntimeError};
use crate::in_rtl::{self, ScopedInRtl};
use crate::metrics::RuntimeMetrics;
use crate::platform;
use crate::report::{RaceReport, ReportCenter, ReportSink, ReportedAccess, StderrSink};
use crate::shadow::{AccessRecord, GRANULE, SHADOW_DEPTH, ShadowLayout, ShadowRegion};
use crate::sync_table::SyncTable;
use crate::thread_registry::ThreadRegistry;
use crate::thread_state::ThreadState;
use crate::vector_clock::Tid;

/// Exit status requested by [`Runtime::finalize`] and `halt_on_error` once a
/// race has been reported.
pub const RACE_EXIT_STATUS: i32 = 66;

/// Failed cell lock attempts before backoff turns into processor yields.
const BACKOFF_SPIN_LIMIT: u32 = 16;

/// First conflict found by one access.
#[derive(Debug, Clone, Copy)]
struct Conflict {
    record: AccessRecord,
    pc: usize,
    granule: usize,
}

/// Detector state shared by all threads of the process.
pub struct Runtime {
    config: RuntimeConfig,
    shadow: ShadowRegion,
    threads: ThreadRegistry,
    syncs: SyncTable,
    reports: ReportCenter,
    metrics: RuntimeMetrics,
}

impl Runtime {
    /// Reserve shadow per `config` and report races on stderr.
    pub fn new(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        Self::with_sink(config, Box::new(StderrSink))
    }

    /// Reserve shadow per `config` and deliver races to `sink`.
    pub fn with_sink(config: RuntimeConfig, sink: Box<dyn ReportSink>) -> Result<Self, RuntimeError> {
        let _in_rtl = ScopedInRtl::new();
        let shadow = match config.shadow {
            ShadowMode::Fixed => {
                let layout = ShadowLayout::fixed();
                platform::initialize_platform(&layout.reserved_ranges(), (layout.app_beg, layout.app_end))?;
                ShadowRegion::reserve_fixed(layout)?
            }
            ShadowMode::Relocatable => {
                platform::disable_core_dumps();
                let (beg, end) = config.app_window();
                ShadowRegion::reserve_relocatable(beg, end)?
            }
        };
        let reports = ReportCenter::new(sink, config.dedup);
        Ok(Self {
            config,
            shadow,
            threads: ThreadRegistry::new(),
            syncs: SyncTable::new(),
            reports,
            metrics: RuntimeMetrics::new(),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn layout(&self) -> &ShadowLayout {
        self.shadow.layout()
    }

    pub fn shadow(&self) -> &ShadowRegion {
        &self.shadow
    }

    pub fn metrics(&self) -> &RuntimeMetrics {
        &self.metrics
    }

    pub fn threads(&self) -> &ThreadRegistry {
        &self.threads
    }

    pub fn syncs(&self) -> &SyncTable {
        &self.syncs
    }

    /// Resolve a hook result: misuse is warned about and dropped, anything
    /// else is fatal.
    pub fn settle<T>(&self, result: Result<T, RuntimeError>) -> Option<T> {
        match result {
            Ok(v) => Some(v),
            Err(e) if e.is_misuse() => {
                RuntimeMetrics::inc(&self.metrics.warnings);
                error::warn(&e);
                None
            }
            Err(e) => error::fatal(e),
        }
    }

    /// State for the thread that runs initialization; it is never created
    /// through the hooks.
    pub fn bootstrap_main_thread(&self) -> Result<ThreadState, RuntimeError> {
        let (tid, epoch) = self.threads.register_running()?;
        RuntimeMetrics::inc(&self.metrics.threads_created);
        crate::dprintf!("racesan: main thread is T{tid}");
        Ok(ThreadState::new(tid, epoch, Default::default()))
    }

    /// Check `[addr, addr+size)` against shadow history, then record it.
    pub fn on_memory_access(
        &self,
        thr: &mut ThreadState,
        pc: usize,
        addr: usize,
        size: usize,
        is_write: bool,
    ) {
        if size == 0 {
            return;
        }
        if thr.ignores(is_write) || in_rtl::in_rtl() {
            thr.counters_mut().ignored += 1;
            return;
        }
        let layout = *self.shadow.layout();
        let end = addr.saturating_add(size);
        let mut first = None;
        let mut piece = addr;
        while piece < end {
            let granule = piece & !(GRANULE - 1);
            let next = granule.saturating_add(GRANULE).min(end);
            if layout.contains_app(piece) {
                self.check_piece(thr, pc, granule, piece - granule, next - piece, is_write, &mut first);
            } else {
                thr.counters_mut().out_of_range += 1;
            }
            piece = next;
        }
        if let Some(conflict) = first {
            self.report_race(thr, pc, addr, size, is_write, conflict);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn check_piece(
        &self,
        thr: &mut ThreadState,
        pc: usize,
        granule: usize,
        offset: usize,
        len: usize,
        is_write: bool,
        first: &mut Option<Conflict>,
    ) {
        thr.counters_mut().checked += 1;
        let cur = AccessRecord::new(thr.tid(), thr.epoch(), offset, len, is_write);
        let mut conflicts = 0u64;
        let mut cell = self.shadow.cell(granule).lock(|failures| backoff(thr, failures));

        let mut replace = None;
        for slot in 0..SHADOW_DEPTH {
            let old = cell.record(slot);
            if old.is_empty() {
                continue;
            }
            if old.tid() == cur.tid() {
                if replace.is_none() && old.same_range(cur) && (is_write || !old.is_write()) {
                    replace = Some(slot);
                }
                continue;
            }
            if old.races_with(cur, thr.clock()) {
                conflicts += 1;
                if first.is_none() {
                    *first = Some(Conflict {
                        record: old,
                        pc: cell.pc(slot),
                        granule,
                    });
                }
            }
        }
        match replace {
            Some(slot) => cell.store(slot, cur, pc),
            None => {
                cell.push(cur, pc);
            }
        }
        drop(cell);

        thr.counters_mut().races_detected += conflicts;
    }

    fn report_race(
        &self,
        thr: &ThreadState,
        pc: usize,
        addr: usize,
        size: usize,
        is_write: bool,
        conflict: Conflict,
    ) {
        let _in_rtl = ScopedInRtl::new();
        let prev = conflict.record;
        let report = RaceReport {
            current: ReportedAccess {
                tid: thr.tid(),
                epoch: thr.epoch(),
                pc,
                addr,
                size,
                is_write,
                stack: thr.stack().frames().iter().rev().copied().collect(),
            },
            previous: ReportedAccess {
                tid: prev.tid(),
                epoch: prev.epoch(),
                pc: conflict.pc,
                addr: conflict.granule + prev.offset(),
                size: prev.size(),
                is_write: prev.is_write(),
                stack: Vec::new(),
            },
        };
        if !self.reports.submit(&report) {
            return;
        }
        RuntimeMetrics::inc(&self.metrics.races_reported);
        if self.config.halt_on_error {
            crate::report!("racesan: halt_on_error set, exiting");
            platform::exit_with(RACE_EXIT_STATUS);
        }
    }

    pub fn on_function_entry(&self, thr: &mut ThreadState, pc: usize) -> Result<(), RuntimeError> {
        thr.counters_mut().func_entries += 1;
        thr.tick()?;
        thr.stack_mut().push(pc);
        Ok(())
    }

    pub fn on_function_exit(&self, thr: &mut ThreadState) -> Result<(), RuntimeError> {
        if thr.stack_mut().pop() {
            Ok(())
        } else {
            Err(RuntimeError::UnbalancedFuncExit { tid: thr.tid() })
        }
    }

    /// Order `thr` after the latest release of mutex `id`.
    pub fn on_mutex_acquire(&self, thr: &mut ThreadState, id: usize, exclusive: bool) {
        RuntimeMetrics::inc(&self.metrics.mutex_acquires);
        self.syncs.acquire(id, thr, exclusive);
    }

    /// Publish `thr`'s clock on mutex `id`, then move `thr` past it.
    pub fn on_mutex_release(
        &self,
        thr: &mut ThreadState,
        id: usize,
        exclusive: bool,
    ) -> Result<(), RuntimeError> {
        RuntimeMetrics::inc(&self.metrics.mutex_releases);
        self.syncs.release(id, thr.tid(), exclusive, thr.clock())?;
        thr.tick()?;
        Ok(())
    }

    pub fn on_mutex_destroy(&self, id: usize) -> bool {
        self.syncs.destroy(id)
    }

    /// Allocate an identity for a child of `parent`. The child starts out
    /// ordered after everything `parent` did so far.
    pub fn thread_create(&self, parent: &mut ThreadState) -> Result<Tid, RuntimeError> {
        let (tid, start) = self.threads.create(parent.clock())?;
        parent.tick()?;
        RuntimeMetrics::inc(&self.metrics.threads_created);
        crate::dprintf!("racesan: T{} created T{tid} (start epoch {start})", parent.tid());
        Ok(tid)
    }

    /// State for the child thread `tid`, called on the child itself.
    pub fn thread_start(&self, tid: Tid) -> Result<ThreadState, RuntimeError> {
        let (epoch, clock) = self.threads.start(tid)?;
        crate::dprintf!("racesan: T{tid} started");
        Ok(ThreadState::new(tid, epoch, clock))
    }

    /// Publish the final clock of an exiting thread.
    pub fn thread_finish(&self, mut thr: ThreadState) -> Result<(), RuntimeError> {
        self.flush_counters(&mut thr);
        let (tid, epoch, clock) = thr.into_final();
        self.threads.finish(tid, epoch, &clock)?;
        crate::dprintf!("racesan: T{tid} finished at epoch {epoch}");
        Ok(())
    }

    /// Order `thr` after everything thread `tid` did, and retire `tid`.
    pub fn thread_join(&self, thr: &mut ThreadState, tid: Tid) -> Result<(), RuntimeError> {
        let clock = self.threads.join(tid)?;
        thr.acquire(&clock);
        RuntimeMetrics::inc(&self.metrics.threads_joined);
        Ok(())
    }

    pub fn thread_detach(&self, thr: &ThreadState, tid: Tid) -> Result<(), RuntimeError> {
        self.threads.detach(tid)?;
        crate::dprintf!("racesan: T{} detached T{tid}", thr.tid());
        Ok(())
    }

    pub fn ignore_reads_begin(&self, thr: &mut ThreadState) {
        thr.ignore_reads_begin();
    }

    pub fn ignore_reads_end(&self, thr: &mut ThreadState) -> Result<(), RuntimeError> {
        thr.ignore_reads_end()
            .then_some(())
            .ok_or(RuntimeError::UnbalancedIgnore)
    }

    pub fn ignore_writes_begin(&self, thr: &mut ThreadState) {
        thr.ignore_writes_begin();
    }

    pub fn ignore_writes_end(&self, thr: &mut ThreadState) -> Result<(), RuntimeError> {
        thr.ignore_writes_end()
            .then_some(())
            .ok_or(RuntimeError::UnbalancedIgnore)
    }

    /// Fold `thr`'s private access counts into [`Runtime::metrics`].
    pub fn flush_counters(&self, thr: &mut ThreadState) {
        self.metrics.absorb(thr.counters_mut());
    }

    /// Print the summary. Returns the exit status the process should use:
    /// [`RACE_EXIT_STATUS`] if any race was reported, 0 otherwise.
    pub fn finalize(&self) -> i32 {
        let snap = self.metrics.snapshot();
        if snap.races_reported != 0 {
            crate::report!("racesan: reported {} warnings", snap.races_reported);
        }
        if self.config.verbosity >= 1 {
            crate::printf!(
                "racesan: checked {} pieces, {} races detected, {} threads",
                snap.accesses_checked,
                snap.races_detected,
                snap.threads_created
            );
        }
        if snap.races_reported != 0 { RACE_EXIT_STATUS } else { 0 }
    }
}

/// Cell lock backoff: short randomized spins, then yields.
fn backoff(thr: &mut ThreadState, failures: u32) {
    if failures < BACKOFF_SPIN_LIMIT {
        let spins = 1 + thr.next_rand() % u64::from(failures.clamp(1, 8) * 4);
        for _ in 0..spins {
            hint::spin_loop();
        }
    } else {
        platform::yield_processor();
    }
}

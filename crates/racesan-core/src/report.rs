//! Race reports: records, deduplication and delivery.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::sync::SpinRwLock;
use crate::vector_clock::{Epoch, Tid};

/// One side of a reported race.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportedAccess {
    pub tid: Tid,
    pub epoch: Epoch,
    pub pc: usize,
    pub addr: usize,
    pub size: usize,
    pub is_write: bool,
    /// Shadow call stack, innermost frame first. Empty for the previous
    /// access, whose stack is not retained.
    pub stack: Vec<usize>,
}

impl ReportedAccess {
    fn kind(&self) -> &'static str {
        if self.is_write { "write" } else { "read" }
    }
}

/// Two conflicting accesses not ordered by happens-before.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RaceReport {
    pub current: ReportedAccess,
    pub previous: ReportedAccess,
}

impl RaceReport {
    /// Deduplication key: the pc pair, in either order.
    #[must_use]
    pub fn pc_pair(&self) -> (usize, usize) {
        let (a, b) = (self.current.pc, self.previous.pc);
        if a <= b { (a, b) } else { (b, a) }
    }
}

impl fmt::Display for RaceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (cur, prev) = (&self.current, &self.previous);
        write!(
            f,
            "data race: {} of size {} at {:#x} by thread T{} (pc {:#x}) \
             vs previous {} of size {} at {:#x} by thread T{} (pc {:#x})",
            cur.kind(),
            cur.size,
            cur.addr,
            cur.tid,
            cur.pc,
            prev.kind(),
            prev.size,
            prev.addr,
            prev.tid,
            prev.pc
        )
    }
}

/// Destination for race reports.
pub trait ReportSink: Send + Sync {
    fn report(&self, report: &RaceReport);
}

impl<T: ReportSink + ?Sized> ReportSink for Arc<T> {
    fn report(&self, report: &RaceReport) {
        (**self).report(report);
    }
}

/// Prints each report as one line on stderr. At verbosity 1 and above the
/// current shadow stack follows, one frame per line.
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrSink;

impl ReportSink for StderrSink {
    fn report(&self, report: &RaceReport) {
        crate::report!("WARNING: racesan: {report}");
        if crate::platform::output::verbosity() >= 1 {
            for (i, pc) in report.current.stack.iter().enumerate() {
                crate::report!("    #{i} {pc:#x}");
            }
        }
    }
}

/// Keeps every report in memory.
#[derive(Default)]
pub struct CollectingSink {
    reports: SpinRwLock<Vec<RaceReport>>,
}

impl CollectingSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.reports.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies of all reports so far.
    #[must_use]
    pub fn reports(&self) -> Vec<RaceReport> {
        self.reports.read().clone()
    }

    /// Remove and return all reports so far.
    pub fn take(&self) -> Vec<RaceReport> {
        std::mem::take(&mut *self.reports.write())
    }
}

impl ReportSink for CollectingSink {
    fn report(&self, report: &RaceReport) {
        self.reports.write().push(report.clone());
    }
}

/// Filters duplicate pc pairs and forwards the rest to the sink.
pub struct ReportCenter {
    sink: Box<dyn ReportSink>,
    seen: SpinRwLock<HashSet<(usize, usize)>>,
    dedup: bool,
}

impl ReportCenter {
    #[must_use]
    pub fn new(sink: Box<dyn ReportSink>, dedup: bool) -> Self {
        Self {
            sink,
            seen: SpinRwLock::new(HashSet::new()),
            dedup,
        }
    }

    /// Deliver `report` unless its pc pair was delivered before. Returns
    /// whether it was delivered.
    pub fn submit(&self, report: &RaceReport) -> bool {
        if self.dedup {
            let key = report.pc_pair();
            if self.seen.read().contains(&key) {
                return false;
            }
            if !self.seen.write().insert(key) {
                return false;
            }
        }
        self.sink.report(report);
        true
    }

    /// Distinct pc pairs delivered so far.
    #[must_use]
    pub fn distinct_pairs(&self) -> usize {
        self.seen.read().len()
    }
}

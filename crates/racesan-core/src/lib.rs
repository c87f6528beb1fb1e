//! Happens-before data race detection engine.
//!
//! Instrumented code reports every memory access, function entry/exit,
//! mutex operation and thread lifecycle event. The engine keeps a vector
//! clock per thread, a ring of recent accesses per 8-byte granule in shadow
//! memory, and reports two accesses as a race when they touch common bytes,
//! at least one writes, and neither is ordered before the other through a
//! mutex, fork or join.
//!
//! # Architecture
//!
//! - **Platform** (`platform`): address-space reservation, layout check,
//!   raw stderr diagnostics, fatal exit
//! - **Internal-call accounting** (`in_rtl`): reentrancy depth plus errno
//!   save/restore
//! - **Internal lock** (`sync`): spin reader/writer lock for shared metadata
//! - **Vector clocks** (`vector_clock`)
//! - **Thread state** (`thread_state`, `thread_registry`): per-thread clocks
//!   and the identity reuse pool
//! - **Shadow memory** (`shadow`): packed access records per granule
//! - **Mutex shadow** (`sync_table`): last-release clock per mutex
//! - **Engine** (`rtl`): the hooks
//! - **Reports** (`report`): race records, dedup, sinks
//! - **Configuration** (`config`) and **metrics** (`metrics`)
//! - **Initialization** (`init`): the process-wide runtime

#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod in_rtl;
pub mod init;
pub mod metrics;
pub mod platform;
pub mod report;
pub mod rtl;
pub mod shadow;
pub mod sync;
pub mod sync_table;
pub mod thread_registry;
pub mod thread_state;
pub mod vector_clock;

pub use config::{RuntimeConfig, ShadowMode};
pub use error::{PlatformError, RuntimeError};
pub use in_rtl::ScopedInRtl;
pub use metrics::{AccessCounters, MetricsSnapshot, RuntimeMetrics};
pub use report::{CollectingSink, RaceReport, ReportSink, ReportedAccess, StderrSink};
pub use rtl::{RACE_EXIT_STATUS, Runtime};
pub use shadow::{AccessRecord, ShadowLayout, ShadowRegion};
pub use thread_registry::ThreadStatus;
pub use thread_state::ThreadState;
pub use vector_clock::{Epoch, MAX_THREADS, Tid, VectorClock};
